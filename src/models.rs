use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const LABEL_INBOX: &str = "INBOX";
pub const LABEL_UNREAD: &str = "UNREAD";

pub type AccountId = i64;

/// Provider-assigned history id. Monotonic per account only.
pub type SequenceNumber = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: AccountId,
    /// Mailbox address reported by the provider. Unique and never rewritten.
    pub identity: String,
    pub created_at: i64,
}

/// How the occurrence time of a history event was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum ObservationStatus {
    /// Happened before monitoring began; no meaningful date.
    FirstUpdate,
    /// Observed while the system was running at steady state.
    Realtime,
    /// Observed while catching up after downtime.
    Delayed,
}

impl ObservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationStatus::FirstUpdate => "first-update",
            ObservationStatus::Realtime => "realtime",
            ObservationStatus::Delayed => "delayed",
        }
    }
}

impl fmt::Display for ObservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObservationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "first-update" => Ok(ObservationStatus::FirstUpdate),
            "realtime" => Ok(ObservationStatus::Realtime),
            "delayed" => Ok(ObservationStatus::Delayed),
            other => Err(format!("unknown observation status '{other}'")),
        }
    }
}

/// The four inbox counters a single history record moves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeltaCounts {
    pub messages_added: i64,
    pub messages_removed: i64,
    pub unread_added: i64,
    pub unread_removed: i64,
}

impl DeltaCounts {
    pub fn has_changes(&self) -> bool {
        self.messages_added + self.messages_removed + self.unread_added + self.unread_removed > 0
    }

    pub fn accumulate(&mut self, other: &DeltaCounts) {
        self.messages_added += other.messages_added;
        self.messages_removed += other.messages_removed;
        self.unread_added += other.unread_added;
        self.unread_removed += other.unread_removed;
    }
}

/// One row of the event ledger, keyed by (account_id, history_id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: i64,
    pub account_id: AccountId,
    pub history_id: SequenceNumber,
    /// Epoch millis, 0 when unknown.
    pub date_occurred: i64,
    pub status: ObservationStatus,
    /// Serialized provider record. Empty for notification placeholders.
    pub payload: String,
    pub counts: DeltaCounts,
}

impl HistoryEvent {
    pub fn is_placeholder(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Point-in-time totals for one label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LabelSummary {
    pub id: i64,
    pub account_id: AccountId,
    pub label_name: String,
    /// High-water mark of examined history ids at sampling time.
    pub last_history_id: SequenceNumber,
    pub sampled_at: i64,
    pub messages_total: i64,
    pub messages_unread: i64,
    pub threads_total: i64,
    pub threads_unread: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRecord {
    pub id: i64,
    pub account_id: AccountId,
    pub message_id: String,
    pub thread_id: String,
    pub history_id: Option<SequenceNumber>,
    pub internal_date: Option<i64>,
    pub header_from: Option<String>,
}

impl MessageRecord {
    pub fn lacks_details(&self) -> bool {
        self.header_from.is_none() || self.internal_date.is_none() || self.history_id.is_none()
    }
}

// Provider-side values, independent of any particular API client.

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

impl MessageRef {
    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l == label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelChange {
    pub message: MessageRef,
    pub label_ids: Vec<String>,
}

impl LabelChange {
    pub fn touches(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l == label)
    }
}

/// One record of the provider's change log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryDelta {
    pub id: SequenceNumber,
    #[serde(default)]
    pub labels_added: Vec<LabelChange>,
    #[serde(default)]
    pub labels_removed: Vec<LabelChange>,
    #[serde(default)]
    pub messages_added: Vec<MessageRef>,
    #[serde(default)]
    pub messages_deleted: Vec<MessageRef>,
    /// Provider's own serialization of the record, stored verbatim.
    #[serde(skip)]
    pub raw: String,
}

impl HistoryDelta {
    pub fn payload(&self) -> String {
        if !self.raw.is_empty() {
            return self.raw.clone();
        }
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    pub deltas: Vec<HistoryDelta>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageDetail {
    pub id: String,
    pub thread_id: String,
    pub history_id: Option<SequenceNumber>,
    pub internal_date: Option<i64>,
    pub header_from: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelCounts {
    pub label_name: String,
    pub messages_total: i64,
    pub messages_unread: i64,
    pub threads_total: i64,
    pub threads_unread: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeResult {
    pub added: usize,
    pub modified: usize,
    pub unchanged: usize,
}

impl MergeResult {
    pub fn already_known(&self) -> usize {
        self.modified + self.unchanged
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_changes_requires_a_positive_counter() {
        assert!(!DeltaCounts::default().has_changes());
        let counts = DeltaCounts {
            unread_removed: 1,
            ..DeltaCounts::default()
        };
        assert!(counts.has_changes());
    }

    #[test]
    fn observation_status_text_form_is_stable() {
        for status in [
            ObservationStatus::FirstUpdate,
            ObservationStatus::Realtime,
            ObservationStatus::Delayed,
        ] {
            assert_eq!(status.as_str().parse::<ObservationStatus>(), Ok(status));
        }
        assert!("later".parse::<ObservationStatus>().is_err());
    }

    #[test]
    fn delta_payload_prefers_raw_provider_text() {
        let delta = HistoryDelta {
            id: 7,
            raw: "{\"id\":\"7\"}".to_string(),
            ..HistoryDelta::default()
        };
        assert_eq!(delta.payload(), "{\"id\":\"7\"}");

        let bare = HistoryDelta {
            id: 8,
            ..HistoryDelta::default()
        };
        assert!(bare.payload().contains("\"id\":8"));
    }
}
