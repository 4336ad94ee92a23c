use crate::clock::{Clock, system_clock};
use crate::db::Database;
use crate::error::SyncError;
use crate::models::{AccountId, LabelCounts, LabelSummary, SequenceNumber};
use tracing::{debug, info};

pub struct LabelSnapshotter {
    db: Database,
    clock: Clock,
}

impl LabelSnapshotter {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Appends a sample taken now. The examined high-water mark only moves forward.
    pub async fn snapshot(
        &self,
        account_id: AccountId,
        counts: &LabelCounts,
        latest_history_id: SequenceNumber,
    ) -> Result<LabelSummary, SyncError> {
        let previous = self
            .db
            .max_label_history_id(account_id, &counts.label_name)
            .await?
            .unwrap_or(0);

        if latest_history_id < previous {
            debug!(
                "Label {} of account {} reported history {} behind recorded {}",
                counts.label_name, account_id, latest_history_id, previous
            );
        }

        let mut summary = LabelSummary {
            id: 0,
            account_id,
            label_name: counts.label_name.clone(),
            last_history_id: latest_history_id.max(previous),
            sampled_at: (self.clock)(),
            messages_total: counts.messages_total,
            messages_unread: counts.messages_unread,
            threads_total: counts.threads_total,
            threads_unread: counts.threads_unread,
        };
        summary.id = self.db.insert_label_summary(&summary).await?;

        info!(
            "Sampled {} for account {}: {} messages, {} unread",
            summary.label_name, account_id, summary.messages_total, summary.messages_unread
        );
        Ok(summary)
    }
}
