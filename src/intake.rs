//! Push notifications: decoding, placeholder events and the in-process delivery bus.

use crate::clock::{Clock, system_clock};
use crate::db::Database;
use crate::error::SyncError;
use crate::models::{AccountId, DeltaCounts, HistoryEvent, ObservationStatus, SequenceNumber};
use base64::Engine as _;
use base64::engine::general_purpose;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub identity: String,
    pub history_id: SequenceNumber,
}

/// Whatever should run after a notification has been recorded.
pub trait UpdateTrigger: Send + Sync {
    /// Returns false when the request was deferred to an already live job.
    fn request_update(&self, account_id: AccountId) -> bool;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryIdField {
    Number(SequenceNumber),
    Text(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailboxPayload {
    email_address: String,
    history_id: HistoryIdField,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct PushEnvelope {
    message: PushMessage,
    #[serde(default)]
    subscription: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    data: String,
    #[serde(default, alias = "message_id")]
    message_id: Option<String>,
}

/// Accepts either the mailbox payload itself or the push envelope wrapping it as base64.
pub fn parse_notification(raw: &[u8]) -> Result<Notification, SyncError> {
    let value: Value = serde_json::from_slice(raw).map_err(malformed)?;

    let payload: MailboxPayload = if value.get("message").is_some() {
        let envelope: PushEnvelope = serde_json::from_value(value).map_err(malformed)?;
        debug!(
            "Push message {:?} from {:?}",
            envelope.message.message_id, envelope.subscription
        );
        if !envelope.extra.is_empty() {
            debug!("Ignoring envelope fields {:?}", envelope.extra.keys().collect::<Vec<_>>());
        }
        let data = decode_base64(&envelope.message.data)
            .ok_or_else(|| malformed("message data is not base64"))?;
        serde_json::from_slice(&data).map_err(malformed)?
    } else {
        serde_json::from_value(value).map_err(malformed)?
    };

    if !payload.extra.is_empty() {
        info!(
            "Notification carries unexpected fields {:?}",
            payload.extra.keys().collect::<Vec<_>>()
        );
    }

    let history_id = match payload.history_id {
        HistoryIdField::Number(n) => n,
        HistoryIdField::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| malformed(format!("history id '{text}' is not a number")))?,
    };
    if payload.email_address.is_empty() {
        return Err(malformed("empty email address"));
    }

    Ok(Notification {
        identity: payload.email_address,
        history_id,
    })
}

fn malformed(reason: impl ToString) -> SyncError {
    SyncError::MalformedNotification(reason.to_string())
}

fn decode_base64(data: &str) -> Option<Vec<u8>> {
    let data = data.trim();
    general_purpose::STANDARD
        .decode(data)
        .or_else(|_| general_purpose::URL_SAFE.decode(data))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(data))
        .ok()
}

pub struct NotificationIntake {
    db: Database,
    trigger: Arc<dyn UpdateTrigger>,
    clock: Clock,
    catch_up_threshold_ms: i64,
    /// Epoch millis the listener started pulling at, 0 before that.
    pull_started_at: AtomicI64,
}

impl NotificationIntake {
    pub fn new(db: Database, trigger: Arc<dyn UpdateTrigger>, catch_up_threshold_ms: i64) -> Self {
        Self {
            db,
            trigger,
            clock: system_clock(),
            catch_up_threshold_ms,
            pull_started_at: AtomicI64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn mark_pull_started(&self) {
        self.pull_started_at.store((self.clock)(), Ordering::SeqCst);
    }

    pub async fn on_notification(&self, raw: &[u8]) -> Reply {
        let notification = match parse_notification(raw) {
            Ok(notification) => notification,
            Err(e) => {
                error!(
                    "Rejecting notification, likely fatal: {} (payload: {})",
                    e,
                    String::from_utf8_lossy(raw)
                );
                return Reply::Nack;
            }
        };

        match self.record(&notification).await {
            Ok(account_id) => {
                if !self.trigger.request_update(account_id) {
                    debug!("Update for account {} deferred to the live job", account_id);
                }
                Reply::Ack
            }
            Err(e) => {
                warn!(
                    "Could not record history {} for {}: {}",
                    notification.history_id, notification.identity, e
                );
                Reply::Nack
            }
        }
    }

    async fn record(&self, notification: &Notification) -> Result<AccountId, SyncError> {
        let now = (self.clock)();
        let account = self.db.find_or_create_account(&notification.identity, now).await?;
        let existing = self
            .db
            .find_history_events(account.id, notification.history_id)
            .await?;

        if let Some(event) = existing.first() {
            debug!(
                "History {} of {} already known; refreshing its time",
                event.history_id, account.identity
            );
            let refreshed = HistoryEvent {
                date_occurred: now,
                ..event.clone()
            };
            self.db.update_history_event(&refreshed).await?;
            return Ok(account.id);
        }

        let status = self.classify(account.id, now).await?;
        self.db
            .insert_history_event(&HistoryEvent {
                id: 0,
                account_id: account.id,
                history_id: notification.history_id,
                date_occurred: now,
                status,
                payload: String::new(),
                counts: DeltaCounts::default(),
            })
            .await?;
        info!(
            "Notified of history {} for {} ({})",
            notification.history_id, account.identity, status
        );
        Ok(account.id)
    }

    async fn classify(&self, account_id: AccountId, now: i64) -> Result<ObservationStatus, SyncError> {
        let Some(first_dated) = self.db.first_dated_event_time(account_id).await? else {
            return Ok(ObservationStatus::FirstUpdate);
        };

        let pull_started = self.pull_started_at.load(Ordering::SeqCst);
        let catching_up = now - first_dated < self.catch_up_threshold_ms
            || (pull_started > 0 && now - pull_started < self.catch_up_threshold_ms);

        Ok(if catching_up {
            ObservationStatus::Delayed
        } else {
            ObservationStatus::Realtime
        })
    }

    /// Serves deliveries until every sender is dropped.
    pub async fn listen(self: Arc<Self>, mut deliveries: mpsc::Receiver<Delivery>) {
        self.mark_pull_started();
        info!("Notification listener started");

        while let Some(delivery) = deliveries.recv().await {
            let reply = self.on_notification(&delivery.payload).await;
            if delivery.reply.send(reply).is_err() {
                debug!("Notification sender went away before the reply");
            }
        }
        info!("Notification listener stopped");
    }
}

pub struct Delivery {
    pub payload: Vec<u8>,
    pub reply: oneshot::Sender<Reply>,
}

#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<Delivery>,
}

pub fn notification_bus(capacity: usize) -> (NotificationSender, mpsc::Receiver<Delivery>) {
    let (tx, rx) = mpsc::channel(capacity);
    (NotificationSender { tx }, rx)
}

impl NotificationSender {
    /// Hands one payload to the listener and waits for its verdict. `None` once the listener is gone.
    pub async fn deliver(&self, payload: Vec<u8>) -> Option<Reply> {
        let (reply, verdict) = oneshot::channel();
        self.tx.send(Delivery { payload, reply }).await.ok()?;
        verdict.await.ok()
    }
}
