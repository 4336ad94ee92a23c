use crate::clock::{Clock, system_clock};
use crate::db::Database;
use crate::delta;
use crate::error::SyncError;
use crate::models::{AccountId, HistoryDelta, HistoryEvent, ObservationStatus, ReconcileSummary};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::{debug, error, info, warn};

/// Folds provider history records into the event ledger, inferring dates for
/// records nobody was notified about.
pub struct EventReconciler {
    db: Database,
    clock: Clock,
}

impl EventReconciler {
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

    pub async fn reconcile(
        &self,
        account_id: AccountId,
        deltas: &[HistoryDelta],
    ) -> Result<ReconcileSummary, SyncError> {
        // Dating is inferred against the ledger as it stood before this batch,
        // so the outcome does not depend on the order of `deltas`.
        let dated = self.db.dated_history_events(account_id).await?;
        let mut summary = ReconcileSummary::default();

        // Ascending, and the first store failure ends the batch: the examined
        // marker is the highest stored payload, so it must never pass a gap.
        let mut ordered: Vec<&HistoryDelta> = deltas.iter().collect();
        ordered.sort_by_key(|delta| delta.id);

        for delta in ordered {
            let existing = self
                .db
                .find_history_events(account_id, delta.id)
                .await
                .map_err(|e| store_failure(account_id, delta.id, e))?;

            match existing.as_slice() {
                [] => {
                    let event = self.new_event(account_id, delta, &dated);
                    self.db
                        .insert_history_event(&event)
                        .await
                        .map_err(|e| store_failure(account_id, delta.id, e))?;
                    debug!(
                        "New history {} for account {}: {} at {}",
                        event.history_id, account_id, event.status, event.date_occurred
                    );
                    summary.created += 1;
                }
                [current] => {
                    self.repopulate(current, delta)
                        .await
                        .map_err(|e| store_failure(account_id, delta.id, e))?;
                    summary.updated += 1;
                }
                _ => {
                    error!(
                        "Account {} has {} ledger rows for history {}",
                        account_id,
                        existing.len(),
                        delta.id
                    );
                    return Err(SyncError::DuplicateSequence {
                        account_id,
                        history_id: delta.id,
                    });
                }
            }
        }

        info!(
            "Reconciled {} history records for account {}: {} created, {} updated",
            deltas.len(),
            account_id,
            summary.created,
            summary.updated
        );
        Ok(summary)
    }

    fn new_event(
        &self,
        account_id: AccountId,
        delta: &HistoryDelta,
        dated: &[HistoryEvent],
    ) -> HistoryEvent {
        let (date_occurred, status) = infer_dating(dated, delta.id, (self.clock)());

        HistoryEvent {
            id: 0,
            account_id,
            history_id: delta.id,
            date_occurred,
            status,
            payload: delta.payload(),
            counts: delta::count(delta),
        }
    }

    async fn repopulate(&self, current: &HistoryEvent, delta: &HistoryDelta) -> anyhow::Result<()> {
        let mut refreshed = current.clone();
        refreshed.counts = delta::count(delta);
        refreshed.payload = delta.payload();

        if current.is_placeholder() {
            debug!(
                "Filling notification placeholder for history {} of account {}",
                current.history_id, current.account_id
            );
        } else if content_hash(current) != content_hash(&refreshed) {
            warn!(
                "History {} of account {} changed on re-delivery",
                current.history_id, current.account_id
            );
        }

        self.db.update_history_event(&refreshed).await
    }
}

/// Date and status for a new event at `sequence`, given the account's dated
/// events sorted by history id.
///
/// An event followed by a dated one happened before it, so it inherits that
/// event's date and status. Otherwise it is dated now.
pub fn infer_dating(
    dated: &[HistoryEvent],
    sequence: i64,
    now: i64,
) -> (i64, ObservationStatus) {
    let split = dated.partition_point(|e| e.history_id <= sequence);

    match dated.get(split) {
        Some(following) => (following.date_occurred, following.status),
        None if split == 0 => (now, ObservationStatus::FirstUpdate),
        None => (now, ObservationStatus::Delayed),
    }
}

fn store_failure(account_id: AccountId, history_id: i64, e: anyhow::Error) -> SyncError {
    warn!(
        "Storing history {} for account {} failed; stopping the batch: {}",
        history_id, account_id, e
    );
    SyncError::Store(e)
}

fn content_hash(event: &HistoryEvent) -> u64 {
    let mut hasher = DefaultHasher::new();
    event.hash(&mut hasher);
    hasher.finish()
}
