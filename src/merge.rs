use crate::db::Database;
use crate::error::SyncError;
use crate::models::{AccountId, MergeResult, MessageRecord, MessageRef};
use tracing::{debug, warn};

/// Folds polled message references into the local message cache.
pub struct MessageMerger {
    db: Database,
}

impl MessageMerger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Safe to repeat with overlapping sets: known messages are only touched when their thread moved.
    pub async fn merge(
        &self,
        account_id: AccountId,
        polled: &[MessageRef],
    ) -> Result<MergeResult, SyncError> {
        let mut result = MergeResult::default();

        for message in polled {
            let mut matches = self.db.find_messages(account_id, &message.id).await?;

            match matches.len() {
                0 => {
                    self.db
                        .insert_message(&MessageRecord {
                            id: 0,
                            account_id,
                            message_id: message.id.clone(),
                            thread_id: message.thread_id.clone(),
                            history_id: None,
                            internal_date: None,
                            header_from: None,
                        })
                        .await?;
                    result.added += 1;
                }
                1 => {
                    let mut record = matches.remove(0);
                    if record.thread_id != message.thread_id {
                        debug!(
                            "Message {} moved from thread {} to {}",
                            message.id, record.thread_id, message.thread_id
                        );
                        record.thread_id = message.thread_id.clone();
                        self.db.update_message(&record).await?;
                        result.modified += 1;
                    } else {
                        result.unchanged += 1;
                    }
                }
                n => warn!(
                    "Account {} caches message {} {} times; leaving it as is",
                    account_id, message.id, n
                ),
            }
        }

        debug!(
            "Merged {} messages for account {}: {} added, {} modified, {} unchanged",
            polled.len(),
            account_id,
            result.added,
            result.modified,
            result.unchanged
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::message_ref;

    async fn setup() -> (Database, AccountId, MessageMerger) {
        let db = Database::in_memory().await.expect("db");
        let account = db.find_or_create_account("a@example.com", 0).await.expect("account");
        let merger = MessageMerger::new(db.clone());
        (db, account.id, merger)
    }

    #[tokio::test]
    async fn thread_change_is_reported_as_modified() {
        let (db, account_id, merger) = setup().await;
        merger.merge(account_id, &[message_ref("m1", "T1", &[])]).await.expect("seed");

        let result = merger.merge(account_id, &[message_ref("m1", "T2", &[])]).await.expect("merge");

        assert_eq!(
            result,
            MergeResult {
                added: 0,
                modified: 1,
                unchanged: 0
            }
        );
        let stored = db.find_messages(account_id, "m1").await.expect("find");
        assert_eq!(stored[0].thread_id, "T2");
    }

    #[tokio::test]
    async fn same_thread_is_unchanged() {
        let (_db, account_id, merger) = setup().await;
        merger.merge(account_id, &[message_ref("m1", "T1", &[])]).await.expect("seed");

        let result = merger.merge(account_id, &[message_ref("m1", "T1", &[])]).await.expect("merge");

        assert_eq!(
            result,
            MergeResult {
                added: 0,
                modified: 0,
                unchanged: 1
            }
        );
    }

    #[tokio::test]
    async fn overlapping_polls_never_duplicate_records() {
        let (db, account_id, merger) = setup().await;
        let first = [message_ref("m1", "T1", &[]), message_ref("m2", "T2", &[])];
        let second = [message_ref("m2", "T2", &[]), message_ref("m3", "T3", &[])];

        let a = merger.merge(account_id, &first).await.expect("first");
        let b = merger.merge(account_id, &second).await.expect("second");

        assert_eq!(a.added, 2);
        assert_eq!((b.added, b.unchanged), (1, 1));
        assert_eq!(b.already_known(), 1);
        assert_eq!(db.count_messages(account_id).await.expect("count"), 3);
    }
}
