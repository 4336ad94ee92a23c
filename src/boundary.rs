use crate::db::Database;
use crate::error::SyncError;
use crate::models::{Account, SequenceNumber};
use crate::provider::MailProvider;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Finds the newest point from which provider history can still be listed.
pub struct BoundaryLocator {
    db: Database,
    provider: Arc<dyn MailProvider>,
}

impl BoundaryLocator {
    pub fn new(db: Database, provider: Arc<dyn MailProvider>) -> Self {
        Self { db, provider }
    }

    /// Searches the cached messages at or above `hint` for the last sequence
    /// number the provider still resolves. Returns `hint` when nothing is cached.
    pub async fn find_boundary(
        &self,
        account: &Account,
        hint: Option<SequenceNumber>,
    ) -> Result<Option<SequenceNumber>, SyncError> {
        let candidates: Vec<SequenceNumber> = self
            .db
            .messages_from_history_id(account.id, hint)
            .await?
            .into_iter()
            .filter_map(|m| m.history_id)
            .collect();

        match candidates.as_slice() {
            [] => {
                debug!("No cached messages above {:?} for {}", hint, account.identity);
                Ok(hint)
            }
            [only] => Ok(Some(*only)),
            _ => {
                let index = last_resolvable(candidates.len(), |i| {
                    let sequence = candidates[i];
                    async move { self.provider.is_sequence_resolvable(account, sequence).await }
                })
                .await?;

                info!(
                    "Boundary for {} is history {} ({} of {} cached candidates)",
                    account.identity,
                    candidates[index],
                    index + 1,
                    candidates.len()
                );
                Ok(Some(candidates[index]))
            }
        }
    }
}

/// Binary search over a predicate that holds on a prefix of `0..len`.
///
/// Returns the last index where `probe` is true, or 0 when it holds nowhere.
/// Takes at most ⌈log2 len⌉ probes. `len` must be non-zero.
pub async fn last_resolvable<F, Fut, E>(len: usize, mut probe: F) -> Result<usize, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let mut lo = 0;
    let mut hi = len.saturating_sub(1);

    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if probe(mid).await? {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRecord;
    use crate::testing::FakeProvider;
    use proptest::prelude::*;
    use std::cell::Cell;
    use std::convert::Infallible;
    use std::sync::atomic::Ordering;

    fn run_search(n: usize, k: usize) -> (usize, usize) {
        let calls = Cell::new(0);
        let index = futures::executor::block_on(last_resolvable(n, |i| {
            calls.set(calls.get() + 1);
            async move { Ok::<_, Infallible>(i < k) }
        }))
        .unwrap_or_else(|never| match never {});
        (index, calls.get())
    }

    fn ceil_log2(n: usize) -> usize {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }

    #[test]
    fn search_over_sixteen_candidates_takes_four_probes() {
        for k in 0..=16 {
            let (index, calls) = run_search(16, k);
            assert_eq!(calls, 4, "k = {k}");
            assert_eq!(index, k.saturating_sub(1), "k = {k}");
        }
    }

    proptest! {
        #[test]
        fn search_lands_on_the_last_resolvable_index(n in 1usize..500, k_seed in 0usize..1000) {
            let k = k_seed % (n + 1);
            let (index, calls) = run_search(n, k);
            prop_assert_eq!(index, k.saturating_sub(1));
            prop_assert!(calls <= ceil_log2(n), "{} probes for n = {}", calls, n);
        }
    }

    async fn cache_messages(db: &Database, account: &Account, history_ids: &[i64]) {
        for (i, history_id) in history_ids.iter().enumerate() {
            db.insert_message(&MessageRecord {
                id: 0,
                account_id: account.id,
                message_id: format!("m{i}"),
                thread_id: "t".to_string(),
                history_id: Some(*history_id),
                internal_date: None,
                header_from: None,
            })
            .await
            .expect("cache message");
        }
    }

    #[tokio::test]
    async fn empty_cache_returns_the_hint() {
        let db = Database::in_memory().await.expect("db");
        let account = db.find_or_create_account("a@example.com", 0).await.expect("account");
        let provider = Arc::new(FakeProvider::new());
        let locator = BoundaryLocator::new(db, provider.clone());

        assert_eq!(locator.find_boundary(&account, Some(42)).await.expect("boundary"), Some(42));
        assert_eq!(locator.find_boundary(&account, None).await.expect("boundary"), None);
        assert_eq!(provider.resolvable_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_candidate_is_returned_without_asking_the_provider() {
        let db = Database::in_memory().await.expect("db");
        let account = db.find_or_create_account("a@example.com", 0).await.expect("account");
        cache_messages(&db, &account, &[5, 90]).await;
        let provider = Arc::new(FakeProvider::new());
        let locator = BoundaryLocator::new(db, provider.clone());

        assert_eq!(locator.find_boundary(&account, Some(50)).await.expect("boundary"), Some(90));
        assert_eq!(provider.resolvable_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_settles_on_the_newest_point_the_provider_still_resolves() {
        let db = Database::in_memory().await.expect("db");
        let account = db.find_or_create_account("a@example.com", 0).await.expect("account");
        cache_messages(&db, &account, &[10, 20, 30, 40, 50, 60, 70, 80]).await;
        let provider = Arc::new(FakeProvider::new());
        provider.with(|s| s.newest_resolvable = Some(50));
        let locator = BoundaryLocator::new(db, provider.clone());

        let boundary = locator.find_boundary(&account, Some(10)).await.expect("boundary");

        assert_eq!(boundary, Some(50));
        assert_eq!(provider.resolvable_calls.load(Ordering::SeqCst), 3);
    }
}
