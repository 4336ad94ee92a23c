//! In-memory provider double shared by the unit tests.

use crate::error::ProviderError;
use crate::models::{
    Account, HistoryDelta, HistoryPage, LabelCounts, MessageDetail, MessagePage, MessageRef,
    SequenceNumber,
};
use crate::provider::{MailProvider, ProviderResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct FakeState {
    pub authorized: bool,
    pub unavailable: bool,
    /// Pages of the label listing; the page token is the index of the next page.
    pub pages: Vec<Vec<MessageRef>>,
    pub details: HashMap<String, MessageDetail>,
    pub history: Vec<HistoryDelta>,
    pub history_page_size: usize,
    /// History older than this has expired.
    pub oldest_resolvable: SequenceNumber,
    /// Upper bound of what `is_sequence_resolvable` accepts, when set.
    pub newest_resolvable: Option<SequenceNumber>,
    pub label_counts: LabelCounts,
}

#[derive(Default)]
pub struct FakeProvider {
    pub state: Mutex<FakeState>,
    pub resolvable_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
    pub detail_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        let provider = Self::default();
        provider.with(|s| {
            s.authorized = true;
            s.history_page_size = 100;
        });
        provider
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().expect("fake state");
        f(&mut state)
    }

    fn check_available(&self) -> ProviderResult<()> {
        if self.with(|s| s.unavailable) {
            return Err(ProviderError::Transient("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn list_messages(
        &self,
        _account: &Account,
        _label: &str,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> ProviderResult<MessagePage> {
        self.check_available()?;
        let index: usize = page_token.map(|t| t.parse().unwrap_or(0)).unwrap_or(0);
        self.with(|s| {
            let mut messages = s.pages.get(index).cloned().unwrap_or_default();
            if let Some(max) = max_results {
                messages.truncate(max as usize);
            }
            let next_page_token = (index + 1 < s.pages.len()).then(|| (index + 1).to_string());
            Ok(MessagePage {
                messages,
                next_page_token,
            })
        })
    }

    async fn get_message(&self, _account: &Account, message_id: &str) -> ProviderResult<MessageDetail> {
        self.check_available()?;
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.with(|s| {
            s.details
                .get(message_id)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(message_id.to_string()))
        })
    }

    async fn list_history_since(
        &self,
        _account: &Account,
        since: SequenceNumber,
        page_token: Option<&str>,
    ) -> ProviderResult<HistoryPage> {
        self.check_available()?;
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.with(|s| {
            if since < s.oldest_resolvable {
                return Err(ProviderError::NotFound(format!("history {since}")));
            }
            let newer: Vec<_> = s.history.iter().filter(|d| d.id > since).cloned().collect();
            let offset: usize = page_token.map(|t| t.parse().unwrap_or(0)).unwrap_or(0);
            let size = s.history_page_size.max(1);
            let deltas: Vec<_> = newer.iter().skip(offset).take(size).cloned().collect();
            let next_page_token =
                (offset + size < newer.len()).then(|| (offset + size).to_string());
            Ok(HistoryPage {
                deltas,
                next_page_token,
            })
        })
    }

    async fn is_sequence_resolvable(
        &self,
        _account: &Account,
        sequence: SequenceNumber,
    ) -> ProviderResult<bool> {
        self.check_available()?;
        self.resolvable_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.with(|s| {
            sequence >= s.oldest_resolvable && s.newest_resolvable.is_none_or(|n| sequence <= n)
        }))
    }

    async fn is_authorization_valid(&self, _account: &Account) -> bool {
        self.with(|s| s.authorized)
    }

    async fn get_label_counts(&self, _account: &Account, label: &str) -> ProviderResult<LabelCounts> {
        self.check_available()?;
        self.with(|s| {
            Ok(LabelCounts {
                label_name: label.to_string(),
                ..s.label_counts.clone()
            })
        })
    }
}

pub fn message_ref(id: &str, thread_id: &str, labels: &[&str]) -> MessageRef {
    MessageRef {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        label_ids: labels.iter().map(|l| l.to_string()).collect(),
    }
}
