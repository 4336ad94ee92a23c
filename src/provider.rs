use crate::error::ProviderError;
use crate::models::{
    Account, HistoryPage, LabelCounts, MessageDetail, MessagePage, SequenceNumber,
};
use async_trait::async_trait;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// The remote mailbox. Every call is network-bound and may fail transiently.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// One page of message references carrying `label`.
    async fn list_messages(
        &self,
        account: &Account,
        label: &str,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> ProviderResult<MessagePage>;

    async fn get_message(&self, account: &Account, message_id: &str)
    -> ProviderResult<MessageDetail>;

    /// One page of change records strictly after `since`.
    ///
    /// Fails with `ProviderError::NotFound` when `since` is older than the provider retains.
    async fn list_history_since(
        &self,
        account: &Account,
        since: SequenceNumber,
        page_token: Option<&str>,
    ) -> ProviderResult<HistoryPage>;

    /// Whether history can still be listed from `sequence`.
    async fn is_sequence_resolvable(
        &self,
        account: &Account,
        sequence: SequenceNumber,
    ) -> ProviderResult<bool> {
        match self.list_history_since(account, sequence, None).await {
            Ok(_) => Ok(true),
            Err(ProviderError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_authorization_valid(&self, account: &Account) -> bool;

    async fn get_label_counts(&self, account: &Account, label: &str)
    -> ProviderResult<LabelCounts>;
}
