use crate::models::{AccountId, SequenceNumber};
use thiserror::Error;

/// Failures a `MailProvider` call can report.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network or provider hiccup. The next steady-state run retries.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// The sequence number or resource has expired server-side.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authorization rejected for {0}")]
    Unauthorized(String),
    #[error("provider error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("account {account_id} has more than one event with history id {history_id}")]
    DuplicateSequence {
        account_id: AccountId,
        history_id: SequenceNumber,
    },
    #[error("malformed notification: {0}")]
    MalformedNotification(String),
    #[error("unknown account {0}")]
    UnknownAccount(AccountId),
}

impl SyncError {
    /// Errors worth retrying on the next scheduled run.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Provider(ProviderError::Transient(_)) | SyncError::Store(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_io_failures_are_transient() {
        assert!(SyncError::from(ProviderError::Transient("reset".into())).is_transient());
        assert!(SyncError::from(anyhow::anyhow!("database is locked")).is_transient());
        assert!(!SyncError::from(ProviderError::NotFound("history 5".into())).is_transient());
        assert!(
            !SyncError::DuplicateSequence {
                account_id: 1,
                history_id: 5
            }
            .is_transient()
        );
    }
}
