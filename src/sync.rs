use crate::boundary::BoundaryLocator;
use crate::clock::Clock;
use crate::config::SyncSettings;
use crate::db::Database;
use crate::error::{ProviderError, SyncError};
use crate::merge::MessageMerger;
use crate::models::{
    Account, AccountId, HistoryDelta, LabelSummary, MergeResult, MessageRef, ReconcileSummary,
    SequenceNumber,
};
use crate::provider::MailProvider;
use crate::reconcile::EventReconciler;
use crate::scheduler::AccountUpdater;
use crate::snapshot::LabelSnapshotter;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one pass over an account did.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub skipped: bool,
    /// `None` for a brand-new mailbox, whose history is not resolved.
    pub reconciled: Option<ReconcileSummary>,
    pub merged: MergeResult,
    pub messages_listed: usize,
    pub snapshot: Option<LabelSummary>,
    pub details_filled: usize,
}

/// The per-account update pipeline run by the scheduler.
pub struct MailboxSync {
    db: Database,
    provider: Arc<dyn MailProvider>,
    reconciler: EventReconciler,
    locator: BoundaryLocator,
    merger: MessageMerger,
    snapshotter: LabelSnapshotter,
    settings: SyncSettings,
}

impl MailboxSync {
    pub fn new(db: Database, provider: Arc<dyn MailProvider>, settings: SyncSettings) -> Self {
        Self {
            reconciler: EventReconciler::new(db.clone()),
            locator: BoundaryLocator::new(db.clone(), Arc::clone(&provider)),
            merger: MessageMerger::new(db.clone()),
            snapshotter: LabelSnapshotter::new(db.clone()),
            db,
            provider,
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.reconciler = EventReconciler::new(self.db.clone()).with_clock(Arc::clone(&clock));
        self.snapshotter = LabelSnapshotter::new(self.db.clone()).with_clock(clock);
        self
    }

    pub async fn sync_account(&self, account: &Account) -> Result<SyncReport, SyncError> {
        if !self.provider.is_authorization_valid(account).await {
            debug!("Skipping {}: authorization not usable", account.identity);
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }

        let label = self.settings.label.as_str();
        let from_labels = self.db.max_label_history_id(account.id, label).await?.unwrap_or(0);
        let from_history = self.db.last_examined_from_history(account.id).await?.unwrap_or(0);
        info!(
            "Last examined history for {}: {} (label samples), {} (ledger)",
            account.identity, from_labels, from_history
        );

        let mut report = SyncReport::default();
        let soft_maximum = if from_labels == 0 && from_history == 0 {
            info!(
                "New mailbox {}: examining at most {} messages",
                account.identity, self.settings.new_mailbox_message_limit
            );
            Some(self.settings.new_mailbox_message_limit)
        } else {
            let since = self.history_start(account, from_history, from_labels).await?;
            info!("Examining history of {} from {}", account.identity, since);
            let deltas = self.collect_history(account, since).await?;
            report.reconciled = Some(self.reconciler.reconcile(account.id, &deltas).await?);
            None
        };

        self.resync_label(account, soft_maximum, &mut report).await?;
        report.details_filled = self.fill_message_details(account).await?;
        Ok(report)
    }

    /// Where history listing resumes. The ledger marker while the provider
    /// still resolves it, so nothing between it and newer cached ids is skipped.
    async fn history_start(
        &self,
        account: &Account,
        from_history: SequenceNumber,
        from_labels: SequenceNumber,
    ) -> Result<SequenceNumber, SyncError> {
        if from_history > 0 && self.provider.is_sequence_resolvable(account, from_history).await? {
            return Ok(from_history);
        }
        debug!(
            "History {} of {} has expired; locating the resolvable boundary",
            from_history, account.identity
        );
        let boundary = self.locator.find_boundary(account, Some(from_history)).await?;
        Ok(match boundary {
            Some(sequence) if sequence > 0 => sequence,
            _ => from_labels,
        })
    }

    async fn collect_history(
        &self,
        account: &Account,
        since: SequenceNumber,
    ) -> Result<Vec<HistoryDelta>, SyncError> {
        let mut deltas = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            match self
                .provider
                .list_history_since(account, since, page_token.as_deref())
                .await
            {
                Ok(page) => {
                    deltas.extend(page.deltas);
                    match page.next_page_token {
                        Some(token) => page_token = Some(token),
                        None => break,
                    }
                }
                Err(ProviderError::NotFound(reason)) => {
                    warn!(
                        "History of {} from {} is gone ({}); keeping {} records",
                        account.identity,
                        since,
                        reason,
                        deltas.len()
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deltas)
    }

    /// Samples the label, then pages through its listing until the pages stop bringing news.
    async fn resync_label(
        &self,
        account: &Account,
        soft_maximum: Option<usize>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let label = self.settings.label.as_str();
        let counts = self.provider.get_label_counts(account, label).await?;
        let mut latest_history_id: SequenceNumber = 0;
        let mut page_token: Option<String> = None;

        loop {
            let max_results = soft_maximum
                .map(|max| max.saturating_sub(report.messages_listed))
                .map(|remaining| u32::try_from(remaining).unwrap_or(u32::MAX));
            if max_results == Some(0) {
                break;
            }

            let page = self
                .provider
                .list_messages(account, label, page_token.as_deref(), max_results)
                .await?;
            if page.messages.is_empty() {
                break;
            }

            let page_size = page.messages.len();
            report.messages_listed += page_size;

            // Pages run newest first; later pages only matter if the newest vanished.
            if latest_history_id == 0 {
                if let Some(latest) = self.latest_history_id(account, &page.messages).await? {
                    latest_history_id = latest;
                }
            }

            let merged = self.merger.merge(account.id, &page.messages).await?;
            report.merged.added += merged.added;
            report.merged.modified += merged.modified;
            report.merged.unchanged += merged.unchanged;

            let too_many_listed = report.messages_listed > self.settings.fetch_ceiling;
            let mostly_known = page_size / 3 < merged.already_known();
            if too_many_listed || mostly_known {
                info!(
                    "Stopped paging {} for {}: {} listed, {} of {} already known",
                    label,
                    account.identity,
                    report.messages_listed,
                    merged.already_known(),
                    page_size
                );
                break;
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        report.snapshot = Some(
            self.snapshotter
                .snapshot(account.id, &counts, latest_history_id)
                .await?,
        );
        Ok(())
    }

    /// The first message of a page is normally the newest one.
    async fn latest_history_id(
        &self,
        account: &Account,
        messages: &[MessageRef],
    ) -> Result<Option<SequenceNumber>, SyncError> {
        let Some(first) = messages.first() else {
            return Ok(None);
        };
        match self.provider.get_message(account, &first.id).await {
            Ok(detail) => Ok(detail.history_id),
            Err(ProviderError::NotFound(_)) => {
                debug!("Newest message {} vanished before it could be read", first.id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fill_message_details(&self, account: &Account) -> Result<usize, SyncError> {
        let bare = self.db.messages_without_details(account.id).await?;
        let mut filled = 0;

        for mut record in bare {
            let detail = match self.provider.get_message(account, &record.message_id).await {
                Ok(detail) => detail,
                Err(ProviderError::NotFound(_)) => {
                    debug!("Message {} is gone; leaving it bare", record.message_id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            record.history_id = detail.history_id.or(record.history_id);
            record.internal_date = detail.internal_date.or(record.internal_date);
            record.header_from = detail.header_from.or(record.header_from);
            if !detail.thread_id.is_empty() {
                record.thread_id = detail.thread_id;
            }
            self.db.update_message(&record).await?;
            filled += 1;
        }

        if filled > 0 {
            info!("Filled details of {} messages for {}", filled, account.identity);
        }
        Ok(filled)
    }
}

#[async_trait]
impl AccountUpdater for MailboxSync {
    async fn accounts(&self) -> Result<Vec<Account>, SyncError> {
        Ok(self.db.list_accounts().await?)
    }

    async fn account(&self, id: AccountId) -> Result<Option<Account>, SyncError> {
        Ok(self.db.get_account(id).await?)
    }

    async fn update_account(&self, account: &Account) -> Result<(), SyncError> {
        let report = self.sync_account(account).await?;
        if !report.skipped {
            info!(
                "Updated {}: {} listed, {} new, {} details filled{}",
                account.identity,
                report.messages_listed,
                report.merged.added,
                report.details_filled,
                report
                    .reconciled
                    .map(|r| format!(", {} history created, {} revisited", r.created, r.updated))
                    .unwrap_or_default()
            );
        }
        Ok(())
    }
}
