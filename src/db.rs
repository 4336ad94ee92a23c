use crate::models::{
    Account, AccountId, DeltaCounts, HistoryEvent, LabelSummary, MessageRecord, ObservationStatus,
    SequenceNumber,
};
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

const HISTORY_COLUMNS: &str = "id, account_id, history_id, date_occurred, status_observed, payload, \
     messages_added, messages_removed, unread_added, unread_removed";

const LABEL_COLUMNS: &str = "id, account_id, label_name, last_history_id, sampled_at, \
     messages_total, messages_unread, threads_total, threads_unread";

const MESSAGE_COLUMNS: &str =
    "id, account_id, message_id, thread_id, history_id, internal_date, header_from";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database, already migrated. A single connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    // Accounts

    pub async fn find_account_by_identity(&self, identity: &str) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, identity, created_at FROM accounts WHERE identity = ?",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    pub async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let account =
            sqlx::query_as::<_, Account>("SELECT id, identity, created_at FROM accounts WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(account)
    }

    /// Returns the account for `identity`, creating it first if needed.
    pub async fn find_or_create_account(&self, identity: &str, now: i64) -> Result<Account> {
        sqlx::query(
            "INSERT INTO accounts (identity, created_at) VALUES (?, ?)
             ON CONFLICT(identity) DO NOTHING",
        )
        .bind(identity)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_account_by_identity(identity)
            .await?
            .ok_or_else(|| anyhow::anyhow!("account {} vanished after insert", identity))
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let accounts =
            sqlx::query_as::<_, Account>("SELECT id, identity, created_at FROM accounts ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(accounts)
    }

    // History events

    pub async fn find_history_events(
        &self,
        account_id: AccountId,
        history_id: SequenceNumber,
    ) -> Result<Vec<HistoryEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history_events WHERE account_id = ? AND history_id = ?"
        ))
        .bind(account_id)
        .bind(history_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_event_from_row).collect()
    }

    pub async fn insert_history_event(&self, event: &HistoryEvent) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO history_events (account_id, history_id, date_occurred, status_observed, payload,
                 messages_added, messages_removed, unread_added, unread_removed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.account_id)
        .bind(event.history_id)
        .bind(event.date_occurred)
        .bind(event.status)
        .bind(&event.payload)
        .bind(event.counts.messages_added)
        .bind(event.counts.messages_removed)
        .bind(event.counts.unread_added)
        .bind(event.counts.unread_removed)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_history_event(&self, event: &HistoryEvent) -> Result<()> {
        sqlx::query(
            "UPDATE history_events SET date_occurred = ?, status_observed = ?, payload = ?,
                 messages_added = ?, messages_removed = ?, unread_added = ?, unread_removed = ?
             WHERE id = ?",
        )
        .bind(event.date_occurred)
        .bind(event.status)
        .bind(&event.payload)
        .bind(event.counts.messages_added)
        .bind(event.counts.messages_removed)
        .bind(event.counts.unread_added)
        .bind(event.counts.unread_removed)
        .bind(event.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Events with a known date, ascending by history id.
    pub async fn dated_history_events(&self, account_id: AccountId) -> Result<Vec<HistoryEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history_events
             WHERE account_id = ? AND date_occurred > 0
             ORDER BY history_id ASC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_event_from_row).collect()
    }

    pub async fn first_dated_event_time(&self, account_id: AccountId) -> Result<Option<i64>> {
        let first: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(date_occurred) FROM history_events WHERE account_id = ? AND date_occurred > 0",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(first)
    }

    /// Highest history id whose provider payload has been stored.
    pub async fn last_examined_from_history(
        &self,
        account_id: AccountId,
    ) -> Result<Option<SequenceNumber>> {
        let last: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(history_id) FROM history_events WHERE account_id = ? AND payload <> ''",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    pub async fn latest_history_event(&self, account_id: AccountId) -> Result<Option<HistoryEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history_events
             WHERE account_id = ?
             ORDER BY date_occurred DESC, id DESC
             LIMIT 1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(history_event_from_row).transpose()
    }

    /// Dated changes observed after monitoring began, in time order. Equal timestamps keep insertion order.
    pub async fn mailbox_changes_since(
        &self,
        account_id: AccountId,
        start: i64,
    ) -> Result<Vec<HistoryEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history_events
             WHERE account_id = ? AND date_occurred >= ? AND status_observed <> ?
             ORDER BY date_occurred ASC, id ASC"
        ))
        .bind(account_id)
        .bind(start)
        .bind(ObservationStatus::FirstUpdate)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_event_from_row).collect()
    }

    pub async fn first_observed_change_time(&self, account_id: AccountId) -> Result<Option<i64>> {
        let first: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(date_occurred) FROM history_events WHERE account_id = ? AND status_observed <> ?",
        )
        .bind(account_id)
        .bind(ObservationStatus::FirstUpdate)
        .fetch_one(&self.pool)
        .await?;
        Ok(first)
    }

    pub async fn history_events_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<HistoryEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM history_events WHERE account_id = ? ORDER BY history_id ASC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_event_from_row).collect()
    }

    // Label summaries

    pub async fn insert_label_summary(&self, summary: &LabelSummary) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO label_summaries (account_id, label_name, last_history_id, sampled_at,
                 messages_total, messages_unread, threads_total, threads_unread)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(summary.account_id)
        .bind(&summary.label_name)
        .bind(summary.last_history_id)
        .bind(summary.sampled_at)
        .bind(summary.messages_total)
        .bind(summary.messages_unread)
        .bind(summary.threads_total)
        .bind(summary.threads_unread)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Highest examined history id recorded by any summary of `label`.
    pub async fn max_label_history_id(
        &self,
        account_id: AccountId,
        label_name: &str,
    ) -> Result<Option<SequenceNumber>> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(last_history_id) FROM label_summaries WHERE account_id = ? AND label_name = ?",
        )
        .bind(account_id)
        .bind(label_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    pub async fn label_summaries_since(
        &self,
        account_id: AccountId,
        start: i64,
    ) -> Result<Vec<LabelSummary>> {
        let summaries = sqlx::query_as::<_, LabelSummary>(&format!(
            "SELECT {LABEL_COLUMNS} FROM label_summaries
             WHERE account_id = ? AND sampled_at >= ?
             ORDER BY sampled_at ASC, id ASC"
        ))
        .bind(account_id)
        .bind(start)
        .fetch_all(&self.pool)
        .await?;
        Ok(summaries)
    }

    pub async fn latest_label_summary(&self, account_id: AccountId) -> Result<Option<LabelSummary>> {
        let summary = sqlx::query_as::<_, LabelSummary>(&format!(
            "SELECT {LABEL_COLUMNS} FROM label_summaries
             WHERE account_id = ?
             ORDER BY sampled_at DESC, id DESC
             LIMIT 1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(summary)
    }

    pub async fn first_label_summary_time(&self, account_id: AccountId) -> Result<Option<i64>> {
        let first: Option<i64> =
            sqlx::query_scalar("SELECT MIN(sampled_at) FROM label_summaries WHERE account_id = ?")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(first)
    }

    // Messages

    pub async fn find_messages(
        &self,
        account_id: AccountId,
        message_id: &str,
    ) -> Result<Vec<MessageRecord>> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ? AND message_id = ?"
        ))
        .bind(account_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn insert_message(&self, record: &MessageRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO messages (account_id, message_id, thread_id, history_id, internal_date, header_from)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.account_id)
        .bind(&record.message_id)
        .bind(&record.thread_id)
        .bind(record.history_id)
        .bind(record.internal_date)
        .bind(&record.header_from)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_message(&self, record: &MessageRecord) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET thread_id = ?, history_id = ?, internal_date = ?, header_from = ?
             WHERE id = ?",
        )
        .bind(&record.thread_id)
        .bind(record.history_id)
        .bind(record.internal_date)
        .bind(&record.header_from)
        .bind(record.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cached messages whose history id is at least `hint`, ascending. Messages never examined are skipped.
    pub async fn messages_from_history_id(
        &self,
        account_id: AccountId,
        hint: Option<SequenceNumber>,
    ) -> Result<Vec<MessageRecord>> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE account_id = ? AND history_id IS NOT NULL AND (? IS NULL OR history_id >= ?)
             ORDER BY history_id ASC, id ASC"
        ))
        .bind(account_id)
        .bind(hint)
        .bind(hint)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn messages_without_details(&self, account_id: AccountId) -> Result<Vec<MessageRecord>> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE account_id = ?
               AND (header_from IS NULL OR internal_date IS NULL OR history_id IS NULL)
             ORDER BY id ASC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn count_messages(&self, account_id: AccountId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Message counts per sender, busiest first.
    pub async fn sender_stats(
        &self,
        account_id: AccountId,
        since: Option<i64>,
    ) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT header_from, COUNT(header_from) AS total
             FROM messages
             WHERE account_id = ? AND header_from IS NOT NULL
               AND (? IS NULL OR internal_date >= ?)
             GROUP BY header_from
             ORDER BY total DESC, header_from ASC",
        )
        .bind(account_id)
        .bind(since)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.get(0), r.get(1))).collect())
    }
}

fn history_event_from_row(row: &SqliteRow) -> Result<HistoryEvent> {
    Ok(HistoryEvent {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        history_id: row.try_get("history_id")?,
        date_occurred: row.try_get("date_occurred")?,
        status: row.try_get("status_observed")?,
        payload: row.try_get("payload")?,
        counts: DeltaCounts {
            messages_added: row.try_get("messages_added")?,
            messages_removed: row.try_get("messages_removed")?,
            unread_added: row.try_get("unread_added")?,
            unread_removed: row.try_get("unread_removed")?,
        },
    })
}

#[cfg(test)]
impl Database {
    /// Runs arbitrary SQL, for tests that need to bend the store.
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}
