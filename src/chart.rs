//! Read path for reporting: sampled label totals, the change segments drawn
//! between samples, a status line and per-sender counts.

use crate::clock::{Clock, system_clock};
use crate::db::Database;
use crate::error::SyncError;
use crate::models::{AccountId, DeltaCounts, HistoryEvent, LabelSummary};
use std::cmp::Ordering;
use std::time::Duration;

/// The chart always spans about this many buckets.
pub const BUCKETS_PER_CHART: i64 = 60;
pub const MIN_BUCKET_MS: i64 = 10_000;

pub fn bucket_size(start: i64, now: i64) -> i64 {
    ((now - start) / BUCKETS_PER_CHART).max(MIN_BUCKET_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplePoint {
    pub timestamp: i64,
    pub total: i64,
    pub unread: i64,
}

impl From<&LabelSummary> for SamplePoint {
    fn from(summary: &LabelSummary) -> Self {
        Self {
            timestamp: summary.sampled_at,
            total: summary.messages_total,
            unread: summary.messages_unread,
        }
    }
}

/// Bucket boundaries and samples merged into one timeline.
#[derive(Debug, Clone, Copy)]
enum Marker<'a> {
    Tick(i64),
    Sample(&'a LabelSummary),
}

impl Marker<'_> {
    fn time(&self) -> i64 {
        match self {
            Marker::Tick(t) => *t,
            Marker::Sample(s) => s.sampled_at,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Marker::Tick(_) => 0,
            Marker::Sample(_) => 1,
        }
    }
}

/// Time first, then ticks ahead of samples taken at the same instant.
fn marker_order(a: &Marker<'_>, b: &Marker<'_>) -> Ordering {
    a.time().cmp(&b.time()).then(a.rank().cmp(&b.rank()))
}

/// The last sample in each bucket of `[start, end]`. A sample taken exactly on a
/// bucket boundary opens the new bucket.
pub fn closing_samples(summaries: &[LabelSummary], start: i64, end: i64, bucket: i64) -> Vec<SamplePoint> {
    let bucket = bucket.max(1);
    let mut markers: Vec<Marker<'_>> = (0..)
        .map(|i| start + i * bucket)
        .take_while(|t| *t <= end)
        .map(Marker::Tick)
        .collect();
    markers.extend(
        summaries
            .iter()
            .filter(|s| s.sampled_at >= start && s.sampled_at <= end)
            .map(Marker::Sample),
    );
    markers.sort_by(marker_order);

    let mut closing = Vec::new();
    let mut open: Option<&LabelSummary> = None;
    for marker in markers {
        match marker {
            Marker::Tick(_) => closing.extend(open.take().map(SamplePoint::from)),
            Marker::Sample(s) => open = Some(s),
        }
    }
    closing.extend(open.map(SamplePoint::from));
    closing
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    MessagesAdded,
    MessagesRemoved,
    UnreadAdded,
    UnreadRemoved,
}

/// A vertical stroke at a sample's time from its value to the value after one kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub from: (i64, i64),
    pub to: (i64, i64),
}

/// Pairs each sample with the changes dated in `[sample_i, sample_i+1)`; the
/// last window is open-ended. Windows without changes produce nothing.
pub fn change_segments(samples: &[SamplePoint], events: &[HistoryEvent]) -> Vec<Segment> {
    let mut segments = Vec::new();

    for (i, sample) in samples.iter().enumerate() {
        let window_end = samples.get(i + 1).map_or(i64::MAX, |next| next.timestamp);
        let mut counts = DeltaCounts::default();
        for event in events
            .iter()
            .filter(|e| e.date_occurred >= sample.timestamp && e.date_occurred < window_end)
        {
            counts.accumulate(&event.counts);
        }
        if !counts.has_changes() {
            continue;
        }

        let t = sample.timestamp;
        segments.extend([
            Segment {
                kind: SegmentKind::MessagesAdded,
                from: (t, sample.total),
                to: (t, sample.total + counts.messages_added),
            },
            Segment {
                kind: SegmentKind::MessagesRemoved,
                from: (t, sample.total),
                to: (t, sample.total - counts.messages_removed),
            },
            Segment {
                kind: SegmentKind::UnreadAdded,
                from: (t, sample.unread),
                to: (t, sample.unread + counts.unread_added),
            },
            Segment {
                kind: SegmentKind::UnreadRemoved,
                from: (t, sample.unread),
                to: (t, sample.unread - counts.unread_removed),
            },
        ]);
    }
    segments
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartData {
    pub start: i64,
    pub end: i64,
    pub bucket_ms: i64,
    pub samples: Vec<SamplePoint>,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartView {
    /// Nothing sampled yet for the account.
    NoData,
    Ready(ChartData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub since_last_event: Option<String>,
    pub since_last_sample: Option<String>,
    pub next_update_in: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderCount {
    pub sender: String,
    pub messages: i64,
}

/// `00d 00hr 00m 00s`. Negative spans render as zero.
pub fn format_interval(millis: i64) -> String {
    let secs = millis.max(0) / 1_000;
    format!(
        "{:02}d {:02}hr {:02}m {:02}s",
        secs / 86_400,
        secs % 86_400 / 3_600,
        secs % 3_600 / 60,
        secs % 60
    )
}

pub struct ChartAggregator {
    db: Database,
    clock: Clock,
}

impl ChartAggregator {
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

    /// Earliest of the first label sample and the first change observed while monitoring.
    pub async fn first_usable_time(&self, account_id: AccountId) -> Result<Option<i64>, SyncError> {
        let first_sample = self.db.first_label_summary_time(account_id).await?;
        let first_change = self.db.first_observed_change_time(account_id).await?;
        Ok(match (first_sample, first_change) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    pub async fn chart(&self, account_id: AccountId, start: Option<i64>) -> Result<ChartView, SyncError> {
        if self.db.latest_label_summary(account_id).await?.is_none() {
            return Ok(ChartView::NoData);
        }
        let start = match start {
            Some(start) => start,
            None => match self.first_usable_time(account_id).await? {
                Some(first) => first,
                None => return Ok(ChartView::NoData),
            },
        };
        let end = (self.clock)();
        let bucket_ms = bucket_size(start, end);

        let summaries = self.db.label_summaries_since(account_id, start).await?;
        let samples = closing_samples(&summaries, start, end, bucket_ms);
        let events = self.db.mailbox_changes_since(account_id, start).await?;
        let segments = change_segments(&samples, &events);

        Ok(ChartView::Ready(ChartData {
            start,
            end,
            bucket_ms,
            samples,
            segments,
        }))
    }

    pub async fn status_report(
        &self,
        account_id: AccountId,
        pending: Option<Duration>,
    ) -> Result<StatusReport, SyncError> {
        let now = (self.clock)();
        let last_event = self.db.latest_history_event(account_id).await?;
        let last_sample = self.db.latest_label_summary(account_id).await?;

        Ok(StatusReport {
            since_last_event: last_event.map(|e| format_interval(now - e.date_occurred)),
            since_last_sample: last_sample.map(|s| format_interval(now - s.sampled_at)),
            next_update_in: pending
                .map(|d| format_interval(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))),
        })
    }

    pub async fn sender_stats(
        &self,
        account_id: AccountId,
        since: Option<i64>,
    ) -> Result<Vec<SenderCount>, SyncError> {
        let rows = self.db.sender_stats(account_id, since).await?;
        Ok(rows
            .into_iter()
            .map(|(sender, messages)| SenderCount { sender, messages })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{MessageRecord, ObservationStatus};

    fn summary(sampled_at: i64, total: i64, unread: i64) -> LabelSummary {
        LabelSummary {
            id: 0,
            account_id: 1,
            label_name: "INBOX".to_string(),
            last_history_id: 0,
            sampled_at,
            messages_total: total,
            messages_unread: unread,
            threads_total: total,
            threads_unread: unread,
        }
    }

    fn change(date: i64, status: ObservationStatus, counts: DeltaCounts) -> HistoryEvent {
        HistoryEvent {
            id: 0,
            account_id: 1,
            history_id: date,
            date_occurred: date,
            status,
            payload: "{}".to_string(),
            counts,
        }
    }

    #[test]
    fn delta_is_attributed_to_the_window_it_falls_in() {
        let samples = vec![
            SamplePoint { timestamp: 1_000, total: 10, unread: 2 },
            SamplePoint { timestamp: 2_000, total: 12, unread: 1 },
        ];
        let events = vec![change(
            1_500,
            ObservationStatus::Realtime,
            DeltaCounts {
                messages_added: 2,
                unread_removed: 1,
                ..DeltaCounts::default()
            },
        )];

        let segments = change_segments(&samples, &events);

        assert_eq!(segments.len(), 4);
        assert!(segments.contains(&Segment {
            kind: SegmentKind::MessagesAdded,
            from: (1_000, 10),
            to: (1_000, 12),
        }));
        assert!(segments.contains(&Segment {
            kind: SegmentKind::UnreadRemoved,
            from: (1_000, 2),
            to: (1_000, 1),
        }));
    }

    #[test]
    fn change_on_a_sample_boundary_belongs_to_the_later_window() {
        let samples = vec![
            SamplePoint { timestamp: 1_000, total: 10, unread: 2 },
            SamplePoint { timestamp: 2_000, total: 11, unread: 2 },
        ];
        let events = vec![change(
            2_000,
            ObservationStatus::Realtime,
            DeltaCounts {
                messages_added: 1,
                ..DeltaCounts::default()
            },
        )];

        let segments = change_segments(&samples, &events);

        assert!(segments.iter().all(|s| s.from.0 == 2_000));
        assert_eq!(segments.len(), 4);
    }

    #[test]
    fn bucket_keeps_its_last_sample_and_ticks_open_new_buckets() {
        let summaries = vec![
            summary(0, 1, 0),
            summary(4_000, 2, 0),
            summary(10_000, 3, 0),
            summary(19_999, 4, 0),
            summary(25_000, 5, 0),
        ];

        let points = closing_samples(&summaries, 0, 30_000, 10_000);

        let totals: Vec<_> = points.iter().map(|p| p.total).collect();
        assert_eq!(totals, vec![2, 4, 5]);
    }

    #[test]
    fn bucket_size_has_a_floor() {
        assert_eq!(bucket_size(0, 60_000), MIN_BUCKET_MS);
        assert_eq!(bucket_size(0, 6_000_000), 100_000);
    }

    #[test]
    fn intervals_are_zero_padded() {
        assert_eq!(format_interval(0), "00d 00hr 00m 00s");
        assert_eq!(format_interval(((26 * 60 + 3) * 60 + 9) * 1_000), "01d 02hr 03m 09s");
        assert_eq!(format_interval(-5_000), "00d 00hr 00m 00s");
    }

    #[tokio::test]
    async fn account_without_samples_has_no_data_yet() {
        let db = Database::in_memory().await.expect("db");
        let account = db.find_or_create_account("a@example.com", 0).await.expect("account");
        let chart = ChartAggregator::new(db);

        assert_eq!(chart.chart(account.id, None).await.expect("chart"), ChartView::NoData);
        let status = chart.status_report(account.id, None).await.expect("status");
        assert_eq!(status.since_last_event, None);
        assert_eq!(status.since_last_sample, None);
    }

    #[tokio::test]
    async fn chart_skips_changes_from_before_monitoring() {
        let db = Database::in_memory().await.expect("db");
        let account = db.find_or_create_account("a@example.com", 0).await.expect("account");
        let mut sample = summary(100_000, 10, 2);
        sample.account_id = account.id;
        db.insert_label_summary(&sample).await.expect("sample");

        let added = DeltaCounts {
            messages_added: 1,
            ..DeltaCounts::default()
        };
        for (history_id, date, status) in [
            (1, 90_000, ObservationStatus::Realtime),
            (2, 100_500, ObservationStatus::FirstUpdate),
            (3, 101_000, ObservationStatus::Delayed),
        ] {
            let mut event = change(date, status, added);
            event.account_id = account.id;
            event.history_id = history_id;
            db.insert_history_event(&event).await.expect("event");
        }

        let clock = ManualClock::starting_at(160_000);
        let chart = ChartAggregator::new(db).with_clock(clock.as_clock());

        assert_eq!(chart.first_usable_time(account.id).await.expect("first"), Some(90_000));

        let ChartView::Ready(data) = chart.chart(account.id, Some(100_000)).await.expect("chart") else {
            panic!("expected chart data");
        };
        assert_eq!(data.bucket_ms, MIN_BUCKET_MS);
        assert_eq!(data.samples, vec![SamplePoint { timestamp: 100_000, total: 10, unread: 2 }]);
        let added = data
            .segments
            .iter()
            .find(|s| s.kind == SegmentKind::MessagesAdded)
            .expect("segment");
        assert_eq!(added.to, (100_000, 11));

        let status = chart
            .status_report(account.id, Some(Duration::from_secs(90)))
            .await
            .expect("status");
        assert_eq!(status.since_last_sample.as_deref(), Some("00d 00hr 01m 00s"));
        assert_eq!(status.since_last_event.as_deref(), Some("00d 00hr 00m 59s"));
        assert_eq!(status.next_update_in.as_deref(), Some("00d 00hr 01m 30s"));
    }

    #[tokio::test]
    async fn senders_are_ranked_by_message_count() {
        let db = Database::in_memory().await.expect("db");
        let account = db.find_or_create_account("a@example.com", 0).await.expect("account");
        for (i, (sender, date)) in [("ann", 10), ("bob", 20), ("ann", 30), ("cy", 40), ("ann", 50)]
            .into_iter()
            .enumerate()
        {
            db.insert_message(&MessageRecord {
                id: 0,
                account_id: account.id,
                message_id: format!("m{i}"),
                thread_id: "t".to_string(),
                history_id: Some(i as i64),
                internal_date: Some(date),
                header_from: Some(sender.to_string()),
            })
            .await
            .expect("message");
        }
        let chart = ChartAggregator::new(db);

        let all = chart.sender_stats(account.id, None).await.expect("stats");
        assert_eq!(
            all[0],
            SenderCount {
                sender: "ann".to_string(),
                messages: 3
            }
        );
        assert_eq!(all.len(), 3);

        let recent = chart.sender_stats(account.id, Some(35)).await.expect("stats");
        let names: Vec<_> = recent.iter().map(|s| s.sender.as_str()).collect();
        assert_eq!(names, vec!["ann", "cy"]);
    }
}
