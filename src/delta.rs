//! Counting inbox movement out of a single provider history record.

use crate::models::{DeltaCounts, HistoryDelta, LABEL_INBOX, LABEL_UNREAD};

/// Sums the four counters for one record. Each sub-event category is checked
/// independently, so one record may move more than one counter.
pub fn count(delta: &HistoryDelta) -> DeltaCounts {
    let mut counts = DeltaCounts::default();

    for change in &delta.labels_added {
        if change.touches(LABEL_INBOX) {
            counts.messages_added += 1;
            if change.message.has_label(LABEL_UNREAD) {
                counts.unread_added += 1;
            }
        }
        if change.touches(LABEL_UNREAD) {
            counts.unread_added += 1;
        }
    }

    for change in &delta.labels_removed {
        if change.touches(LABEL_INBOX) {
            counts.messages_removed += 1;
            // The message's label list is what remains after removal.
            if change.message.has_label(LABEL_UNREAD) {
                counts.unread_removed += 1;
            }
        }
        if change.touches(LABEL_UNREAD) {
            counts.unread_removed += 1;
        }
    }

    for message in &delta.messages_added {
        if message.has_label(LABEL_INBOX) {
            counts.messages_added += 1;
        }
        if message.has_label(LABEL_UNREAD) {
            counts.unread_added += 1;
        }
    }

    for message in &delta.messages_deleted {
        if message.has_label(LABEL_INBOX) {
            counts.messages_removed += 1;
        }
        if message.has_label(LABEL_UNREAD) {
            counts.unread_removed += 1;
        }
    }

    counts
}
