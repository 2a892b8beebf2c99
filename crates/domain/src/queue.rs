//! Queue lanes, items, and the per-lane journal.
//!
//! Each session has three FIFO lanes. The pending set is derivable by
//! replaying the journal; stores may keep a materialized index for
//! efficiency, but the journal is authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lanes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drain priority at checkpoints is `SystemUrgent > Steer > FollowUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueLane {
    SystemUrgent,
    Steer,
    FollowUp,
}

impl QueueLane {
    pub const ALL: [QueueLane; 3] = [QueueLane::SystemUrgent, QueueLane::Steer, QueueLane::FollowUp];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueLane::SystemUrgent => "system_urgent",
            QueueLane::Steer => "steer",
            QueueLane::FollowUp => "follow_up",
        }
    }

    pub fn from_str(s: &str) -> Option<QueueLane> {
        match s {
            "system_urgent" => Some(QueueLane::SystemUrgent),
            "steer" => Some(QueueLane::Steer),
            "follow_up" => Some(QueueLane::FollowUp),
            _ => None,
        }
    }

    /// Only user lanes support cancel; system-urgent items cannot be canceled.
    pub fn is_user_lane(&self) -> bool {
        matches!(self, QueueLane::Steer | QueueLane::FollowUp)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Source tag on system-urgent payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgentSource {
    AsyncBashCallback,
    AsyncTaskNotification,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePayload {
    /// Steer / follow-up lanes: a user message.
    UserMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        text: String,
    },
    /// System-urgent lane: an asynchronous notification.
    SystemNotice { source: UrgentSource, text: String },
}

impl QueuePayload {
    pub fn text(&self) -> &str {
        match self {
            QueuePayload::UserMessage { text, .. } => text,
            QueuePayload::SystemNotice { text, .. } => text,
        }
    }
}

/// A pending (or journaled) queue item. `item_id` is per-lane monotonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub item_id: u64,
    pub enqueued_at: DateTime<Utc>,
    pub payload: QueuePayload,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Journal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueJournalRecord {
    Enqueued { item: QueueItem },
    Canceled { item_id: u64 },
    Materialized { item_id: u64, transcript_entry_id: u64 },
}

/// One journal row; `seq` is the per-lane journal cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJournalEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: QueueJournalRecord,
}

/// Snapshot returned to subscribers: full when `since_cursor` was null,
/// otherwise a journal delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueBackfill {
    /// Journal cursor as of this snapshot; pass back as `since_cursor`.
    pub cursor: u64,
    pub pending: Vec<QueueItem>,
    pub journal: Vec<QueueJournalEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_names_roundtrip() {
        for lane in QueueLane::ALL {
            assert_eq!(QueueLane::from_str(lane.as_str()), Some(lane));
        }
        assert_eq!(QueueLane::from_str("bogus"), None);
    }

    #[test]
    fn only_user_lanes_cancel() {
        assert!(!QueueLane::SystemUrgent.is_user_lane());
        assert!(QueueLane::Steer.is_user_lane());
        assert!(QueueLane::FollowUp.is_user_lane());
    }

    #[test]
    fn journal_entry_flattens_record_tag() {
        let entry = QueueJournalEntry {
            seq: 3,
            at: Utc::now(),
            record: QueueJournalRecord::Materialized {
                item_id: 7,
                transcript_entry_id: 42,
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["kind"], "materialized");
        assert_eq!(json["transcript_entry_id"], 42);
        let parsed: QueueJournalEntry = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn payload_roundtrip() {
        let payload = QueuePayload::SystemNotice {
            source: UrgentSource::AsyncBashCallback,
            text: r#"{"exit_code":0}"#.into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "system_notice");
        assert_eq!(json["source"], "async_bash_callback");
        let parsed: QueuePayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, payload);
    }
}
