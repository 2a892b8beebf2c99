//! The journaled queue store: three FIFO lanes per session.
//!
//! Materialization is atomic with the transcript append that injects the
//! message: both writes share one SQLite transaction, and the journal's
//! `materialized` record carries the transcript entry id.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};

use wuhu_domain::entry::{EntryPayload, SessionEntry};
use wuhu_domain::error::{Error, Result};
use wuhu_domain::queue::{
    QueueBackfill, QueueItem, QueueJournalEntry, QueueJournalRecord, QueueLane, QueuePayload,
};

use crate::db::Database;
use crate::transcript::{insert_entry, json_from_sql, json_to_sql, ts_from_sql, ts_to_sql};

const STATE_PENDING: &str = "pending";
const STATE_CANCELED: &str = "canceled";
const STATE_MATERIALIZED: &str = "materialized";

#[derive(Clone)]
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Share the transcript store's database so queue/transcript writes can
    /// be transactional.
    pub fn sharing(transcripts: &crate::TranscriptStore) -> Self {
        Self {
            db: transcripts.database().clone(),
        }
    }

    /// Append a pending item and its `enqueued` journal record.
    pub async fn enqueue(
        &self,
        session_id: &str,
        lane: QueueLane,
        payload: QueuePayload,
    ) -> Result<(QueueItem, QueueJournalEntry)> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let out = enqueue_tx(&tx, &session_id, lane, &payload)?;
                tx.commit()?;
                Ok(out)
            })
            .await
    }

    /// Cancel a pending item. No-op (returns `None`) when the item is
    /// already canceled or materialized. The system-urgent lane has no
    /// cancel.
    pub async fn cancel(
        &self,
        session_id: &str,
        lane: QueueLane,
        item_id: u64,
    ) -> Result<Option<QueueJournalEntry>> {
        if !lane.is_user_lane() {
            return Err(Error::Storage(
                "the system_urgent lane does not support cancel".into(),
            ));
        }
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE queue_items SET state = ?4 WHERE session_id = ?1 AND lane = ?2 \
                     AND item_id = ?3 AND state = ?5",
                    params![
                        session_id,
                        lane.as_str(),
                        item_id,
                        STATE_CANCELED,
                        STATE_PENDING
                    ],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                let journal = append_journal(
                    &tx,
                    &session_id,
                    lane,
                    &QueueJournalRecord::Canceled { item_id },
                )?;
                tx.commit()?;
                Ok(Some(journal))
            })
            .await
    }

    /// Materialize a pending item: append `entry_payload` to the transcript
    /// and journal the item as materialized, atomically. Fails if the item
    /// is not pending.
    pub async fn materialize_with_append(
        &self,
        session_id: &str,
        lane: QueueLane,
        item_id: u64,
        entry_payload: EntryPayload,
        parent_entry_id: Option<u64>,
    ) -> Result<(SessionEntry, QueueJournalEntry)> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let state: Option<String> = tx
                    .query_row(
                        "SELECT state FROM queue_items WHERE session_id = ? AND lane = ? \
                         AND item_id = ?",
                        params![session_id, lane.as_str(), item_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if state.as_deref() != Some(STATE_PENDING) {
                    return Err(rusqlite::Error::ToSqlConversionFailure(
                        format!(
                            "queue item {item_id} in lane {} is not pending (state: {})",
                            lane.as_str(),
                            state.as_deref().unwrap_or("missing"),
                        )
                        .into(),
                    ));
                }

                let entry = insert_entry(&tx, &session_id, &entry_payload, parent_entry_id)?;
                tx.execute(
                    "UPDATE queue_items SET state = ?4 WHERE session_id = ?1 AND lane = ?2 \
                     AND item_id = ?3",
                    params![session_id, lane.as_str(), item_id, STATE_MATERIALIZED],
                )?;
                let journal = append_journal(
                    &tx,
                    &session_id,
                    lane,
                    &QueueJournalRecord::Materialized {
                        item_id,
                        transcript_entry_id: entry.entry_id,
                    },
                )?;
                tx.commit()?;
                Ok((entry, journal))
            })
            .await
    }

    /// Pending items in FIFO order.
    pub async fn pending(&self, session_id: &str, lane: QueueLane) -> Result<Vec<QueueItem>> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT item_id, enqueued_at, payload_json FROM queue_items \
                     WHERE session_id = ? AND lane = ? AND state = ? ORDER BY item_id",
                )?;
                let rows = stmt.query_map(
                    params![session_id, lane.as_str(), STATE_PENDING],
                    row_to_item,
                )?;
                rows.collect()
            })
            .await
    }

    /// Backfill for a subscriber: a full pending snapshot when
    /// `since_cursor` is null, plus the journal delta when a cursor is
    /// supplied.
    pub async fn snapshot(
        &self,
        session_id: &str,
        lane: QueueLane,
        since_cursor: Option<u64>,
    ) -> Result<QueueBackfill> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                let cursor: u64 = conn
                    .query_row(
                        "SELECT COALESCE(MAX(seq), 0) FROM queue_journal \
                         WHERE session_id = ? AND lane = ?",
                        params![session_id, lane.as_str()],
                        |row| row.get(0),
                    )?;

                let mut stmt = conn.prepare(
                    "SELECT item_id, enqueued_at, payload_json FROM queue_items \
                     WHERE session_id = ? AND lane = ? AND state = ? ORDER BY item_id",
                )?;
                let pending = stmt
                    .query_map(
                        params![session_id, lane.as_str(), STATE_PENDING],
                        row_to_item,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let journal = match since_cursor {
                    None => Vec::new(),
                    Some(since) => {
                        let mut stmt = conn.prepare(
                            "SELECT seq, kind, data_json, at FROM queue_journal \
                             WHERE session_id = ? AND lane = ? AND seq > ? ORDER BY seq",
                        )?;
                        let rows = stmt
                            .query_map(
                                params![session_id, lane.as_str(), since],
                                row_to_journal,
                            )?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        rows
                    }
                };

                Ok(QueueBackfill {
                    cursor,
                    pending,
                    journal,
                })
            })
            .await
    }

    /// Reconcile items stuck in `pending` whose journal already records a
    /// materialization (possible only for stores without cross-table
    /// transactions; harmless otherwise). Returns fixed item ids.
    pub async fn reconcile(&self, session_id: &str) -> Result<Vec<(QueueLane, u64)>> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                let mut fixed = Vec::new();
                for lane in QueueLane::ALL {
                    let ids: Vec<u64> = {
                        let mut stmt = conn.prepare(
                            "SELECT qi.item_id FROM queue_items qi WHERE qi.session_id = ?1 \
                             AND qi.lane = ?2 AND qi.state = ?3 AND EXISTS (\
                                 SELECT 1 FROM queue_journal qj WHERE qj.session_id = ?1 \
                                 AND qj.lane = ?2 AND qj.kind = ?4 \
                                 AND json_extract(qj.data_json, '$.item_id') = qi.item_id)",
                        )?;
                        let rows = stmt
                            .query_map(
                                params![
                                    session_id,
                                    lane.as_str(),
                                    STATE_PENDING,
                                    STATE_MATERIALIZED
                                ],
                                |row| row.get(0),
                            )?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        rows
                    };
                    for item_id in ids {
                        conn.execute(
                            "UPDATE queue_items SET state = ?4 WHERE session_id = ?1 \
                             AND lane = ?2 AND item_id = ?3",
                            params![session_id, lane.as_str(), item_id, STATE_MATERIALIZED],
                        )?;
                        fixed.push((lane, item_id));
                    }
                }
                Ok(fixed)
            })
            .await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transaction helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn enqueue_tx(
    tx: &Transaction<'_>,
    session_id: &str,
    lane: QueueLane,
    payload: &QueuePayload,
) -> rusqlite::Result<(QueueItem, QueueJournalEntry)> {
    let next: u64 = tx.query_row(
        "SELECT COALESCE(MAX(item_id), 0) + 1 FROM queue_items \
         WHERE session_id = ? AND lane = ?",
        params![session_id, lane.as_str()],
        |row| row.get(0),
    )?;

    let item = QueueItem {
        item_id: next,
        enqueued_at: Utc::now(),
        payload: payload.clone(),
    };

    tx.execute(
        "INSERT INTO queue_items (session_id, lane, item_id, enqueued_at, payload_json, state) \
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            session_id,
            lane.as_str(),
            item.item_id,
            ts_to_sql(item.enqueued_at),
            json_to_sql(payload)?,
            STATE_PENDING,
        ],
    )?;

    let journal = append_journal(
        tx,
        session_id,
        lane,
        &QueueJournalRecord::Enqueued { item: item.clone() },
    )?;

    Ok((item, journal))
}

fn append_journal(
    tx: &Transaction<'_>,
    session_id: &str,
    lane: QueueLane,
    record: &QueueJournalRecord,
) -> rusqlite::Result<QueueJournalEntry> {
    let seq: u64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM queue_journal WHERE session_id = ? AND lane = ?",
        params![session_id, lane.as_str()],
        |row| row.get(0),
    )?;
    let kind = match record {
        QueueJournalRecord::Enqueued { .. } => "enqueued",
        QueueJournalRecord::Canceled { .. } => "canceled",
        QueueJournalRecord::Materialized { .. } => STATE_MATERIALIZED,
    };
    let at = Utc::now();
    tx.execute(
        "INSERT INTO queue_journal (session_id, lane, seq, kind, data_json, at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            session_id,
            lane.as_str(),
            seq,
            kind,
            json_to_sql(record)?,
            ts_to_sql(at),
        ],
    )?;
    Ok(QueueJournalEntry {
        seq,
        at,
        record: record.clone(),
    })
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    let enqueued_at: String = row.get(1)?;
    let payload_json: String = row.get(2)?;
    Ok(QueueItem {
        item_id: row.get(0)?,
        enqueued_at: ts_from_sql(&enqueued_at)?,
        payload: json_from_sql(&payload_json)?,
    })
}

fn row_to_journal(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueJournalEntry> {
    let data_json: String = row.get(2)?;
    let at: String = row.get(3)?;
    Ok(QueueJournalEntry {
        seq: row.get(0)?,
        at: ts_from_sql(&at)?,
        record: json_from_sql(&data_json)?,
    })
}
