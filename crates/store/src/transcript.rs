//! The append-only transcript store.
//!
//! Entry cursors are gap-free per session and strictly increasing, with
//! `created_at` monotone non-decreasing. Each append is a single
//! transaction that also bumps the owning session's head/tail cursors and
//! `updated_at`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use wuhu_domain::entry::{EntryPayload, SessionEntry, EXECUTION_STOPPED_MESSAGE};
use wuhu_domain::error::Result;
use wuhu_domain::session::{
    ModelSelection, ProviderKind, ReasoningEffort, ResolvedEnvironment, SessionRecord,
};

use crate::db::Database;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers shared with the queue store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC so lexicographic order matches chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn json_to_sql<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

pub(crate) fn json_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Append one entry inside an open transaction: allocate the next cursor,
/// clamp `created_at` to stay monotone, insert the row, and bump the
/// session head/tail.
pub(crate) fn insert_entry(
    tx: &Transaction<'_>,
    session_id: &str,
    payload: &EntryPayload,
    parent_entry_id: Option<u64>,
) -> rusqlite::Result<SessionEntry> {
    let tail: Option<u64> = tx.query_row(
        "SELECT tail_entry_id FROM sessions WHERE id = ?",
        params![session_id],
        |row| row.get(0),
    )?;

    let entry_id = tail.unwrap_or(0) + 1;

    let mut created_at = Utc::now();
    if let Some(tail_id) = tail {
        let prev: Option<String> = tx
            .query_row(
                "SELECT created_at FROM entries WHERE session_id = ? AND entry_id = ?",
                params![session_id, tail_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(prev) = prev {
            let prev = ts_from_sql(&prev)?;
            if prev > created_at {
                created_at = prev;
            }
        }
    }

    tx.execute(
        "INSERT INTO entries (session_id, entry_id, parent_entry_id, created_at, payload_json) \
         VALUES (?, ?, ?, ?, ?)",
        params![
            session_id,
            entry_id,
            parent_entry_id,
            ts_to_sql(created_at),
            json_to_sql(payload)?,
        ],
    )?;

    tx.execute(
        "UPDATE sessions SET head_entry_id = COALESCE(head_entry_id, ?2), tail_entry_id = ?2, \
         updated_at = ?3 WHERE id = ?1",
        params![session_id, entry_id, ts_to_sql(created_at)],
    )?;

    Ok(SessionEntry {
        entry_id,
        session_id: session_id.to_owned(),
        parent_entry_id,
        created_at,
        payload: payload.clone(),
    })
}

fn provider_from_sql(raw: &str) -> rusqlite::Result<ProviderKind> {
    json_from_sql(&format!("\"{raw}\""))
}

fn effort_from_sql(raw: Option<String>) -> rusqlite::Result<Option<ReasoningEffort>> {
    raw.map(|s| json_from_sql(&format!("\"{s}\""))).transpose()
}

fn effort_to_sql(effort: Option<ReasoningEffort>) -> Option<&'static str> {
    effort.map(|e| match e {
        ReasoningEffort::Low => "low",
        ReasoningEffort::Medium => "medium",
        ReasoningEffort::High => "high",
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let provider: String = row.get(1)?;
    let effort: Option<String> = row.get(3)?;
    let environment_json: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        provider: provider_from_sql(&provider)?,
        model: row.get(2)?,
        reasoning_effort: effort_from_sql(effort)?,
        environment: json_from_sql::<ResolvedEnvironment>(&environment_json)?,
        cwd: row.get(5)?,
        parent_session_id: row.get(6)?,
        created_at: ts_from_sql(&created_at)?,
        updated_at: ts_from_sql(&updated_at)?,
        head_entry_id: row.get(9)?,
        tail_entry_id: row.get(10)?,
    })
}

const SESSION_COLUMNS: &str = "id, provider, model, reasoning_effort, environment_json, cwd, \
                               parent_session_id, created_at, updated_at, head_entry_id, \
                               tail_entry_id";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionEntry> {
    let created_at: String = row.get(3)?;
    let payload_json: String = row.get(4)?;
    Ok(SessionEntry {
        session_id: row.get(0)?,
        entry_id: row.get(1)?,
        parent_entry_id: row.get(2)?,
        created_at: ts_from_sql(&created_at)?,
        payload: json_from_sql(&payload_json)?,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub selection: ModelSelection,
    pub environment: ResolvedEnvironment,
    pub cwd: String,
    pub parent_session_id: Option<String>,
}

#[derive(Clone)]
pub struct TranscriptStore {
    db: Database,
}

impl TranscriptStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create_session(&self, new: NewSession) -> Result<SessionRecord> {
        self.db
            .run(move |conn| {
                let now = Utc::now();
                conn.execute(
                    "INSERT INTO sessions (id, provider, model, reasoning_effort, \
                     environment_json, cwd, parent_session_id, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        new.id,
                        new.selection.provider.as_str(),
                        new.selection.model,
                        effort_to_sql(new.selection.reasoning_effort),
                        json_to_sql(&new.environment)?,
                        new.cwd,
                        new.parent_session_id,
                        ts_to_sql(now),
                        ts_to_sql(now),
                    ],
                )?;
                Ok(SessionRecord {
                    id: new.id,
                    provider: new.selection.provider,
                    model: new.selection.model,
                    reasoning_effort: new.selection.reasoning_effort,
                    environment: new.environment,
                    cwd: new.cwd,
                    parent_session_id: new.parent_session_id,
                    created_at: now,
                    updated_at: now,
                    head_entry_id: None,
                    tail_entry_id: None,
                })
            })
            .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                conn.query_row(
                    &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"),
                    params![session_id],
                    row_to_session,
                )
                .optional()
            })
            .await
    }

    /// Most-recently-updated first.
    pub async fn list_sessions(&self, limit: Option<usize>) -> Result<Vec<SessionRecord>> {
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC LIMIT ?"
                ))?;
                let limit = limit.map(|l| l as i64).unwrap_or(-1);
                let rows = stmt.query_map(params![limit], row_to_session)?;
                rows.collect()
            })
            .await
    }

    /// Append one entry; commits synchronously before returning.
    pub async fn append(
        &self,
        session_id: &str,
        payload: EntryPayload,
        parent_entry_id: Option<u64>,
    ) -> Result<SessionEntry> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let entry = insert_entry(&tx, &session_id, &payload, parent_entry_id)?;
                tx.commit()?;
                Ok(entry)
            })
            .await
    }

    /// Entries strictly after the supplied bounds (intersected when both
    /// are given), in cursor order.
    pub async fn read(
        &self,
        session_id: &str,
        since_cursor: Option<u64>,
        since_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionEntry>> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, entry_id, parent_entry_id, created_at, payload_json \
                     FROM entries WHERE session_id = ? AND entry_id > ? AND created_at > ? \
                     ORDER BY entry_id",
                )?;
                let cursor = since_cursor.unwrap_or(0);
                let time = since_time.map(ts_to_sql).unwrap_or_default();
                let rows = stmt.query_map(params![session_id, cursor, time], row_to_entry)?;
                rows.collect()
            })
            .await
    }

    pub async fn read_all(&self, session_id: &str) -> Result<Vec<SessionEntry>> {
        self.read(session_id, None, None).await
    }

    /// Up to `limit` entries strictly after `since_cursor`, in cursor
    /// order. Backfills read in pages of this shape.
    pub async fn read_page(
        &self,
        session_id: &str,
        since_cursor: Option<u64>,
        limit: usize,
    ) -> Result<Vec<SessionEntry>> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, entry_id, parent_entry_id, created_at, payload_json \
                     FROM entries WHERE session_id = ? AND entry_id > ? \
                     ORDER BY entry_id LIMIT ?",
                )?;
                let rows = stmt.query_map(
                    params![session_id, since_cursor.unwrap_or(0), limit as i64],
                    row_to_entry,
                )?;
                rows.collect()
            })
            .await
    }

    pub async fn head(&self, session_id: &str) -> Result<Option<u64>> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                conn.query_row(
                    "SELECT head_entry_id FROM sessions WHERE id = ?",
                    params![session_id],
                    |row| row.get(0),
                )
            })
            .await
    }

    pub async fn tail(&self, session_id: &str) -> Result<Option<u64>> {
        let session_id = session_id.to_owned();
        self.db
            .run(move |conn| {
                conn.query_row(
                    "SELECT tail_entry_id FROM sessions WHERE id = ?",
                    params![session_id],
                    |row| row.get(0),
                )
            })
            .await
    }

    /// Persist a model change on the session row. The caller appends the
    /// matching `session_settings` entry.
    pub async fn update_settings(
        &self,
        session_id: &str,
        selection: &ModelSelection,
    ) -> Result<()> {
        let session_id = session_id.to_owned();
        let selection = selection.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE sessions SET provider = ?, model = ?, reasoning_effort = ?, \
                     updated_at = ? WHERE id = ?",
                    params![
                        selection.provider.as_str(),
                        selection.model,
                        effort_to_sql(selection.reasoning_effort),
                        ts_to_sql(Utc::now()),
                        session_id,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// For each unresolved tool call, append an error `tool_result` entry
    /// preserving pairing. Used by stop.
    pub async fn repair(
        &self,
        session_id: &str,
        pending: &[(String, String)],
    ) -> Result<Vec<SessionEntry>> {
        let mut repaired = Vec::with_capacity(pending.len());
        for (tool_call_id, tool_name) in pending {
            let payload = EntryPayload::error_tool_result(
                tool_call_id.clone(),
                tool_name.clone(),
                EXECUTION_STOPPED_MESSAGE,
            );
            repaired.push(self.append(session_id, payload, None).await?);
        }
        Ok(repaired)
    }

    /// Raw connection access for sibling stores in this crate.
    pub(crate) fn database(&self) -> &Database {
        &self.db
    }
}

impl std::fmt::Debug for TranscriptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptStore").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wuhu_domain::entry::ContentItem;

    async fn store() -> TranscriptStore {
        TranscriptStore::new(Database::open_in_memory().await.unwrap())
    }

    fn new_session(id: &str) -> NewSession {
        NewSession {
            id: id.into(),
            selection: ModelSelection {
                provider: ProviderKind::Openai,
                model: "gpt-4.1-mini".into(),
                reasoning_effort: None,
            },
            environment: ResolvedEnvironment {
                name: "local".into(),
                runner: None,
                cwd: "/tmp".into(),
            },
            cwd: "/tmp".into(),
            parent_session_id: None,
        }
    }

    #[tokio::test]
    async fn cursors_are_gap_free_and_monotone() {
        let store = store().await;
        store.create_session(new_session("s1")).await.unwrap();

        for i in 0..5 {
            let entry = store
                .append(
                    "s1",
                    EntryPayload::user_text(None, format!("message {i}")),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(entry.entry_id, i + 1);
        }

        let entries = store.read_all("s1").await.unwrap();
        assert_eq!(entries.len(), 5);
        for window in entries.windows(2) {
            assert_eq!(window[1].entry_id, window[0].entry_id + 1);
            assert!(window[1].created_at >= window[0].created_at);
        }

        assert_eq!(store.head("s1").await.unwrap(), Some(1));
        assert_eq!(store.tail("s1").await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn read_since_cursor_is_exclusive() {
        let store = store().await;
        store.create_session(new_session("s1")).await.unwrap();
        for i in 0..4 {
            store
                .append("s1", EntryPayload::user_text(None, format!("m{i}")), None)
                .await
                .unwrap();
        }

        let entries = store.read("s1", Some(2), None).await.unwrap();
        assert_eq!(
            entries.iter().map(|e| e.entry_id).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[tokio::test]
    async fn payloads_roundtrip_through_storage() {
        let store = store().await;
        store.create_session(new_session("s1")).await.unwrap();

        let payload = EntryPayload::AssistantMessage {
            provider: ProviderKind::Anthropic,
            model: "claude-sonnet-4-20250514".into(),
            content: vec![
                ContentItem::text("thinking done"),
                ContentItem::ToolCall {
                    id: "t1".into(),
                    name: "bash".into(),
                    arguments: serde_json::json!({"command": "ls"}),
                    item_id: None,
                },
            ],
            usage: None,
            stop_reason: wuhu_domain::entry::StopReason::ToolUse,
            error_message: None,
            timestamp: Utc::now(),
        };
        store.append("s1", payload.clone(), None).await.unwrap();

        let entries = store.read_all("s1").await.unwrap();
        assert_eq!(
            serde_json::to_value(&entries[0].payload).unwrap(),
            serde_json::to_value(&payload).unwrap()
        );
    }

    #[tokio::test]
    async fn list_sessions_most_recent_first() {
        let store = store().await;
        store.create_session(new_session("old")).await.unwrap();
        store.create_session(new_session("new")).await.unwrap();
        // Touch "old" via an append so it becomes most recent.
        store
            .append("old", EntryPayload::user_text(None, "hi"), None)
            .await
            .unwrap();

        let sessions = store.list_sessions(None).await.unwrap();
        assert_eq!(sessions[0].id, "old");
        assert_eq!(sessions[1].id, "new");

        let limited = store.list_sessions(Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn repair_appends_error_results() {
        let store = store().await;
        store.create_session(new_session("s1")).await.unwrap();
        let repaired = store
            .repair(
                "s1",
                &[("t1".into(), "bash".into()), ("t2".into(), "read".into())],
            )
            .await
            .unwrap();
        assert_eq!(repaired.len(), 2);
        match &repaired[0].payload {
            EntryPayload::ToolResultMessage {
                tool_call_id,
                is_error,
                content,
                ..
            } => {
                assert_eq!(tool_call_id, "t1");
                assert!(is_error);
                assert_eq!(
                    content[0],
                    wuhu_domain::tool::ToolContent::Text {
                        text: EXECUTION_STOPPED_MESSAGE.into()
                    }
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn append_to_missing_session_is_storage_error() {
        let store = store().await;
        let err = store
            .append("ghost", EntryPayload::user_text(None, "x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, wuhu_domain::Error::Storage(_)));
    }
}
