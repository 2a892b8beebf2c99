//! Crash recovery over the transcript.
//!
//! The agent loop journals `tool_execution.end` before appending the
//! `tool_result` message entry. A crash between the two leaves a committed
//! end record with no result message; on restart the missing append is
//! re-executed from the recorded result, making the loop an idempotent
//! reducer over the transcript.

use std::collections::HashSet;

use serde_json::Value;

use wuhu_domain::entry::{EntryPayload, SessionEntry, ToolExecutionPhase};
use wuhu_domain::error::Result;
use wuhu_domain::tool::{ToolContent, ToolResult};

use crate::{QueueStore, TranscriptStore};

/// Reconcile one session after a restart. Returns the re-appended
/// `tool_result` entries (empty when the transcript was consistent).
pub async fn reconcile_session(
    transcripts: &TranscriptStore,
    queues: &QueueStore,
    session_id: &str,
) -> Result<Vec<SessionEntry>> {
    let entries = transcripts.read_all(session_id).await?;

    let resolved: HashSet<&str> = entries
        .iter()
        .filter_map(|e| match &e.payload {
            EntryPayload::ToolResultMessage { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();

    // Committed ends whose result message never landed, in order.
    let mut orphaned: Vec<(String, String, Option<Value>, bool)> = Vec::new();
    for entry in &entries {
        if let EntryPayload::ToolExecution {
            phase: ToolExecutionPhase::End,
            tool_call_id,
            tool_name,
            result,
            is_error,
            ..
        } = &entry.payload
        {
            if !resolved.contains(tool_call_id.as_str()) {
                orphaned.push((
                    tool_call_id.clone(),
                    tool_name.clone(),
                    result.clone(),
                    is_error.unwrap_or(false),
                ));
            }
        }
    }

    let mut repaired = Vec::with_capacity(orphaned.len());
    for (tool_call_id, tool_name, result, is_error) in orphaned {
        let tool_result = result
            .and_then(|v| serde_json::from_value::<ToolResult>(v).ok())
            .unwrap_or_else(|| ToolResult {
                content: vec![ToolContent::Text {
                    text: "(result lost in crash)".into(),
                }],
                details: Value::Null,
                is_error,
            });
        let payload = EntryPayload::ToolResultMessage {
            tool_call_id: tool_call_id.clone(),
            tool_name,
            content: tool_result.content,
            details: tool_result.details,
            is_error: tool_result.is_error,
            timestamp: chrono::Utc::now(),
        };
        let entry = transcripts.append(session_id, payload, None).await?;
        tracing::info!(
            session_id,
            tool_call_id = %tool_call_id,
            entry_id = entry.entry_id,
            "recovered missing tool_result from committed tool_execution.end"
        );
        repaired.push(entry);
    }

    let fixed = queues.reconcile(session_id).await?;
    if !fixed.is_empty() {
        tracing::info!(
            session_id,
            items = fixed.len(),
            "reconciled orphaned pending queue items"
        );
    }

    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::NewSession;
    use crate::Database;
    use wuhu_domain::session::{ModelSelection, ProviderKind, ResolvedEnvironment};

    async fn stores() -> (TranscriptStore, QueueStore) {
        let transcripts = TranscriptStore::new(Database::open_in_memory().await.unwrap());
        let queues = QueueStore::sharing(&transcripts);
        transcripts
            .create_session(NewSession {
                id: "s1".into(),
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
            })
            .await
            .unwrap();
        (transcripts, queues)
    }

    fn end_entry(tool_call_id: &str, output: &str) -> EntryPayload {
        let result = ToolResult::text(output);
        EntryPayload::ToolExecution {
            phase: ToolExecutionPhase::End,
            tool_call_id: tool_call_id.into(),
            tool_name: "bash".into(),
            arguments: None,
            result: Some(serde_json::to_value(&result).unwrap()),
            is_error: Some(false),
        }
    }

    #[tokio::test]
    async fn replays_missing_tool_result_from_committed_end() {
        let (transcripts, queues) = stores().await;

        // Simulate a crash after tool_execution.end committed but before
        // the tool_result message entry.
        transcripts
            .append("s1", end_entry("t1", "file contents"), None)
            .await
            .unwrap();

        let repaired = reconcile_session(&transcripts, &queues, "s1")
            .await
            .unwrap();
        assert_eq!(repaired.len(), 1);
        match &repaired[0].payload {
            EntryPayload::ToolResultMessage {
                tool_call_id,
                content,
                is_error,
                ..
            } => {
                assert_eq!(tool_call_id, "t1");
                assert!(!is_error);
                assert_eq!(
                    content[0],
                    ToolContent::Text {
                        text: "file contents".into()
                    }
                );
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        // Idempotent: a second pass finds nothing to repair.
        let again = reconcile_session(&transcripts, &queues, "s1")
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn consistent_transcript_is_untouched() {
        let (transcripts, queues) = stores().await;
        transcripts
            .append("s1", end_entry("t1", "ok"), None)
            .await
            .unwrap();
        transcripts
            .append(
                "s1",
                EntryPayload::ToolResultMessage {
                    tool_call_id: "t1".into(),
                    tool_name: "bash".into(),
                    content: vec![ToolContent::Text { text: "ok".into() }],
                    details: Value::Null,
                    is_error: false,
                    timestamp: chrono::Utc::now(),
                },
                None,
            )
            .await
            .unwrap();

        let repaired = reconcile_session(&transcripts, &queues, "s1")
            .await
            .unwrap();
        assert!(repaired.is_empty());
        assert_eq!(transcripts.tail("s1").await.unwrap(), Some(2));
    }
}
