//! Execution-state inference: derive a session's status from its
//! transcript tail instead of storing it.

use std::collections::HashSet;

use wuhu_domain::entry::{ContentItem, EntryPayload, SessionEntry, CUSTOM_EXECUTION_STOPPED};
use wuhu_domain::session::SessionStatus;

#[derive(PartialEq)]
enum LastMarker {
    None,
    User,
    Assistant,
    Stopped,
}

/// Compute the derived status from the transcript.
///
/// - an assistant `tool_call` with no matching `tool_result` and no later
///   execution-stopped marker → `executing` (pending ids enumerated)
/// - a trailing user-visible message with no later assistant → `executing`
/// - a trailing execution-stopped marker → `stopped`
/// - otherwise → `idle`
pub fn infer(entries: &[SessionEntry]) -> SessionStatus {
    // Insertion-ordered pending set.
    let mut pending: Vec<String> = Vec::new();
    let mut pending_ids: HashSet<String> = HashSet::new();
    let mut last = LastMarker::None;

    for entry in entries {
        match &entry.payload {
            EntryPayload::AssistantMessage { content, .. } => {
                for item in content {
                    if let ContentItem::ToolCall { id, .. } = item {
                        if pending_ids.insert(id.clone()) {
                            pending.push(id.clone());
                        }
                    }
                }
                last = LastMarker::Assistant;
            }
            EntryPayload::ToolResultMessage { tool_call_id, .. } => {
                if pending_ids.remove(tool_call_id) {
                    pending.retain(|id| id != tool_call_id);
                }
            }
            EntryPayload::CustomMessage { custom_type, .. } => {
                if custom_type == CUSTOM_EXECUTION_STOPPED {
                    pending.clear();
                    pending_ids.clear();
                    last = LastMarker::Stopped;
                } else {
                    // System reminders and async callbacks enter the LLM
                    // context as user-role messages.
                    last = LastMarker::User;
                }
            }
            EntryPayload::UserMessage { .. } => {
                last = LastMarker::User;
            }
            EntryPayload::Header { .. }
            | EntryPayload::SessionSettings { .. }
            | EntryPayload::Compaction { .. }
            | EntryPayload::ToolExecution { .. }
            | EntryPayload::Custom { .. } => {}
        }
    }

    if !pending.is_empty() {
        return SessionStatus::Executing {
            pending_tool_call_ids: pending,
        };
    }
    match last {
        LastMarker::User => SessionStatus::Executing {
            pending_tool_call_ids: Vec::new(),
        },
        LastMarker::Stopped => SessionStatus::Stopped,
        LastMarker::Assistant | LastMarker::None => SessionStatus::Idle,
    }
}

/// Whether the agent loop still owes work: the session is executing, or
/// the transcript ends in tool results whose follow-up inference never ran
/// (crash between a tool batch and the next drafting step).
pub fn work_owed(entries: &[SessionEntry]) -> bool {
    if matches!(infer(entries), SessionStatus::Executing { .. }) {
        return true;
    }
    for entry in entries.iter().rev() {
        match &entry.payload {
            EntryPayload::ToolResultMessage { .. } => return true,
            EntryPayload::ToolExecution { .. }
            | EntryPayload::Custom { .. }
            | EntryPayload::SessionSettings { .. }
            | EntryPayload::Compaction { .. } => continue,
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wuhu_domain::entry::StopReason;
    use wuhu_domain::session::ProviderKind;
    use wuhu_domain::tool::ToolContent;

    fn entry(id: u64, payload: EntryPayload) -> SessionEntry {
        SessionEntry {
            entry_id: id,
            session_id: "s1".into(),
            parent_entry_id: None,
            created_at: Utc::now(),
            payload,
        }
    }

    fn header() -> EntryPayload {
        EntryPayload::Header {
            system_prompt: "sp".into(),
        }
    }

    fn assistant(content: Vec<ContentItem>, stop_reason: StopReason) -> EntryPayload {
        EntryPayload::AssistantMessage {
            provider: ProviderKind::Openai,
            model: "gpt-4.1-mini".into(),
            content,
            usage: None,
            stop_reason,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    fn tool_call(id: &str) -> ContentItem {
        ContentItem::ToolCall {
            id: id.into(),
            name: "bash".into(),
            arguments: serde_json::json!({}),
            item_id: None,
        }
    }

    fn tool_result(id: &str) -> EntryPayload {
        EntryPayload::ToolResultMessage {
            tool_call_id: id.into(),
            tool_name: "bash".into(),
            content: vec![ToolContent::Text { text: "ok".into() }],
            details: serde_json::Value::Null,
            is_error: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn empty_transcript_is_idle() {
        assert_eq!(infer(&[]), SessionStatus::Idle);
        assert_eq!(infer(&[entry(1, header())]), SessionStatus::Idle);
    }

    #[test]
    fn trailing_user_message_is_executing() {
        let entries = vec![
            entry(1, header()),
            entry(2, EntryPayload::user_text(None, "hello")),
        ];
        assert_eq!(
            infer(&entries),
            SessionStatus::Executing {
                pending_tool_call_ids: vec![]
            }
        );
    }

    #[test]
    fn completed_exchange_is_idle() {
        let entries = vec![
            entry(1, header()),
            entry(2, EntryPayload::user_text(None, "hello")),
            entry(
                3,
                assistant(vec![ContentItem::text("hi")], StopReason::Stop),
            ),
        ];
        assert_eq!(infer(&entries), SessionStatus::Idle);
    }

    #[test]
    fn unresolved_tool_call_is_executing_with_ids() {
        let entries = vec![
            entry(1, header()),
            entry(2, EntryPayload::user_text(None, "go")),
            entry(
                3,
                assistant(vec![tool_call("t1"), tool_call("t2")], StopReason::ToolUse),
            ),
            entry(4, tool_result("t1")),
        ];
        assert_eq!(
            infer(&entries),
            SessionStatus::Executing {
                pending_tool_call_ids: vec!["t2".into()]
            }
        );
    }

    #[test]
    fn execution_stopped_clears_pending_and_stops() {
        let entries = vec![
            entry(1, header()),
            entry(2, EntryPayload::user_text(None, "go")),
            entry(3, assistant(vec![tool_call("t1")], StopReason::ToolUse)),
            entry(
                4,
                EntryPayload::custom_text(CUSTOM_EXECUTION_STOPPED, "stopped", true),
            ),
        ];
        assert_eq!(infer(&entries), SessionStatus::Stopped);
    }

    #[test]
    fn trailing_tool_result_owes_an_inference() {
        let entries = vec![
            entry(1, header()),
            entry(2, EntryPayload::user_text(None, "go")),
            entry(3, assistant(vec![tool_call("t1")], StopReason::ToolUse)),
            entry(4, tool_result("t1")),
        ];
        // Pending set is empty, so the derived status is idle...
        assert_eq!(infer(&entries), SessionStatus::Idle);
        // ...but the loop still owes the post-batch inference.
        assert!(work_owed(&entries));

        let finished = vec![
            entry(1, header()),
            entry(2, EntryPayload::user_text(None, "hi")),
            entry(
                3,
                assistant(vec![ContentItem::text("done")], StopReason::Stop),
            ),
        ];
        assert!(!work_owed(&finished));
    }

    #[test]
    fn prompt_after_stop_is_executing_again() {
        let entries = vec![
            entry(1, header()),
            entry(
                2,
                EntryPayload::custom_text(CUSTOM_EXECUTION_STOPPED, "stopped", true),
            ),
            entry(3, EntryPayload::user_text(None, "try again")),
        ];
        assert_eq!(
            infer(&entries),
            SessionStatus::Executing {
                pending_tool_call_ids: vec![]
            }
        );
    }
}
