//! Context assembly: the pure projection from a transcript to the
//! LLM-side conversation.
//!
//! `assemble(entries, selection)` is a deterministic function of its
//! inputs. Compaction entries substitute a summary for the prefix they
//! cover; displayable custom messages render as `system-reminder:` user
//! messages; tool calls orphaned by a stop are dropped from the LLM view
//! while staying in the transcript.

use std::collections::HashSet;

use wuhu_domain::entry::{
    ContentItem, EntryPayload, SessionEntry, CUSTOM_ASYNC_CALLBACK, CUSTOM_EXECUTION_STOPPED,
    CUSTOM_SYSTEM_REMINDER,
};
use wuhu_domain::session::ModelSelection;
use wuhu_providers::ContextMessage;

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<ContextMessage>,
}

pub fn assemble(entries: &[SessionEntry], selection: &ModelSelection) -> AssembledContext {
    let mut system_prompt = None;

    // Last compaction wins: everything before its boundary collapses into
    // the summary message.
    let compaction = entries
        .iter()
        .rev()
        .find_map(|e| match &e.payload {
            EntryPayload::Compaction {
                first_kept_entry_id,
                summary,
                ..
            } => Some((*first_kept_entry_id, summary.clone())),
            _ => None,
        });

    // Resolved tool calls, and the cursor of the last execution-stopped
    // marker (for orphan dropping).
    let resolved: HashSet<&str> = entries
        .iter()
        .filter_map(|e| match &e.payload {
            EntryPayload::ToolResultMessage { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();
    let last_stop_cursor = entries
        .iter()
        .rev()
        .find_map(|e| match &e.payload {
            EntryPayload::CustomMessage { custom_type, .. }
                if custom_type == CUSTOM_EXECUTION_STOPPED =>
            {
                Some(e.entry_id)
            }
            _ => None,
        });

    let mut messages: Vec<ContextMessage> = Vec::new();
    if let Some((_, summary)) = &compaction {
        messages.push(ContextMessage::user_text(summary.clone()));
    }
    let boundary = compaction.as_ref().map(|(b, _)| *b).unwrap_or(0);

    for entry in entries {
        // The header is global; everything else before the compaction
        // boundary is covered by the summary.
        if let EntryPayload::Header { system_prompt: sp } = &entry.payload {
            system_prompt = Some(sp.clone());
            continue;
        }
        if entry.entry_id < boundary {
            continue;
        }

        match &entry.payload {
            EntryPayload::UserMessage { content, .. } => {
                messages.push(ContextMessage::User {
                    content: content.clone(),
                });
            }

            EntryPayload::AssistantMessage { content, model, .. } => {
                let mut content = content.clone();

                // Cross-model replay: the provider will not accept foreign
                // item ids, so strip them while keeping the call id.
                if selection.provider.replays_items() && model != &selection.model {
                    for item in &mut content {
                        if let ContentItem::ToolCall { item_id, .. } = item {
                            *item_id = None;
                        }
                    }
                }

                // Drop tool calls orphaned by a stop: unresolved and
                // followed by an execution-stopped marker.
                content.retain(|item| match item {
                    ContentItem::ToolCall { id, .. } => {
                        resolved.contains(id.as_str())
                            || !last_stop_cursor.is_some_and(|stop| stop > entry.entry_id)
                    }
                    _ => true,
                });

                messages.push(ContextMessage::Assistant { content });
            }

            EntryPayload::ToolResultMessage {
                tool_call_id,
                tool_name,
                content,
                is_error,
                ..
            } => {
                messages.push(ContextMessage::ToolResult {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    content: content.clone(),
                    is_error: *is_error,
                });
            }

            EntryPayload::CustomMessage {
                custom_type,
                content,
                display,
                ..
            } => {
                let as_reminder = (*display
                    && matches!(
                        custom_type.as_str(),
                        CUSTOM_SYSTEM_REMINDER | CUSTOM_EXECUTION_STOPPED
                    ))
                    || custom_type == CUSTOM_ASYNC_CALLBACK;
                if as_reminder {
                    messages.push(ContextMessage::user_text(format!(
                        "system-reminder: {}",
                        ContentItem::joined_text(content)
                    )));
                }
            }

            // Not part of the LLM view.
            EntryPayload::Header { .. }
            | EntryPayload::SessionSettings { .. }
            | EntryPayload::ToolExecution { .. }
            | EntryPayload::Compaction { .. }
            | EntryPayload::Custom { .. } => {}
        }
    }

    AssembledContext {
        system_prompt,
        messages,
    }
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

    fn selection(provider: ProviderKind, model: &str) -> ModelSelection {
        ModelSelection {
            provider,
            model: model.into(),
            reasoning_effort: None,
        }
    }

    fn assistant_with(model: &str, content: Vec<ContentItem>) -> EntryPayload {
        EntryPayload::AssistantMessage {
            provider: ProviderKind::Openai,
            model: model.into(),
            content,
            usage: None,
            stop_reason: StopReason::ToolUse,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    fn call(id: &str, item_id: Option<&str>) -> ContentItem {
        ContentItem::ToolCall {
            id: id.into(),
            name: "read".into(),
            arguments: serde_json::json!({"path": "x"}),
            item_id: item_id.map(Into::into),
        }
    }

    fn result_for(id: &str) -> EntryPayload {
        EntryPayload::ToolResultMessage {
            tool_call_id: id.into(),
            tool_name: "read".into(),
            content: vec![ToolContent::Text { text: "ok".into() }],
            details: serde_json::Value::Null,
            is_error: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn basic_projection() {
        let entries = vec![
            entry(
                1,
                EntryPayload::Header {
                    system_prompt: "be helpful".into(),
                },
            ),
            entry(2, EntryPayload::user_text(Some("alice".into()), "hi")),
            entry(
                3,
                assistant_with("gpt-4.1-mini", vec![ContentItem::text("hello")]),
            ),
        ];
        let ctx = assemble(&entries, &selection(ProviderKind::Openai, "gpt-4.1-mini"));
        assert_eq!(ctx.system_prompt.as_deref(), Some("be helpful"));
        assert_eq!(ctx.messages.len(), 2);
        assert!(matches!(&ctx.messages[0], ContextMessage::User { .. }));
        assert!(matches!(&ctx.messages[1], ContextMessage::Assistant { .. }));
    }

    #[test]
    fn determinism() {
        let entries = vec![
            entry(
                1,
                EntryPayload::Header {
                    system_prompt: "sp".into(),
                },
            ),
            entry(2, EntryPayload::user_text(None, "q")),
            entry(3, assistant_with("m", vec![call("t1", Some("fc_1"))])),
            entry(4, result_for("t1")),
        ];
        let sel = selection(ProviderKind::Openai, "m");
        let a = serde_json::to_value(&assemble(&entries, &sel).messages).unwrap();
        let b = serde_json::to_value(&assemble(&entries, &sel).messages).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn item_ids_stripped_on_model_change() {
        let entries = vec![
            entry(1, EntryPayload::user_text(None, "q")),
            entry(2, assistant_with("gpt-4.1-mini", vec![call("t1", Some("fc_1"))])),
            entry(3, result_for("t1")),
        ];

        // Same model: item id kept.
        let same = assemble(&entries, &selection(ProviderKind::Openai, "gpt-4.1-mini"));
        match &same.messages[1] {
            ContextMessage::Assistant { content } => match &content[0] {
                ContentItem::ToolCall { item_id, .. } => {
                    assert_eq!(item_id.as_deref(), Some("fc_1"))
                }
                other => panic!("unexpected: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }

        // Different model: item id stripped, call id kept.
        let switched = assemble(&entries, &selection(ProviderKind::Openai, "o3"));
        match &switched.messages[1] {
            ContextMessage::Assistant { content } => match &content[0] {
                ContentItem::ToolCall { id, item_id, .. } => {
                    assert_eq!(id, "t1");
                    assert!(item_id.is_none());
                }
                other => panic!("unexpected: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }

        // Anthropic does not replay items; nothing stripped.
        let anthropic = assemble(&entries, &selection(ProviderKind::Anthropic, "claude-x"));
        match &anthropic.messages[1] {
            ContextMessage::Assistant { content } => match &content[0] {
                ContentItem::ToolCall { item_id, .. } => {
                    assert_eq!(item_id.as_deref(), Some("fc_1"))
                }
                other => panic!("unexpected: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn compaction_replaces_prefix_with_summary() {
        let entries = vec![
            entry(
                1,
                EntryPayload::Header {
                    system_prompt: "sp".into(),
                },
            ),
            entry(2, EntryPayload::user_text(None, "old question")),
            entry(3, assistant_with("m", vec![ContentItem::text("old answer")])),
            entry(
                4,
                EntryPayload::Compaction {
                    tokens_before: 1000,
                    first_kept_entry_id: 5,
                    summary: "the user asked about X".into(),
                },
            ),
            entry(5, EntryPayload::user_text(None, "new question")),
        ];
        let ctx = assemble(&entries, &selection(ProviderKind::Openai, "m"));
        assert_eq!(ctx.system_prompt.as_deref(), Some("sp"));
        assert_eq!(ctx.messages.len(), 2);
        match &ctx.messages[0] {
            ContextMessage::User { content } => {
                assert_eq!(ContentItem::joined_text(content), "the user asked about X")
            }
            other => panic!("unexpected: {other:?}"),
        }
        match &ctx.messages[1] {
            ContextMessage::User { content } => {
                assert_eq!(ContentItem::joined_text(content), "new question")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn orphaned_calls_dropped_after_stop() {
        let entries = vec![
            entry(1, EntryPayload::user_text(None, "go")),
            entry(
                2,
                assistant_with("m", vec![call("t1", None), call("t2", None)]),
            ),
            entry(3, result_for("t1")),
            entry(
                4,
                EntryPayload::custom_text(CUSTOM_EXECUTION_STOPPED, "Execution stopped", true),
            ),
        ];
        let ctx = assemble(&entries, &selection(ProviderKind::Openai, "m"));
        match &ctx.messages[1] {
            ContextMessage::Assistant { content } => {
                let ids: Vec<&str> = content
                    .iter()
                    .filter_map(|c| match c {
                        ContentItem::ToolCall { id, .. } => Some(id.as_str()),
                        _ => None,
                    })
                    .collect();
                assert_eq!(ids, vec!["t1"]); // t2 dropped, t1 resolved
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The stop marker renders as a system reminder.
        match ctx.messages.last().unwrap() {
            ContextMessage::User { content } => {
                assert!(ContentItem::joined_text(content).starts_with("system-reminder:"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn async_callbacks_surface_even_without_display() {
        let entries = vec![entry(
            1,
            EntryPayload::custom_text(CUSTOM_ASYNC_CALLBACK, r#"{"exit_code":0}"#, false),
        )];
        let ctx = assemble(&entries, &selection(ProviderKind::Openai, "m"));
        assert_eq!(ctx.messages.len(), 1);
        match &ctx.messages[0] {
            ContextMessage::User { content } => {
                assert!(ContentItem::joined_text(content).contains("exit_code"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bookkeeping_entries_are_invisible() {
        let entries = vec![
            entry(
                1,
                EntryPayload::SessionSettings {
                    provider: ProviderKind::Openai,
                    model: "m".into(),
                    reasoning_effort: None,
                },
            ),
            entry(
                2,
                EntryPayload::ToolExecution {
                    phase: wuhu_domain::entry::ToolExecutionPhase::Start,
                    tool_call_id: "t1".into(),
                    tool_name: "bash".into(),
                    arguments: None,
                    result: None,
                    is_error: None,
                },
            ),
            entry(
                3,
                EntryPayload::Custom {
                    custom_type: "llm.retry".into(),
                    data: serde_json::json!({}),
                },
            ),
        ];
        let ctx = assemble(&entries, &selection(ProviderKind::Openai, "m"));
        assert!(ctx.messages.is_empty());
    }
}
