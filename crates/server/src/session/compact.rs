//! Compaction: bound the LLM context by summarizing the transcript prefix.
//!
//! Triggered between turns when the estimated context size exceeds 75% of
//! the model's input window. The summary is produced by the session's own
//! provider and recorded as a `compaction` entry; context assembly then
//! substitutes it for everything before `first_kept_entry_id`.

use futures_util::StreamExt;

use wuhu_domain::entry::{ContentItem, EntryPayload};
use wuhu_domain::error::{Error, Result};
use wuhu_domain::session::ModelSelection;
use wuhu_domain::stream::AssistantEvent;
use wuhu_providers::{
    max_input_tokens, stream_with_retry, ContextMessage, ModelRequest, Provider, RetryPolicy,
};

use super::context::AssembledContext;

const COMPACTION_THRESHOLD: f64 = 0.75;

const SUMMARIZATION_PROMPT: &str = "You summarize coding-agent sessions. Produce a compact \
summary of the conversation so far that preserves: the user's goals, decisions made, files \
created or modified (with paths), commands run and their outcomes, and any unresolved work. \
Write plain prose; the summary replaces the full history in the model's context.";

/// chars/4 heuristic over every piece of text the context carries.
pub fn estimated_tokens(ctx: &AssembledContext) -> u64 {
    let mut chars = ctx.system_prompt.as_deref().map(str::len).unwrap_or(0);
    for msg in &ctx.messages {
        chars += match msg {
            ContextMessage::User { content } | ContextMessage::Assistant { content } => content
                .iter()
                .map(|c| match c {
                    ContentItem::Text { text, .. } => text.len(),
                    ContentItem::ToolCall { arguments, .. } => arguments.to_string().len(),
                    ContentItem::Reasoning {
                        summary,
                        encrypted_content,
                        ..
                    } => {
                        summary.as_deref().map(str::len).unwrap_or(0)
                            + encrypted_content.as_deref().map(str::len).unwrap_or(0)
                    }
                })
                .sum::<usize>(),
            ContextMessage::ToolResult { content, .. } => content
                .iter()
                .map(|c| match c {
                    wuhu_domain::tool::ToolContent::Text { text } => text.len(),
                    wuhu_domain::tool::ToolContent::Image { data, .. } => data.len(),
                })
                .sum::<usize>(),
        };
    }
    (chars / 4) as u64
}

pub fn should_compact(ctx: &AssembledContext, model: &str) -> bool {
    estimated_tokens(ctx) as f64 > max_input_tokens(model) as f64 * COMPACTION_THRESHOLD
}

/// Summarize the current context. Returns the summary text; the caller
/// freezes the cursor and appends the `compaction` entry.
pub async fn summarize(
    provider: &dyn Provider,
    selection: &ModelSelection,
    ctx: &AssembledContext,
) -> Result<String> {
    let mut messages = ctx.messages.clone();
    messages.push(ContextMessage::user_text(
        "Summarize the conversation above now.",
    ));

    let mut req = ModelRequest::new(selection.model.clone());
    req.system_prompt = Some(SUMMARIZATION_PROMPT.to_string());
    req.messages = messages;
    req.reasoning_effort = selection.reasoning_effort;

    let mut stream = stream_with_retry(provider, &req, &RetryPolicy::default(), |_| {}).await?;

    let mut summary = None;
    while let Some(event) = stream.next().await {
        if let AssistantEvent::Done { message } = event? {
            summary = Some(ContentItem::joined_text(&message.content));
        }
    }
    summary
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::Decoding("summarization produced no text".into()))
}

/// The `compaction` entry payload for a freeze point.
pub fn compaction_payload(tokens_before: u64, freeze: u64, summary: String) -> EntryPayload {
    EntryPayload::Compaction {
        tokens_before,
        first_kept_entry_id: freeze + 1,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_text(chars: usize) -> AssembledContext {
        AssembledContext {
            system_prompt: None,
            messages: vec![ContextMessage::user_text("x".repeat(chars))],
        }
    }

    #[test]
    fn estimate_is_chars_over_four() {
        assert_eq!(estimated_tokens(&ctx_with_text(4000)), 1000);
    }

    #[test]
    fn threshold_uses_model_window() {
        // Unknown model → 200k window; threshold at 150k tokens = 600k chars.
        assert!(!should_compact(&ctx_with_text(500_000), "mystery-model"));
        assert!(should_compact(&ctx_with_text(700_000), "mystery-model"));
    }

    #[test]
    fn payload_keeps_entries_after_freeze() {
        match compaction_payload(120_000, 40, "s".into()) {
            EntryPayload::Compaction {
                first_kept_entry_id,
                tokens_before,
                ..
            } => {
                assert_eq!(first_kept_entry_id, 41);
                assert_eq!(tokens_before, 120_000);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
