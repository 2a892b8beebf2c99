//! Provider streaming events.

use serde::Serialize;
use std::pin::Pin;

use crate::entry::{ContentItem, StopReason, Usage};
use crate::tool::ToolCall;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// The assistant message as accumulated from a stream.
#[derive(Debug, Clone, Serialize)]
pub struct AssistantDraft {
    pub content: Vec<ContentItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub stop_reason: StopReason,
}

/// Events emitted while streaming one LLM inference (provider-agnostic).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantEvent {
    /// The provider accepted the request and began responding.
    Start,

    /// A chunk of assistant text.
    TextDelta { delta: String },

    /// A chunk of reasoning/thinking text (provider-dependent).
    ReasoningDelta { delta: String },

    /// A fully assembled tool call.
    ToolCall { call: ToolCall },

    /// Token usage; may fire mid-stream and again at the end.
    Usage { usage: Usage },

    /// The final assistant message.
    Done { message: AssistantDraft },
}
