use serde::{Deserialize, Serialize};

use wuhu_domain::entry::ContentItem;
use wuhu_domain::error::Result;
use wuhu_domain::session::ReasoningEffort;
use wuhu_domain::stream::{AssistantEvent, BoxStream};
use wuhu_domain::tool::{ToolContent, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One message of the LLM-side conversation, as projected from the
/// transcript by context assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ContextMessage {
    User {
        content: Vec<ContentItem>,
    },
    Assistant {
        content: Vec<ContentItem>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ToolContent>,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContextMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        ContextMessage::User {
            content: vec![ContentItem::text(text)],
        }
    }
}

/// Anthropic prompt-caching behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Top-level `cache_control.type = "ephemeral"`.
    #[default]
    Automatic,
    /// `cache_control` on the system prompt's last block and the last
    /// content block of the most recent user message.
    ExplicitBreakpoints,
}

/// A provider-agnostic streaming request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ContextMessage>,
    pub tools: Vec<ToolDefinition>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Session id, forwarded to providers that key prompt caches on it.
    pub session_id: Option<String>,
    pub cache_mode: CacheMode,
    pub max_output_tokens: Option<u32>,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            messages: Vec::new(),
            tools: Vec::new(),
            reasoning_effort: None,
            session_id: None,
            cache_mode: CacheMode::default(),
            max_output_tokens: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements.
///
/// `stream` opens the HTTP request and returns the lazily-parsed SSE event
/// sequence. Request-level failures (connect, non-2xx) surface from
/// `stream` itself so the retry wrapper can re-establish; mid-stream
/// failures surface as `Err` items in the sequence.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    async fn stream(
        &self,
        req: &ModelRequest,
    ) -> Result<BoxStream<'static, Result<AssistantEvent>>>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
