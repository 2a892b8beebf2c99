//! The transcript entry model.
//!
//! A session's transcript is an append-only log of [`SessionEntry`] rows.
//! `entry_id` is a per-session strictly increasing integer (the *cursor*);
//! the payload is a tagged union covering every observable event: user and
//! assistant messages, tool lifecycle, compaction, settings changes, and
//! extensible custom envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{ProviderKind, ReasoningEffort};
use crate::tool::ToolContent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Custom entry type tags
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `message.custom` marker appended after a stop repairs pending tool calls.
pub const CUSTOM_EXECUTION_STOPPED: &str = "execution_stopped";
/// `message.custom` rendered into context as a `system-reminder:` message.
pub const CUSTOM_SYSTEM_REMINDER: &str = "system_reminder";
/// `message.custom` carrying an async task completion (system-urgent lane).
pub const CUSTOM_ASYNC_CALLBACK: &str = "async_callback";
/// `custom` telemetry entry emitted on each LLM retry.
pub const CUSTOM_LLM_RETRY: &str = "llm.retry";
/// `custom` telemetry entry emitted when LLM retries are exhausted.
pub const CUSTOM_LLM_GIVE_UP: &str = "llm.give_up";

/// Content of the synthetic tool results appended by stop repair.
pub const EXECUTION_STOPPED_MESSAGE: &str = "Execution stopped by user";
/// Content of the error tool results for calls preempted by a steer.
pub const STEER_SKIPPED_MESSAGE: &str = "Skipped due to queued user message";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One row of a session's transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub entry_id: u64,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_entry_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub payload: EntryPayload,
}

impl SessionEntry {
    /// Tool calls carried by an assistant entry, in content order.
    pub fn tool_calls(&self) -> Vec<&ContentItem> {
        match &self.payload {
            EntryPayload::AssistantMessage { content, .. } => content
                .iter()
                .filter(|c| matches!(c, ContentItem::ToolCall { .. }))
                .collect(),
            _ => Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload union
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EntryPayload {
    /// The session's system prompt. Exactly once, at entry 1.
    #[serde(rename = "header")]
    Header { system_prompt: String },

    #[serde(rename = "message.user")]
    UserMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        content: Vec<ContentItem>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "message.assistant")]
    AssistantMessage {
        provider: ProviderKind,
        model: String,
        content: Vec<ContentItem>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        stop_reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "message.tool_result")]
    ToolResultMessage {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ToolContent>,
        #[serde(default)]
        details: Value,
        #[serde(default)]
        is_error: bool,
        timestamp: DateTime<Utc>,
    },

    /// System reminders, execution-stopped markers, async callbacks.
    #[serde(rename = "message.custom")]
    CustomMessage {
        custom_type: String,
        content: Vec<ContentItem>,
        #[serde(default)]
        details: Value,
        #[serde(default)]
        display: bool,
        timestamp: DateTime<Utc>,
    },

    /// Runner-side tool lifecycle, journaled around each dispatch.
    #[serde(rename = "tool_execution")]
    ToolExecution {
        phase: ToolExecutionPhase,
        tool_call_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    #[serde(rename = "compaction")]
    Compaction {
        tokens_before: u64,
        first_kept_entry_id: u64,
        summary: String,
    },

    /// Emitted on model change.
    #[serde(rename = "session_settings")]
    SessionSettings {
        provider: ProviderKind,
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning_effort: Option<ReasoningEffort>,
    },

    /// Extensible envelope (LLM retry/give-up telemetry and the like).
    #[serde(rename = "custom")]
    Custom { custom_type: String, data: Value },
}

impl EntryPayload {
    /// A plain-text user message.
    pub fn user_text(user: Option<String>, text: impl Into<String>) -> Self {
        EntryPayload::UserMessage {
            user,
            content: vec![ContentItem::Text {
                text: text.into(),
                signature: None,
            }],
            timestamp: Utc::now(),
        }
    }

    /// A `message.custom` with a single text content item.
    pub fn custom_text(
        custom_type: impl Into<String>,
        text: impl Into<String>,
        display: bool,
    ) -> Self {
        EntryPayload::CustomMessage {
            custom_type: custom_type.into(),
            content: vec![ContentItem::Text {
                text: text.into(),
                signature: None,
            }],
            details: Value::Null,
            display,
            timestamp: Utc::now(),
        }
    }

    /// An error tool result, as appended by stop repair and steer skips.
    pub fn error_tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EntryPayload::ToolResultMessage {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            details: Value::Null,
            is_error: true,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolExecutionPhase {
    Start,
    End,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One element of a message's `content[]` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentItem {
    #[serde(rename = "text")]
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    #[serde(rename = "tool_call")]
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
        /// Provider-side item id (OpenAI Responses); dropped when replaying
        /// across a model change.
        #[serde(skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },

    #[serde(rename = "reasoning")]
    Reasoning {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        encrypted_content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::Text {
            text: text.into(),
            signature: None,
        }
    }

    /// Join all text items, skipping tool calls and reasoning.
    pub fn joined_text(items: &[ContentItem]) -> String {
        items
            .iter()
            .filter_map(|c| match c {
                ContentItem::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Usage / stop reason
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token usage for one LLM inference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
}

/// Why an assistant message stopped. Provider stop reasons are normalized
/// at the adapter boundary (`end_turn` → `stop`, `max_tokens` → `length`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
}
