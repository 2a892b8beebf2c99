//! LLM provider adapters.
//!
//! Three wire variants (Anthropic Messages, OpenAI Responses, and the
//! ChatGPT Codex backend) behind one streaming trait. Each adapter
//! translates the transcript-derived context into its wire format and
//! parses the SSE stream back into typed [`wuhu_domain::stream::AssistantEvent`]s.

pub mod anthropic;
pub mod codex;
pub mod openai;
pub mod registry;
pub mod request_log;
pub mod retry;
mod sse;
pub mod traits;

pub use registry::ProviderRegistry;
pub use request_log::RequestLogger;
pub use retry::{stream_with_retry, RetryEvent, RetryPolicy};
pub use traits::{CacheMode, ContextMessage, ModelRequest, Provider};

use wuhu_domain::error::Error;

pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    Error::Transport(e.to_string())
}

/// Conservative per-model input window used by the compaction trigger.
pub fn max_input_tokens(model: &str) -> u64 {
    if model.starts_with("gpt-4.1") {
        1_000_000
    } else if model.starts_with("o3") || model.starts_with("o4") || model.starts_with("gpt-5") {
        400_000
    } else {
        // Anthropic models and anything unrecognized.
        200_000
    }
}
