/// Shared error type used across all wuhu crates.
///
/// Variants follow the engine's error taxonomy: `Transport` and retryable
/// `Provider` errors are retried with backoff, `Tool`/`ExecutorFault`
/// become error tool results, `Storage`/`Decoding` end the turn, and
/// `Cancelled` drives the stop-repair flow.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Network, TLS, or socket failure talking to a provider or runner.
    #[error("transport: {0}")]
    Transport(String),

    /// Well-formed HTTP error from an LLM provider.
    #[error("provider {provider}: HTTP {status} - {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
    },

    /// Malformed frame or payload; fatal for the in-flight turn only.
    #[error("decoding: {0}")]
    Decoding(String),

    /// Database read/write failure.
    #[error("storage: {0}")]
    Storage(String),

    /// A tool reported failure (`is_error = true`); surfaced to the LLM.
    #[error("tool {tool_name}: {message}")]
    Tool { tool_name: String, message: String },

    /// Unexpected fault during tool dispatch (runner crash, panic).
    #[error("executor: {0}")]
    ExecutorFault(String),

    /// The turn was stopped by the user.
    #[error("cancelled")]
    Cancelled,

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Whether a failed provider request should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Provider { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
