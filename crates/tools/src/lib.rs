//! Built-in tool implementations.
//!
//! File I/O, search, and process execution against a session's working
//! directory. Tool names and argument shapes are fixed; results are
//! structured [`wuhu_domain::tool::ToolResult`]s where `is_error`
//! distinguishes tool-reported failure (visible to the LLM) from an
//! executor fault.

pub mod exec;
pub mod fs;
pub mod registry;
pub mod search;

pub use exec::{AsyncTaskCallback, AsyncTaskOutcome};
pub use registry::{builtin_definitions, LocalToolHost};
