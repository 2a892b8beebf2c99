//! Built-in tool definitions and local dispatch.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use wuhu_domain::tool::{ToolDefinition, ToolResult};

use crate::exec::{self, AsyncTaskCallback};
use crate::fs;
use crate::search;

/// Definitions for the fixed built-in tool set, in the order they are
/// presented to the model.
pub fn builtin_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "read".into(),
            description: "Read a file, returning numbered lines. Large files are truncated."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "line_range": {
                        "type": "array",
                        "items": { "type": "integer" },
                        "minItems": 2,
                        "maxItems": 2,
                        "description": "1-indexed inclusive [start, end]"
                    }
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "write".into(),
            description: "Create or overwrite a file, creating intermediate directories.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        },
        ToolDefinition {
            name: "edit".into(),
            description: "Replace an exact substring in a file. Fails unless the match is \
                          unique or replace_all is set."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old_string": { "type": "string" },
                    "new_string": { "type": "string" },
                    "replace_all": { "type": "boolean" }
                },
                "required": ["path", "old_string", "new_string"]
            }),
        },
        ToolDefinition {
            name: "bash".into(),
            description: "Run a shell command synchronously, capturing output and exit code. \
                          Default timeout 120s."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "timeout_ms": { "type": "integer" }
                },
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: "async_bash".into(),
            description: "Launch a shell command in the background and return a task id \
                          immediately. Completion arrives later as a notification."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" }
                },
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: "grep".into(),
            description: "Regex search over file contents, honoring .gitignore.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" },
                    "include": { "type": "string", "description": "file name glob, e.g. *.rs" }
                },
                "required": ["pattern"]
            }),
        },
        ToolDefinition {
            name: "ls".into(),
            description: "List directory entries.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "find".into(),
            description: "Glob-match relative paths, honoring .gitignore.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["pattern"]
            }),
        },
    ]
}

/// Executes built-in tools in the server process against a session's
/// working directory.
#[derive(Clone)]
pub struct LocalToolHost {
    cwd: PathBuf,
    async_callback: AsyncTaskCallback,
}

impl LocalToolHost {
    pub fn new(cwd: PathBuf, async_callback: AsyncTaskCallback) -> Self {
        Self {
            cwd,
            async_callback,
        }
    }

    /// Host without async-completion delivery (runner-side and tests).
    pub fn without_callback(cwd: PathBuf) -> Self {
        Self::new(cwd, Arc::new(|_| {}))
    }

    pub async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        macro_rules! parse {
            ($ty:ty) => {
                match serde_json::from_value::<$ty>(args) {
                    Ok(req) => req,
                    Err(e) => {
                        return ToolResult::error(format!(
                            "invalid arguments for '{tool_name}': {e}"
                        ))
                    }
                }
            };
        }

        match tool_name {
            "read" => fs::read(&self.cwd, parse!(fs::ReadRequest)).await,
            "write" => fs::write(&self.cwd, parse!(fs::WriteRequest)).await,
            "edit" => fs::edit(&self.cwd, parse!(fs::EditRequest)).await,
            "ls" => fs::ls(&self.cwd, parse!(fs::LsRequest)).await,
            "grep" => search::grep(&self.cwd, parse!(search::GrepRequest)).await,
            "find" => search::find(&self.cwd, parse!(search::FindRequest)).await,
            "bash" => exec::bash(&self.cwd, parse!(exec::BashRequest), cancel).await,
            "async_bash" => exec::async_bash(
                &self.cwd,
                parse!(exec::AsyncBashRequest),
                self.async_callback.clone(),
            ),
            other => ToolResult::error(format!("unknown tool '{other}'")),
        }
    }
}
