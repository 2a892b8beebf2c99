//! Runner protocol: the JSON WebSocket frames exchanged between the server
//! and tool runners.
//!
//! Runners connect to the server (preferred) or the server dials a
//! configured runner address; in both directions the first frame is
//! `hello`. Tool calls flow as `tool_request` → `tool_response` keyed by a
//! request id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use wuhu_domain::session::ResolvedEnvironment;
use wuhu_domain::tool::ToolResult;

/// Max tool response payload size in bytes (4 MB). Runners should truncate
/// results exceeding this.
pub const MAX_TOOL_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// WebSocket frame envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerFrame {
    /// First frame in both directions.
    Hello { runner_name: String, version: String },

    /// Server → Runner: resolve a named environment on the runner.
    ResolveEnvironmentRequest {
        id: String,
        session_id: String,
        name: String,
    },

    /// Runner → Server.
    ResolveEnvironmentResponse {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        environment: Option<ResolvedEnvironment>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Server → Runner: bind a session to its resolved environment.
    RegisterSession {
        session_id: String,
        environment: ResolvedEnvironment,
    },

    /// Server → Runner: execute a tool call.
    ToolRequest {
        id: String,
        session_id: String,
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },

    /// Runner → Server: tool call outcome.
    ToolResponse {
        id: String,
        session_id: String,
        tool_call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<ToolResult>,
        #[serde(default)]
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &RunnerFrame) -> RunnerFrame {
        let json = serde_json::to_string(frame).unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn hello_roundtrips() {
        let frame = RunnerFrame::Hello {
            runner_name: "builder".into(),
            version: "0.1.0".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["runner_name"], "builder");
        assert_eq!(
            serde_json::to_value(roundtrip(&frame)).unwrap(),
            json
        );
    }

    #[test]
    fn tool_request_response_roundtrip() {
        let request = RunnerFrame::ToolRequest {
            id: "req_1".into(),
            session_id: "s1".into(),
            tool_call_id: "t1".into(),
            tool_name: "bash".into(),
            args: serde_json::json!({"command": "ls"}),
        };
        let before = serde_json::to_value(&request).unwrap();
        assert_eq!(before["type"], "tool_request");
        assert_eq!(serde_json::to_value(roundtrip(&request)).unwrap(), before);

        let response = RunnerFrame::ToolResponse {
            id: "req_1".into(),
            session_id: "s1".into(),
            tool_call_id: "t1".into(),
            result: Some(ToolResult::text("ok")),
            is_error: false,
            error_message: None,
        };
        let before = serde_json::to_value(&response).unwrap();
        assert!(before.get("error_message").is_none());
        assert_eq!(serde_json::to_value(roundtrip(&response)).unwrap(), before);
    }

    #[test]
    fn resolve_environment_roundtrip() {
        let frame = RunnerFrame::ResolveEnvironmentResponse {
            id: "req_2".into(),
            environment: Some(ResolvedEnvironment {
                name: "repo".into(),
                runner: Some("builder".into()),
                cwd: "/workspaces/s1".into(),
            }),
            error: None,
        };
        let before = serde_json::to_value(&frame).unwrap();
        assert_eq!(serde_json::to_value(roundtrip(&frame)).unwrap(), before);
    }
}
