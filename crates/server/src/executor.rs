//! Tool executor: route a tool call to the local host or a runner link.
//!
//! Local sessions execute built-ins in the server process. Runner-bound
//! sessions serialize the call over the runner link and await the
//! response; a disconnected runner yields an error tool result, not an
//! executor fault.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use wuhu_domain::session::ResolvedEnvironment;
use wuhu_domain::tool::ToolResult;
use wuhu_tools::{AsyncTaskCallback, LocalToolHost};

use crate::runners::RunnerRegistry;

#[derive(Clone)]
pub struct ToolExecutor {
    environment: ResolvedEnvironment,
    local: LocalToolHost,
    runners: Arc<RunnerRegistry>,
}

impl ToolExecutor {
    pub fn new(
        environment: ResolvedEnvironment,
        runners: Arc<RunnerRegistry>,
        async_callback: AsyncTaskCallback,
    ) -> Self {
        let local = LocalToolHost::new(environment.cwd.clone().into(), async_callback);
        Self {
            environment,
            local,
            runners,
        }
    }

    pub async fn execute(
        &self,
        session_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        match &self.environment.runner {
            None => self.local.execute(tool_name, args, cancel).await,
            // The runner protocol has no cancel frame; an in-flight remote
            // call runs to completion and its result is appended normally.
            Some(runner) => {
                self.runners
                    .tool_request(runner, session_id, tool_call_id, tool_name, args)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_env(cwd: &std::path::Path) -> ResolvedEnvironment {
        ResolvedEnvironment {
            name: "local".into(),
            runner: None,
            cwd: cwd.to_string_lossy().into_owned(),
        }
    }

    #[tokio::test]
    async fn local_sessions_run_in_process() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("x.txt"), "content\n").unwrap();
        let executor = ToolExecutor::new(
            local_env(ws.path()),
            Arc::new(RunnerRegistry::new()),
            Arc::new(|_| {}),
        );
        let result = executor
            .execute(
                "s1",
                "t1",
                "read",
                serde_json::json!({"path": "x.txt"}),
                CancellationToken::new(),
            )
            .await;
        assert!(!result.is_error);
        assert!(result.joined_text().contains("content"));
    }

    #[tokio::test]
    async fn runner_sessions_report_disconnects_as_tool_errors() {
        let ws = tempfile::tempdir().unwrap();
        let env = ResolvedEnvironment {
            name: "repo".into(),
            runner: Some("builder".into()),
            cwd: ws.path().to_string_lossy().into_owned(),
        };
        let executor = ToolExecutor::new(
            env,
            Arc::new(RunnerRegistry::new()),
            Arc::new(|_| {}),
        );
        let result = executor
            .execute(
                "s1",
                "t1",
                "bash",
                serde_json::json!({"command": "ls"}),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_error);
        assert_eq!(result.joined_text(), "Runner 'builder' is disconnected");
    }
}
