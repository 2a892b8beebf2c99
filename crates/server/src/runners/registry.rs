//! Registry of connected runner links and their in-flight RPCs.
//!
//! Each connected runner has an outbound frame channel; requests are keyed
//! by id in a pending map completed by the socket reader. A disconnect
//! fails every pending request for that runner.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use wuhu_domain::error::{Error, Result};
use wuhu_domain::session::ResolvedEnvironment;
use wuhu_domain::tool::ToolResult;
use wuhu_runner_protocol::RunnerFrame;

/// Runner RPC timeout.
const RPC_TIMEOUT: Duration = Duration::from_secs(600);

pub type RunnerSink = mpsc::Sender<RunnerFrame>;

struct ConnectedRunner {
    version: String,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    sink: RunnerSink,
}

/// Summary returned by `GET /v2/runners`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerInfo {
    pub name: String,
    pub version: String,
    pub connected: bool,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

struct PendingRpc {
    runner: String,
    tx: oneshot::Sender<RunnerFrame>,
}

#[derive(Default)]
pub struct RunnerRegistry {
    links: RwLock<HashMap<String, ConnectedRunner>>,
    pending: Mutex<HashMap<String, PendingRpc>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner link; replaces any existing link with the same
    /// name (reconnect).
    pub fn register(&self, name: &str, version: String, sink: RunnerSink) {
        let now = Utc::now();
        tracing::info!(runner = name, version = %version, "runner connected");
        self.links.write().insert(
            name.to_owned(),
            ConnectedRunner {
                version,
                connected_at: now,
                last_seen: now,
                sink,
            },
        );
    }

    /// Remove a runner link and fail its in-flight requests.
    pub fn remove(&self, name: &str) {
        if self.links.write().remove(name).is_some() {
            let failed = self.fail_pending_for(name);
            tracing::info!(runner = name, failed_in_flight = failed, "runner disconnected");
        }
    }

    pub fn touch(&self, name: &str) {
        if let Some(link) = self.links.write().get_mut(name) {
            link.last_seen = Utc::now();
        }
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.links.read().contains_key(name)
    }

    pub fn connected_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.links.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list(&self) -> Vec<RunnerInfo> {
        let mut infos: Vec<RunnerInfo> = self
            .links
            .read()
            .iter()
            .map(|(name, link)| RunnerInfo {
                name: name.clone(),
                version: link.version.clone(),
                connected: true,
                connected_at: link.connected_at,
                last_seen: link.last_seen,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn sink(&self, name: &str) -> Option<RunnerSink> {
        self.links.read().get(name).map(|l| l.sink.clone())
    }

    // ── RPC plumbing ───────────────────────────────────────────────

    async fn rpc(&self, runner: &str, id: String, frame: RunnerFrame) -> Result<RunnerFrame> {
        let sink = self
            .sink(runner)
            .ok_or_else(|| Error::Transport(format!("Runner '{runner}' is disconnected")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id.clone(),
            PendingRpc {
                runner: runner.to_owned(),
                tx,
            },
        );

        if sink.send(frame).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::Transport(format!(
                "Runner '{runner}' is disconnected"
            )));
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "Runner '{runner}' is disconnected"
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Transport(format!(
                    "tool request to runner '{runner}' timed out after {}s",
                    RPC_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Dispatch a tool call over the runner link. Link failures surface as
    /// error tool results, not executor faults.
    pub async fn tool_request(
        &self,
        runner: &str,
        session_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        args: serde_json::Value,
    ) -> ToolResult {
        if !self.is_connected(runner) {
            return ToolResult::error(format!("Runner '{runner}' is disconnected"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let frame = RunnerFrame::ToolRequest {
            id: id.clone(),
            session_id: session_id.to_owned(),
            tool_call_id: tool_call_id.to_owned(),
            tool_name: tool_name.to_owned(),
            args,
        };
        match self.rpc(runner, id, frame).await {
            Ok(RunnerFrame::ToolResponse {
                result,
                error_message,
                ..
            }) => match result {
                Some(result) => result,
                None => ToolResult::error(
                    error_message.unwrap_or_else(|| "runner returned no result".into()),
                ),
            },
            Ok(other) => ToolResult::error(format!(
                "runner '{runner}' sent an unexpected frame: {:?}",
                std::mem::discriminant(&other)
            )),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    /// Resolve a named environment on a runner.
    pub async fn resolve_environment(
        &self,
        runner: &str,
        session_id: &str,
        name: &str,
    ) -> Result<ResolvedEnvironment> {
        let id = uuid::Uuid::new_v4().to_string();
        let frame = RunnerFrame::ResolveEnvironmentRequest {
            id: id.clone(),
            session_id: session_id.to_owned(),
            name: name.to_owned(),
        };
        match self.rpc(runner, id, frame).await? {
            RunnerFrame::ResolveEnvironmentResponse {
                environment: Some(mut env),
                ..
            } => {
                env.runner = Some(runner.to_owned());
                Ok(env)
            }
            RunnerFrame::ResolveEnvironmentResponse {
                error: Some(error), ..
            } => Err(Error::Config(format!(
                "runner '{runner}' cannot resolve environment '{name}': {error}"
            ))),
            _ => Err(Error::Decoding(format!(
                "runner '{runner}' sent an invalid resolve_environment response"
            ))),
        }
    }

    /// Bind a session to its environment on the runner (fire-and-forget).
    pub async fn register_session(
        &self,
        runner: &str,
        session_id: &str,
        environment: ResolvedEnvironment,
    ) -> Result<()> {
        let sink = self
            .sink(runner)
            .ok_or_else(|| Error::Transport(format!("Runner '{runner}' is disconnected")))?;
        sink.send(RunnerFrame::RegisterSession {
            session_id: session_id.to_owned(),
            environment,
        })
        .await
        .map_err(|_| Error::Transport(format!("Runner '{runner}' is disconnected")))
    }

    /// Called by socket readers for every inbound response frame.
    pub fn complete(&self, frame: RunnerFrame) {
        let id = match &frame {
            RunnerFrame::ToolResponse { id, .. }
            | RunnerFrame::ResolveEnvironmentResponse { id, .. } => id.clone(),
            _ => return,
        };
        if let Some(pending) = self.pending.lock().remove(&id) {
            let _ = pending.tx.send(frame);
        } else {
            tracing::warn!(request_id = %id, "response for unknown runner request");
        }
    }

    fn fail_pending_for(&self, runner: &str) -> usize {
        let mut pending = self.pending.lock();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.runner == runner)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            // Dropping the sender wakes the waiter with a disconnect error.
            pending.remove(id);
        }
        ids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnected_runner_is_error_result_not_fault() {
        let registry = RunnerRegistry::new();
        let result = registry
            .tool_request("ghost", "s1", "t1", "bash", serde_json::json!({}))
            .await;
        assert!(result.is_error);
        assert_eq!(result.joined_text(), "Runner 'ghost' is disconnected");
    }

    #[tokio::test]
    async fn tool_request_completes_via_response_frame() {
        let registry = std::sync::Arc::new(RunnerRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("builder", "0.1.0".into(), tx);

        // Fake runner: answer the request when it arrives.
        let registry2 = registry.clone();
        tokio::spawn(async move {
            if let Some(RunnerFrame::ToolRequest {
                id,
                session_id,
                tool_call_id,
                ..
            }) = rx.recv().await
            {
                registry2.complete(RunnerFrame::ToolResponse {
                    id,
                    session_id,
                    tool_call_id,
                    result: Some(ToolResult::text("ran on runner")),
                    is_error: false,
                    error_message: None,
                });
            }
        });

        let result = registry
            .tool_request("builder", "s1", "t1", "bash", serde_json::json!({"command": "ls"}))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.joined_text(), "ran on runner");
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn remove_fails_in_flight_requests() {
        let registry = std::sync::Arc::new(RunnerRegistry::new());
        let (tx, _rx) = mpsc::channel(8);
        registry.register("builder", "0.1.0".into(), tx);

        let registry2 = registry.clone();
        let call = tokio::spawn(async move {
            registry2
                .tool_request("builder", "s1", "t1", "bash", serde_json::json!({}))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.remove("builder");

        let result = call.await.unwrap();
        assert!(result.is_error);
        assert!(result.joined_text().contains("disconnected"));
    }

    #[tokio::test]
    async fn resolve_environment_tags_the_runner() {
        let registry = std::sync::Arc::new(RunnerRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("builder", "0.1.0".into(), tx);

        let registry2 = registry.clone();
        tokio::spawn(async move {
            if let Some(RunnerFrame::ResolveEnvironmentRequest { id, .. }) = rx.recv().await {
                registry2.complete(RunnerFrame::ResolveEnvironmentResponse {
                    id,
                    environment: Some(ResolvedEnvironment {
                        name: "repo".into(),
                        runner: None,
                        cwd: "/workspaces/s1".into(),
                    }),
                    error: None,
                });
            }
        });

        let env = registry
            .resolve_environment("builder", "s1", "repo")
            .await
            .unwrap();
        assert_eq!(env.runner.as_deref(), Some("builder"));
        assert_eq!(env.cwd, "/workspaces/s1");
    }
}
