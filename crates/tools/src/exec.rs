//! Process execution tools: `bash` (synchronous) and `async_bash`
//! (detached with queued completion).
//!
//! Synchronous runs are bounded by a caller-supplied timeout (default
//! 120 s, hard cap 1800 s) and receive SIGTERM on cancellation, escalating
//! to SIGKILL after a grace period. Detached runs return a task id
//! immediately; the supervisor delivers the completion through a callback
//! that the engine enqueues as a system-urgent message.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use wuhu_domain::entry::EXECUTION_STOPPED_MESSAGE;
use wuhu_domain::tool::ToolResult;

pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const MAX_TIMEOUT_MS: u64 = 1_800_000;
/// Combined output beyond this is truncated from the front (tail kept).
const MAX_OUTPUT_CHARS: usize = 100_000;
const TERM_GRACE: Duration = Duration::from_secs(2);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// bash
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct BashRequest {
    pub command: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

pub async fn bash(cwd: &Path, req: BashRequest, cancel: CancellationToken) -> ToolResult {
    let timeout_ms = req
        .timeout_ms
        .unwrap_or(DEFAULT_TIMEOUT_MS)
        .min(MAX_TIMEOUT_MS);

    let mut child = match spawn_shell(cwd, &req.command) {
        Ok(c) => c,
        Err(e) => return ToolResult::error(format!("failed to spawn: {e}")),
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let started = Instant::now();
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Outcome::Exited(status.code()),
            Err(e) => Outcome::Fault(e.to_string()),
        },
        _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
            terminate(&mut child).await;
            Outcome::TimedOut
        }
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            Outcome::Cancelled
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let output = combine_output(&stdout, &stderr);

    let details = |exit: Option<i32>| {
        serde_json::json!({
            "exit_code": exit,
            "duration_ms": duration_ms,
        })
    };

    match outcome {
        Outcome::Exited(code) => {
            let exit = code.unwrap_or(-1);
            let mut result = if exit == 0 {
                ToolResult::text(output)
            } else {
                ToolResult::error(format!("exit code {exit}\n{output}"))
            };
            result.details = details(code);
            result
        }
        Outcome::TimedOut => ToolResult::error(format!(
            "command timed out after {timeout_ms} ms\n{output}"
        ))
        .with_details(details(None)),
        Outcome::Cancelled => {
            ToolResult::error(EXECUTION_STOPPED_MESSAGE).with_details(details(None))
        }
        Outcome::Fault(e) => ToolResult::error(format!("wait failed: {e}")),
    }
}

enum Outcome {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
    Fault(String),
}

fn spawn_shell(cwd: &Path, command: &str) -> std::io::Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.spawn()
}

/// SIGTERM, then SIGKILL after the grace period.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .await;
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    if combined.len() > MAX_OUTPUT_CHARS {
        let keep_from = combined.len() - MAX_OUTPUT_CHARS;
        let keep_from = combined
            .char_indices()
            .map(|(i, _)| i)
            .find(|i| *i >= keep_from)
            .unwrap_or(0);
        combined = format!("[output truncated]\n{}", &combined[keep_from..]);
    }
    combined
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// async_bash
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct AsyncBashRequest {
    pub command: String,
}

/// Completion payload delivered when a detached command finishes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AsyncTaskOutcome {
    pub task_id: String,
    pub command: String,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Invoked from the supervisor task when a detached command completes.
pub type AsyncTaskCallback = Arc<dyn Fn(AsyncTaskOutcome) + Send + Sync>;

/// Launch a detached command and return its task id immediately. The
/// completion is delivered through `callback` (the engine enqueues it on
/// the session's system-urgent lane).
pub fn async_bash(cwd: &Path, req: AsyncBashRequest, callback: AsyncTaskCallback) -> ToolResult {
    let task_id = format!("task_{}", uuid::Uuid::new_v4().as_simple());

    let mut child = match spawn_shell(cwd, &req.command) {
        Ok(c) => c,
        Err(e) => return ToolResult::error(format!("failed to spawn: {e}")),
    };

    let monitor_task_id = task_id.clone();
    let command = req.command.clone();
    tokio::spawn(async move {
        let started = Instant::now();

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let exit_code = tokio::select! {
            status = child.wait() => status.ok().and_then(|s| s.code()),
            _ = tokio::time::sleep(Duration::from_millis(MAX_TIMEOUT_MS)) => {
                terminate(&mut child).await;
                None
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let outcome = AsyncTaskOutcome {
            task_id: monitor_task_id.clone(),
            command,
            duration_ms: started.elapsed().as_millis() as u64,
            exit_code,
            output: combine_output(&stdout, &stderr),
        };
        tracing::debug!(
            task_id = %monitor_task_id,
            exit_code = ?exit_code,
            "async_bash completed"
        );
        callback(outcome);
    });

    ToolResult::text(format!(
        "Started background task {task_id}; completion will be delivered as a notification"
    ))
    .with_details(serde_json::json!({ "task_id": task_id }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
