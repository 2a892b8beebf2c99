//! A wuhu tool runner.
//!
//! Connects to the server's `/v2/runners/ws` endpoint, announces itself
//! with `hello`, resolves named environments from its own config, and
//! executes tool requests against the registered session workspaces.
//! Reconnects with a fixed delay when the link drops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

use wuhu_domain::session::ResolvedEnvironment;
use wuhu_runner_protocol::RunnerFrame;
use wuhu_tools::LocalToolHost;

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "wuhu-runner", about = "Remote tool runner for wuhu")]
struct Cli {
    /// Path to the YAML runner config.
    #[arg(long, default_value = "runner.yaml")]
    config: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunnerConfig {
    name: String,
    /// Server WebSocket endpoint, e.g. `ws://127.0.0.1:5530/v2/runners/ws`.
    server: String,
    /// Root for per-session workspace copies.
    workspaces_path: PathBuf,
    #[serde(default)]
    environments: Vec<EnvironmentConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvironmentConfig {
    name: String,
    template_path: PathBuf,
    #[serde(default)]
    startup_script: Option<String>,
}

/// Sessions registered by the server, mapped to their workspaces.
#[derive(Default)]
struct SessionTable {
    sessions: RwLock<HashMap<String, ResolvedEnvironment>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,wuhu_runner=debug")),
        )
        .init();

    let cli = Cli::parse();
    let raw = std::fs::read_to_string(&cli.config)?;
    let config: Arc<RunnerConfig> = Arc::new(serde_yaml::from_str(&raw)?);
    let sessions = Arc::new(SessionTable::default());

    tracing::info!(runner = %config.name, server = %config.server, "wuhu-runner starting");

    loop {
        match run_link(&config, &sessions).await {
            Ok(()) => tracing::info!("server link closed; reconnecting"),
            Err(e) => tracing::warn!(error = %e, "server link failed"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn run_link(
    config: &Arc<RunnerConfig>,
    sessions: &Arc<SessionTable>,
) -> anyhow::Result<()> {
    let (socket, _) = connect_async(config.server.as_str()).await?;
    let (mut sink, mut stream) = socket.split();

    // The runner connects, so the runner speaks first.
    let hello = RunnerFrame::Hello {
        runner_name: config.name.clone(),
        version: env!("CARGO_PKG_VERSION").into(),
    };
    sink.send(Message::Text(serde_json::to_string(&hello)?)).await?;

    // Outbound responses funnel through one writer task so concurrent
    // tool executions cannot interleave frames.
    let (out_tx, mut out_rx) = mpsc::channel::<RunnerFrame>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let msg = msg?;
        let Message::Text(text) = msg else {
            continue;
        };
        let frame: RunnerFrame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable server frame");
                continue;
            }
        };
        handle_frame(config, sessions, &out_tx, frame);
    }

    writer.abort();
    Ok(())
}

fn handle_frame(
    config: &Arc<RunnerConfig>,
    sessions: &Arc<SessionTable>,
    out_tx: &mpsc::Sender<RunnerFrame>,
    frame: RunnerFrame,
) {
    match frame {
        RunnerFrame::Hello { runner_name, .. } => {
            tracing::info!(server = %runner_name, "connected");
        }

        RunnerFrame::ResolveEnvironmentRequest {
            id,
            session_id,
            name,
        } => {
            let config = config.clone();
            let sessions = sessions.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let response = match resolve_environment(&config, &session_id, &name).await {
                    Ok(env) => {
                        sessions
                            .sessions
                            .write()
                            .insert(session_id.clone(), env.clone());
                        RunnerFrame::ResolveEnvironmentResponse {
                            id,
                            environment: Some(env),
                            error: None,
                        }
                    }
                    Err(e) => RunnerFrame::ResolveEnvironmentResponse {
                        id,
                        environment: None,
                        error: Some(e.to_string()),
                    },
                };
                let _ = out_tx.send(response).await;
            });
        }

        RunnerFrame::RegisterSession {
            session_id,
            environment,
        } => {
            tracing::info!(session_id = %session_id, cwd = %environment.cwd, "session registered");
            sessions.sessions.write().insert(session_id, environment);
        }

        RunnerFrame::ToolRequest {
            id,
            session_id,
            tool_call_id,
            tool_name,
            args,
        } => {
            let cwd = sessions
                .sessions
                .read()
                .get(&session_id)
                .map(|env| PathBuf::from(&env.cwd));
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let response = match cwd {
                    Some(cwd) => {
                        let host = LocalToolHost::without_callback(cwd);
                        let result = host
                            .execute(
                                &tool_name,
                                args,
                                tokio_util::sync::CancellationToken::new(),
                            )
                            .await;
                        RunnerFrame::ToolResponse {
                            id,
                            session_id,
                            tool_call_id,
                            is_error: result.is_error,
                            result: Some(result),
                            error_message: None,
                        }
                    }
                    None => RunnerFrame::ToolResponse {
                        id,
                        session_id: session_id.clone(),
                        tool_call_id,
                        result: None,
                        is_error: true,
                        error_message: Some(format!(
                            "session '{session_id}' is not registered on this runner"
                        )),
                    },
                };
                let _ = out_tx.send(response).await;
            });
        }

        RunnerFrame::ResolveEnvironmentResponse { .. } | RunnerFrame::ToolResponse { .. } => {
            tracing::debug!("ignoring response frame from server");
        }
    }
}

/// Copy the named template into `workspaces_path/<session>` and run its
/// startup script.
async fn resolve_environment(
    config: &RunnerConfig,
    session_id: &str,
    name: &str,
) -> anyhow::Result<ResolvedEnvironment> {
    let env = config
        .environments
        .iter()
        .find(|e| e.name == name)
        .ok_or_else(|| anyhow::anyhow!("unknown environment '{name}'"))?;

    let target = config.workspaces_path.join(session_id);
    if target.exists() {
        anyhow::bail!("workspace '{}' already exists", target.display());
    }
    for entry in walkdir::WalkDir::new(&env.template_path) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(&env.template_path)
            .expect("walkdir yields paths under its root");
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        }
    }

    if let Some(script) = &env.startup_script {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(&target)
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "startup script exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }

    Ok(ResolvedEnvironment {
        name: name.to_owned(),
        runner: None,
        cwd: target.to_string_lossy().into_owned(),
    })
}
