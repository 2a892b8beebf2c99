//! Outbound runner connections: the server dials `runners[{name, address}]`
//! from the config and keeps each link alive with a reconnect loop.
//!
//! The frame grammar is identical to the inbound path; the only difference
//! is that the server sends the first `hello`.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use wuhu_domain::config::RunnerConfig;
use wuhu_runner_protocol::RunnerFrame;

use super::registry::RunnerRegistry;

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(15);

/// Spawn one reconnecting dial loop per configured runner.
pub fn spawn_dialers(registry: Arc<RunnerRegistry>, runners: &[RunnerConfig]) {
    for runner in runners {
        let registry = registry.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            loop {
                match connect_once(&registry, &runner).await {
                    Ok(()) => {
                        tracing::info!(runner = %runner.name, "runner link closed; reconnecting");
                    }
                    Err(e) => {
                        tracing::warn!(runner = %runner.name, error = %e, "runner dial failed");
                    }
                }
                registry.remove(&runner.name);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
    }
}

async fn connect_once(
    registry: &Arc<RunnerRegistry>,
    runner: &RunnerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (socket, _) = connect_async(runner.address.as_str()).await?;
    let (mut sink, mut stream) = socket.split();

    // Server dials → server speaks first.
    let hello = RunnerFrame::Hello {
        runner_name: "wuhu-server".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    };
    sink.send(Message::Text(serde_json::to_string(&hello)?)).await?;

    // Expect the runner's hello back.
    let version = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                if let Ok(RunnerFrame::Hello { version, .. }) = serde_json::from_str(&text) {
                    return Some(version);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
    .ok_or("runner did not answer hello")?;

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RunnerFrame>(64);
    registry.register(&runner.name, version, outbound_tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<RunnerFrame>(&text) {
                Ok(frame) => {
                    registry.touch(&runner.name);
                    registry.complete(frame);
                }
                Err(e) => {
                    tracing::debug!(runner = %runner.name, error = %e, "unparseable runner frame");
                }
            },
            Message::Ping(_) | Message::Pong(_) => registry.touch(&runner.name),
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    Ok(())
}
