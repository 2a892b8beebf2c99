//! Inbound runner connections: `GET /v2/runners/ws`.
//!
//! Flow:
//! 1. Runner connects and sends `hello{runner_name, version}`
//! 2. Server replies with its own `hello`
//! 3. Message loop: server pushes `tool_request` / `register_session` /
//!    `resolve_environment_request`; runner answers with response frames

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use wuhu_runner_protocol::RunnerFrame;

use crate::state::AppState;

pub async fn runner_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // 1. Wait for the runner's hello (10s grace).
    let hello = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = msg {
                if let Ok(RunnerFrame::Hello {
                    runner_name,
                    version,
                }) = serde_json::from_str(&text)
                {
                    return Some((runner_name, version));
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    let Some((runner_name, version)) = hello else {
        tracing::warn!("runner disconnected before sending hello");
        return;
    };

    // 2. Reply with the server's hello.
    let server_hello = RunnerFrame::Hello {
        runner_name: "wuhu-server".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    };
    let payload = match serde_json::to_string(&server_hello) {
        Ok(p) => p,
        Err(_) => return,
    };
    if sink.send(Message::Text(payload)).await.is_err() {
        return;
    }

    // 3. Register and run the message loop.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RunnerFrame>(64);
    state
        .runners
        .register(&runner_name, version, outbound_tx);

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
                    state.runners.touch(&runner_name);
                    state.runners.complete(frame);
                }
                Err(e) => {
                    tracing::debug!(runner = %runner_name, error = %e, "unparseable runner frame");
                }
            },
            Message::Ping(_) | Message::Pong(_) => state.runners.touch(&runner_name),
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    state.runners.remove(&runner_name);
}
