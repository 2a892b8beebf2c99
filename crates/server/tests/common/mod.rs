//! Shared test harness: a scripted mock provider and state construction
//! over an in-memory database.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use wuhu_domain::config::ServerConfig;
use wuhu_domain::entry::{ContentItem, EntryPayload, StopReason, Usage};
use wuhu_domain::error::Result;
use wuhu_domain::session::{
    ModelSelection, ProviderKind, ResolvedEnvironment, SessionStatus,
};
use wuhu_domain::stream::{AssistantDraft, AssistantEvent, BoxStream};
use wuhu_providers::{ModelRequest, Provider, ProviderRegistry};
use wuhu_server::hub::SubscriptionHub;
use wuhu_server::runners::RunnerRegistry;
use wuhu_server::session::{SessionDeps, SessionManager};
use wuhu_server::state::AppState;
use wuhu_store::{Database, NewSession, QueueStore, TranscriptStore};

pub const MODEL: &str = "gpt-4.1-mini";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MockProvider {
    scripts: Mutex<VecDeque<Vec<AssistantEvent>>>,
    /// Pause between streamed events; gives tests an in-flight window.
    pub delay: Duration,
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl MockProvider {
    pub fn new(scripts: Vec<Vec<AssistantEvent>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn with_delay(scripts: Vec<Vec<AssistantEvent>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    async fn stream(
        &self,
        req: &ModelRequest,
    ) -> Result<BoxStream<'static, Result<AssistantEvent>>> {
        self.requests.lock().push(req.clone());
        let events = self.scripts.lock().pop_front().ok_or_else(|| {
            wuhu_domain::Error::Provider {
                provider: "mock".into(),
                status: 400,
                message: "mock script exhausted".into(),
            }
        })?;
        let delay = self.delay;
        Ok(Box::pin(async_stream::stream! {
            for event in events {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(event);
            }
        }))
    }

    fn provider_id(&self) -> &str {
        "mock"
    }
}

// ── Script builders ────────────────────────────────────────────────

pub fn text_response(text: &str) -> Vec<AssistantEvent> {
    vec![
        AssistantEvent::Start,
        AssistantEvent::TextDelta { delta: text.into() },
        AssistantEvent::Done {
            message: AssistantDraft {
                content: vec![ContentItem::text(text)],
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                    cache_read_tokens: None,
                }),
                stop_reason: StopReason::Stop,
            },
        },
    ]
}

pub fn tool_response(calls: Vec<ContentItem>) -> Vec<AssistantEvent> {
    vec![
        AssistantEvent::Start,
        AssistantEvent::Done {
            message: AssistantDraft {
                content: calls,
                usage: None,
                stop_reason: StopReason::ToolUse,
            },
        },
    ]
}

pub fn call(id: &str, name: &str, args: serde_json::Value) -> ContentItem {
    ContentItem::ToolCall {
        id: id.into(),
        name: name.into(),
        arguments: args,
        item_id: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn test_state(provider: Arc<MockProvider>) -> AppState {
    let config = Arc::new(ServerConfig::default());
    let db = Database::open_in_memory().await.unwrap();
    let transcripts = TranscriptStore::new(db);
    let queues = QueueStore::sharing(&transcripts);

    let mut providers: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();
    providers.insert(ProviderKind::Openai, provider);
    let providers = Arc::new(ProviderRegistry::with_providers(providers));

    let runners = Arc::new(RunnerRegistry::new());
    let hub = Arc::new(SubscriptionHub::new());
    let deps = SessionDeps {
        config: config.clone(),
        transcripts: transcripts.clone(),
        queues: queues.clone(),
        providers: providers.clone(),
        runners: runners.clone(),
        hub: hub.clone(),
    };
    let sessions = Arc::new(SessionManager::new(deps));

    AppState {
        config,
        transcripts,
        queues,
        providers,
        runners,
        hub,
        sessions,
    }
}

/// Create a session (with header) whose tools run in `cwd`.
pub async fn create_session(state: &AppState, id: &str, cwd: &std::path::Path) {
    state
        .transcripts
        .create_session(NewSession {
            id: id.into(),
            selection: ModelSelection {
                provider: ProviderKind::Openai,
                model: MODEL.into(),
                reasoning_effort: None,
            },
            environment: ResolvedEnvironment {
                name: "local".into(),
                runner: None,
                cwd: cwd.to_string_lossy().into_owned(),
            },
            cwd: cwd.to_string_lossy().into_owned(),
            parent_session_id: None,
        })
        .await
        .unwrap();
    state
        .transcripts
        .append(
            id,
            EntryPayload::Header {
                system_prompt: "You are a coding agent.".into(),
            },
            None,
        )
        .await
        .unwrap();
}

/// Poll until the derived status is terminal (idle or stopped).
pub async fn wait_settled(state: &AppState, id: &str) -> SessionStatus {
    for _ in 0..400 {
        let entries = state.transcripts.read_all(id).await.unwrap();
        let status = wuhu_server::session::status::infer(&entries);
        if !matches!(status, SessionStatus::Executing { .. }) {
            // Give the actor a beat to finish emitting.
            tokio::time::sleep(Duration::from_millis(25)).await;
            let entries = state.transcripts.read_all(id).await.unwrap();
            let again = wuhu_server::session::status::infer(&entries);
            if again == status {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("session '{id}' did not settle");
}

pub async fn entries(state: &AppState, id: &str) -> Vec<wuhu_domain::entry::SessionEntry> {
    state.transcripts.read_all(id).await.unwrap()
}
