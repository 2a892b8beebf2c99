//! Shared application state passed to all API handlers.

use std::sync::Arc;

use wuhu_domain::config::ServerConfig;
use wuhu_providers::{ProviderRegistry, RequestLogger};
use wuhu_store::{Database, QueueStore, TranscriptStore};

use crate::hub::SubscriptionHub;
use crate::runners::RunnerRegistry;
use crate::session::{SessionDeps, SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub transcripts: TranscriptStore,
    pub queues: QueueStore,
    pub providers: Arc<ProviderRegistry>,
    pub runners: Arc<RunnerRegistry>,
    pub hub: Arc<SubscriptionHub>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    /// Wire the full state from a loaded config and an open database.
    pub fn build(config: Arc<ServerConfig>, db: Database) -> wuhu_domain::Result<Self> {
        let transcripts = TranscriptStore::new(db);
        let queues = QueueStore::sharing(&transcripts);
        let logger = RequestLogger::new(config.llm_request_log_dir.clone());
        let providers = Arc::new(ProviderRegistry::from_config(&config.llm, logger)?);
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

        Ok(Self {
            config,
            transcripts,
            queues,
            providers,
            runners,
            hub,
            sessions,
        })
    }
}
