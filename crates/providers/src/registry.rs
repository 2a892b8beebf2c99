//! Provider registry: one adapter instance per configured back-end.

use std::collections::HashMap;
use std::sync::Arc;

use wuhu_domain::config::LlmConfig;
use wuhu_domain::error::{Error, Result};
use wuhu_domain::session::ProviderKind;

use crate::anthropic::AnthropicProvider;
use crate::codex::CodexProvider;
use crate::openai::OpenAiProvider;
use crate::request_log::RequestLogger;
use crate::traits::Provider;

pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Build adapters for every configured credential. The OpenAI key
    /// serves both the Responses and Codex variants; Codex is only
    /// registered when the key is a ChatGPT OAuth JWT.
    pub fn from_config(config: &LlmConfig, logger: RequestLogger) -> Result<Self> {
        let mut providers: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();

        if let Some(openai) = &config.openai {
            providers.insert(
                ProviderKind::Openai,
                Arc::new(OpenAiProvider::new(
                    openai.api_key.clone(),
                    openai.base_url.clone(),
                    logger.clone(),
                )?),
            );
            match CodexProvider::new(
                openai.api_key.clone(),
                openai.base_url.clone(),
                logger.clone(),
            ) {
                Ok(codex) => {
                    providers.insert(ProviderKind::OpenaiCodex, Arc::new(codex));
                }
                Err(e) => {
                    tracing::debug!(error = %e, "openai key is not a ChatGPT token; codex disabled");
                }
            }
        }

        if let Some(anthropic) = &config.anthropic {
            providers.insert(
                ProviderKind::Anthropic,
                Arc::new(AnthropicProvider::new(
                    anthropic.api_key.clone(),
                    anthropic.base_url.clone(),
                    logger,
                )?),
            );
        }

        Ok(Self { providers })
    }

    /// Registry with explicit instances (tests, mock providers).
    pub fn with_providers(providers: HashMap<ProviderKind, Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>> {
        self.providers.get(&kind).cloned().ok_or_else(|| {
            Error::Config(format!(
                "no credentials configured for provider '{}'",
                kind.as_str()
            ))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn available(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}
