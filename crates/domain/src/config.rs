//! Server configuration, loaded once from YAML at startup.
//!
//! Recognized keys: `host`, `port`, `databasePath`, `workspaces_path`,
//! `llm.openai` / `llm.anthropic`, `llm_request_log_dir`,
//! `environments[]`, `runners[]`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top level
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(rename = "databasePath", default = "default_database_path")]
    pub database_path: PathBuf,

    /// Root for folder-template environment copies
    /// (`workspaces_path/<session>`).
    #[serde(default)]
    pub workspaces_path: Option<PathBuf>,

    #[serde(default)]
    pub llm: LlmConfig,

    /// When set, every LLM request/response pair is logged to a JSON file
    /// in this directory.
    #[serde(default)]
    pub llm_request_log_dir: Option<PathBuf>,

    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,

    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: default_database_path(),
            workspaces_path: None,
            llm: LlmConfig::default(),
            llm_request_log_dir: None,
            environments: Vec::new(),
            runners: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    5530
}

fn default_database_path() -> PathBuf {
    PathBuf::from("wuhu.db")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM credentials
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default)]
    pub openai: Option<LlmProviderConfig>,
    #[serde(default)]
    pub anthropic: Option<LlmProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmProviderConfig {
    pub api_key: String,
    /// Override the provider endpoint (proxies, test servers).
    #[serde(default)]
    pub base_url: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environments & runners
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentType {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "folder-template")]
    FolderTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
    /// Fixed working directory (`local`).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Template directory to copy per session (`folder-template`).
    #[serde(default)]
    pub template_path: Option<PathBuf>,
    /// Script run in the fresh copy after a folder-template resolve.
    #[serde(default)]
    pub startup_script: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    pub name: String,
    /// WebSocket address the server dials (e.g. `ws://10.0.0.5:7001/ws`).
    pub address: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading & validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl ServerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    /// Schema-level validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        for env in &self.environments {
            match env.env_type {
                EnvironmentType::Local => {
                    if env.path.is_none() {
                        return Err(Error::Config(format!(
                            "environment '{}': local environments require 'path'",
                            env.name
                        )));
                    }
                }
                EnvironmentType::FolderTemplate => {
                    if env.template_path.is_none() {
                        return Err(Error::Config(format!(
                            "environment '{}': folder-template environments require \
                             'template_path'",
                            env.name
                        )));
                    }
                    if self.workspaces_path.is_none() {
                        return Err(Error::Config(format!(
                            "environment '{}': folder-template environments require a \
                             top-level 'workspaces_path'",
                            env.name
                        )));
                    }
                }
            }
        }

        let mut names: Vec<&str> = self.environments.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.environments.len() {
            return Err(Error::Config("duplicate environment names".into()));
        }

        for runner in &self.runners {
            if !runner.address.starts_with("ws://") && !runner.address.starts_with("wss://") {
                return Err(Error::Config(format!(
                    "runner '{}': address must be a ws:// or wss:// URL",
                    runner.name
                )));
            }
        }

        Ok(())
    }
}
