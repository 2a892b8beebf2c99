//! Optional LLM request logging: one JSON file per request.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

/// Writes each outgoing request body to `dir/<timestamp>-<id>.json`.
/// No-op when constructed without a directory.
#[derive(Clone, Default)]
pub struct RequestLogger {
    dir: Option<Arc<PathBuf>>,
}

impl RequestLogger {
    pub fn new(dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot create llm request log dir");
                return Self { dir: None };
            }
        }
        Self {
            dir: dir.map(Arc::new),
        }
    }

    pub fn log(&self, provider: &str, model: &str, body: &Value) {
        let Some(dir) = &self.dir else { return };
        let name = format!(
            "{}-{}.json",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"),
            uuid::Uuid::new_v4().as_simple()
        );
        let record = serde_json::json!({
            "provider": provider,
            "model": model,
            "body": body,
        });
        let path = dir.join(name);
        if let Err(e) = std::fs::write(&path, record.to_string()) {
            tracing::warn!(path = %path.display(), error = %e, "llm request log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_one_file_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RequestLogger::new(Some(dir.path().to_path_buf()));
        logger.log("openai", "gpt-4.1-mini", &serde_json::json!({"input": []}));
        logger.log("anthropic", "claude", &serde_json::json!({"messages": []}));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let logger = RequestLogger::new(None);
        logger.log("openai", "m", &serde_json::json!({}));
    }
}
