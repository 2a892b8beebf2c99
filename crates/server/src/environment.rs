//! Environment resolution at session creation.
//!
//! A `local` environment pins the session to a fixed directory. A
//! `folder-template` environment copies the template into
//! `workspaces_path/<session>` and optionally runs a startup script in the
//! fresh copy. Names not present in the config are offered to connected
//! runners, which binds the session to the first runner that resolves
//! them.

use std::path::Path;
use std::sync::Arc;

use wuhu_domain::config::{EnvironmentType, ServerConfig};
use wuhu_domain::error::{Error, Result};
use wuhu_domain::session::ResolvedEnvironment;

use crate::runners::RunnerRegistry;

/// Summary returned by `GET /v2/environments`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
}

pub fn list(config: &ServerConfig) -> Vec<EnvironmentInfo> {
    config
        .environments
        .iter()
        .map(|e| EnvironmentInfo {
            name: e.name.clone(),
            env_type: e.env_type,
        })
        .collect()
}

/// Resolve an environment reference for a new session. `None` falls back
/// to the server's working directory.
pub async fn resolve(
    config: &ServerConfig,
    runners: &Arc<RunnerRegistry>,
    session_id: &str,
    name: Option<&str>,
) -> Result<ResolvedEnvironment> {
    let Some(name) = name else {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("cannot resolve server cwd: {e}")))?;
        return Ok(ResolvedEnvironment {
            name: "local".into(),
            runner: None,
            cwd: cwd.to_string_lossy().into_owned(),
        });
    };

    if let Some(env) = config.environments.iter().find(|e| e.name == name) {
        return match env.env_type {
            EnvironmentType::Local => {
                let path = env
                    .path
                    .as_ref()
                    .ok_or_else(|| Error::Config(format!("environment '{name}' has no path")))?;
                Ok(ResolvedEnvironment {
                    name: name.to_owned(),
                    runner: None,
                    cwd: path.to_string_lossy().into_owned(),
                })
            }
            EnvironmentType::FolderTemplate => {
                let template = env.template_path.as_ref().ok_or_else(|| {
                    Error::Config(format!("environment '{name}' has no template_path"))
                })?;
                let workspaces = config.workspaces_path.as_ref().ok_or_else(|| {
                    Error::Config("folder-template environments require workspaces_path".into())
                })?;
                let target = workspaces.join(session_id);
                copy_tree(template, &target)?;
                if let Some(script) = &env.startup_script {
                    run_startup_script(&target, script).await?;
                }
                Ok(ResolvedEnvironment {
                    name: name.to_owned(),
                    runner: None,
                    cwd: target.to_string_lossy().into_owned(),
                })
            }
        };
    }

    // Not configured locally: offer it to connected runners, first
    // responder wins (deterministic: sorted by name).
    for runner in runners.connected_names() {
        match runners.resolve_environment(&runner, session_id, name).await {
            Ok(env) => {
                runners
                    .register_session(&runner, session_id, env.clone())
                    .await?;
                return Ok(env);
            }
            Err(e) => {
                tracing::debug!(
                    runner = %runner,
                    environment = name,
                    error = %e,
                    "runner did not resolve environment"
                );
            }
        }
    }

    Err(Error::Config(format!("unknown environment '{name}'")))
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        return Err(Error::Config(format!(
            "workspace '{}' already exists",
            to.display()
        )));
    }
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::Config(format!("template walk failed: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .expect("walkdir yields paths under its root");
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn run_startup_script(cwd: &Path, script: &str) -> Result<()> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| Error::Config(format!("startup script failed to spawn: {e}")))?;
    if !output.status.success() {
        return Err(Error::Config(format!(
            "startup script exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wuhu_domain::config::EnvironmentConfig;

    fn config_with(env: EnvironmentConfig, workspaces: Option<&Path>) -> ServerConfig {
        ServerConfig {
            workspaces_path: workspaces.map(|p| p.to_path_buf()),
            environments: vec![env],
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn local_environment_uses_configured_path() {
        let config = config_with(
            EnvironmentConfig {
                name: "scratch".into(),
                env_type: EnvironmentType::Local,
                path: Some("/srv/scratch".into()),
                template_path: None,
                startup_script: None,
            },
            None,
        );
        let env = resolve(
            &config,
            &Arc::new(RunnerRegistry::new()),
            "s1",
            Some("scratch"),
        )
        .await
        .unwrap();
        assert!(env.is_local());
        assert_eq!(env.cwd, "/srv/scratch");
    }

    #[tokio::test]
    async fn folder_template_copies_and_runs_startup() {
        let template = tempfile::tempdir().unwrap();
        std::fs::create_dir(template.path().join("src")).unwrap();
        std::fs::write(template.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        let workspaces = tempfile::tempdir().unwrap();

        let config = config_with(
            EnvironmentConfig {
                name: "repo".into(),
                env_type: EnvironmentType::FolderTemplate,
                path: None,
                template_path: Some(template.path().to_path_buf()),
                startup_script: Some("touch setup-ran".into()),
            },
            Some(workspaces.path()),
        );

        let env = resolve(
            &config,
            &Arc::new(RunnerRegistry::new()),
            "sess-1",
            Some("repo"),
        )
        .await
        .unwrap();

        let copy = workspaces.path().join("sess-1");
        assert_eq!(env.cwd, copy.to_string_lossy());
        assert!(copy.join("src/main.rs").exists());
        assert!(copy.join("setup-ran").exists());
    }

    #[tokio::test]
    async fn unknown_environment_is_config_error() {
        let config = ServerConfig::default();
        let err = resolve(
            &config,
            &Arc::new(RunnerRegistry::new()),
            "s1",
            Some("nope"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn no_environment_defaults_to_server_cwd() {
        let config = ServerConfig::default();
        let env = resolve(&config, &Arc::new(RunnerRegistry::new()), "s1", None)
            .await
            .unwrap();
        assert_eq!(env.name, "local");
        assert!(env.is_local());
    }
}
