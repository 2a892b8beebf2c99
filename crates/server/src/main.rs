use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wuhu_server::cli::{load_config, Cli, Command, ConfigCommand};
use wuhu_server::runners::dial;
use wuhu_server::state::AppState;
use wuhu_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            match load_config(&cli.config) {
                Ok(_) => {
                    println!("config ok");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("config invalid: {e}");
                    std::process::exit(1);
                }
            }
        }
        Some(Command::Version) => {
            println!("wuhu {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,wuhu_server=debug")),
        )
        .init();
}

async fn run_server(config: Arc<wuhu_domain::config::ServerConfig>) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.host,
        port = config.port,
        db = %config.database_path.display(),
        "wuhu starting"
    );

    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = Database::open(config.database_path.clone()).await?;
    let state = AppState::build(config.clone(), db)?;

    if state.providers.is_empty() {
        tracing::warn!("no LLM credentials configured; prompts will fail until llm.* is set");
    }

    // Crash recovery: reconcile transcripts and resume mid-execution
    // sessions before accepting traffic.
    state.sessions.recover_all().await?;

    // Dial configured runners; inbound runners connect to /v2/runners/ws.
    dial::spawn_dialers(state.runners.clone(), &config.runners);

    let app = wuhu_server::api::router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
