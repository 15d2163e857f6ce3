//! `agwd` — the gateway daemon.
//!
//! Loads settings (optional `AGW_CONFIG` TOML + `AGW_*` env overrides),
//! initialises logging, opens the SQLite repository, starts the gateway and
//! serves the control plane until Ctrl+C.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use agw::{
    config::Settings,
    gateway::Gateway,
    observability::init_logging,
    persistence::{Repository, SqliteRepository},
    server,
};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("agwd: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), String> {
    let config_path = std::env::var("AGW_CONFIG").ok().map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())
        .map_err(|e| format!("configuration error: {e}"))?;

    init_logging(&settings.log_level, settings.json_logs);

    std::fs::create_dir_all(&settings.data_dir)
        .map_err(|e| format!("cannot create data dir {}: {e}", settings.data_dir))?;
    let repo: Arc<dyn Repository> = Arc::new(
        SqliteRepository::open(&settings.sqlite_path)
            .map_err(|e| format!("cannot open database {}: {e}", settings.sqlite_path))?,
    );

    let gateway = Gateway::new(settings, repo);
    gateway.start().await.map_err(|e| e.to_string())?;

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
    };

    let served = server::serve(Arc::clone(&gateway), shutdown).await;
    gateway.stop().await;
    served
}
