//! auto-tundra daemon: supervises agent sessions and QA runs until ctrl-c.

use std::path::PathBuf;

use anyhow::{Context, Result};
use at_core::config::Config;
use at_daemon::daemon::Daemon;
use at_telemetry::logging::{self, LogFormat};
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // An explicit path must load; the default location falls back to defaults.
    let (config, load_error) = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load_from(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            (config, None)
        }
        None => match Config::load() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };

    let format = config
        .general
        .log_format
        .parse::<LogFormat>()
        .unwrap_or(LogFormat::Human);
    logging::init("at-daemon", &config.general.log_level, format);
    if let Some(e) = load_error {
        warn!(error = %e, "failed to load config, using defaults");
    }

    info!(
        project = %config.general.project_name,
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "auto-tundra daemon starting"
    );

    let daemon = Daemon::new(config)?;
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
