use std::str::FromStr;

use tracing_subscriber::{fmt, EnvFilter};

/// Output format for the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    /// Suitable for Vector / Loki / ELK.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "text" | "pretty" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging in the requested format.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise falls back
/// to `default_level` (e.g. "info", "at_agents=debug,warn").
///
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    let filter = env_filter(default_level);

    let installed = match format {
        LogFormat::Human => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, format = ?format, "logging initialised");
    }
}

/// Initialize logging with human-readable output format.
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Human);
}

/// Initialize logging with JSON output format.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Json);
}
