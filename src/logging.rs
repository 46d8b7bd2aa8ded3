//! `tracing` subscriber setup.
//!
//! Filter precedence: `AUTOPILOT_LOG`, then `[log] level`, then `info`.
//! `-v` forces `debug`. Logs go to stderr so `--json` stdout stays clean.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogConfig, LogFormat};

pub const LOG_ENV: &str = "AUTOPILOT_LOG";

/// Pick the filter directive without touching global state
pub fn filter_directive(config: &LogConfig, verbose: bool, env_value: Option<&str>) -> String {
    if verbose {
        return "debug".to_string();
    }
    match env_value {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ if !config.level.trim().is_empty() => config.level.clone(),
        _ => "info".to_string(),
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(config: &LogConfig, verbose: bool) {
    let env_value = std::env::var(LOG_ENV).ok();
    let directive = filter_directive(config, verbose, env_value.as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .ok();
}
