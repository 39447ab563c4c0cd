//! Tracing subscriber setup for the command-line binary.
//!
//! `RUST_LOG` takes precedence over the configured level, so
//! `RUST_LOG=kid_readout::instrument=trace` works as expected.

use crate::config::Settings;
use tracing_subscriber::EnvFilter;

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Build the filter used by [`init`].
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{default_level},kid_readout={default_level}"))
    })
}

/// Install the global subscriber. Calling this twice is harmless; the second call is ignored.
pub fn init(settings: &Settings, format: LogFormat) {
    let filter = env_filter(&settings.application.log_level);
    let result = match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
