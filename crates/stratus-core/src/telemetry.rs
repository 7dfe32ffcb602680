//! Logging setup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingSettings};

/// Filter used when `RUST_LOG` is unset: `settings.level` for Stratus crates,
/// warnings for everything else.
pub fn default_filter(settings: &LoggingSettings) -> String {
    let level = &settings.level;
    format!(
        "warn,stratus_core={level},stratus_resilience={level},stratus_cli={level},stratus={level}"
    )
}

/// Installs the global subscriber. Logs go to stderr.
///
/// Returns false if a subscriber was already installed.
pub fn init_logging(settings: &LoggingSettings) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(settings).into());
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match settings.format {
        LogFormat::Plain => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.is_ok()
}
