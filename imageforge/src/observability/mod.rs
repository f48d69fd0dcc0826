//! Log subscriber setup.
//!
//! Library code only emits `tracing` events. Binaries and integration harnesses
//! call [`init_tracing`] once to install a subscriber.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per record.
    Json,
}

/// Returns the default filter directive for the given debug flag.
#[must_use]
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "imageforge=debug,info"
    } else {
        "info"
    }
}

/// Builds the filter: `RUST_LOG` wins when set, otherwise the debug flag
/// selects the level.
#[must_use]
pub fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}

/// Installs the global subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(debug: bool, format: LogFormat) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(debug));

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
            .try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()?,
    }

    let verbose = debug;
    tracing::debug!(?format, verbose, "tracing initialized");
    Ok(())
}
