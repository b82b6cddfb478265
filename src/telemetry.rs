//! Tracing initialization.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// filter; repeated calls are no-ops (tests share a process).
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.filter.as_deref().unwrap_or("info"))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let result = if config.stdout {
        builder.try_init()
    } else {
        builder.with_writer(std::io::sink).try_init()
    };
    if result.is_err() {
        tracing::trace!("subscriber already installed");
    }
}
