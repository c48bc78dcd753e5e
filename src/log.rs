//! Module that wraps `tracing` with the short helpers used across the crate.
//!
//! Messages are usually built with `color_print::cformat!` so that peer names
//! and message kinds stand out in a terminal.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Function that installs the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}

pub fn debug(msg: &str) {
    tracing::debug!("{msg}");
}

pub fn info(msg: &str) {
    tracing::info!("{msg}");
}

pub fn warn(msg: &str) {
    tracing::warn!("{msg}");
}

pub fn error(msg: &str) {
    tracing::error!("{msg}");
}
