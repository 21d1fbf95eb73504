//! Tracing subscriber setup for embedding applications and tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! the host's job. This helper wires up the common case: a fmt layer with an
//! env-filter that respects `RUST_LOG`.

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize a console subscriber. Safe to call more than once; only the
/// first call installs.
pub fn init_logging(default_level: Level) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
