//! Logging initialization
//!
//! Installs a `tracing-subscriber` fmt layer honoring `RUST_LOG`. The
//! enclosing agent owns process-wide logging policy; this helper exists so
//! tests and demos get sensible output with one call.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subsystem.
///
/// `default_directives` is used when `RUST_LOG` is unset (e.g.
/// `"info,cgwarden=debug"`). Calling this more than once is harmless; later
/// calls are no-ops.
pub fn init(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
