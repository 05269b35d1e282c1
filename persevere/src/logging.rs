//! Diagnostic tracing for the plugin.
//!
//! Output goes to stderr only: the bridge binary owns stdout for its protocol.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` (the config's
/// `log_level`) is used. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=persevere=debug persevere-bridge
/// ```
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
