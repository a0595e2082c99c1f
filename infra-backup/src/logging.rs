//! Tracing subscriber setup for the CLI and daemon.
//!
//! Logs go to stderr so reports printed on stdout stay machine-readable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Dependencies that are chatty at debug level.
const QUIET_CRATES: &[&str] = &["tokio_cron_scheduler", "reqwest", "hyper", "rustls", "r2d2"];

/// Filter directives for a configured level: the level applies to our own
/// crates, dependencies stay at `warn` unless the level is stricter.
pub fn directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    let deps = if level == "error" { "error" } else { "warn" };
    let mut parts = vec![level.clone()];
    parts.extend(QUIET_CRATES.iter().map(|c| format!("{c}={deps}")));
    parts.join(",")
}

/// `RUST_LOG` wins over the configured level when it is set.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(level)))
        .unwrap_or_else(|_| EnvFilter::new(directives("info")));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()?;

    Ok(())
}
