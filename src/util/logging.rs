use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Sets up the global tracing subscriber with a fmt formatter and env filter.
///
/// The caller provides a fallback filter string that is used when `RUST_LOG` is
/// not set. Logs go to stderr so stdout stays reserved for reports.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

/// CLI startup: load `.env` (so `RUST_LOG` from it applies), install the
/// subscriber, then log the bootstrap line through it.
pub fn init_cli(bin_name: &str, default_filter: &str) -> Result<(), anyhow::Error> {
    crate::util::env::init_env();
    let installed = init_tracing(default_filter);
    crate::util::env::bootstrap_cli(bin_name);
    installed
}
