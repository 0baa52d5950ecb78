use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber from `RUST_LOG`, falling back
/// to `level` when the environment variable is unset.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
