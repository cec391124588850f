use tracing_subscriber::EnvFilter;

/// Initialize tracing from `RUST_LOG`, defaulting to `info`.
///
/// Returns `Err` if a global subscriber is already installed; callers
/// that may race (tests, bins calling into each other) use `.ok()`.
pub fn init() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::util::SubscriberInitExt as _;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .finish()
        .try_init()
}
