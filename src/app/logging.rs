use tracing_subscriber::EnvFilter;

/// `LOG_LEVEL_DEBUG=1` elevates the fallback level; an explicit `RUST_LOG`
/// still wins.
pub fn init_logging() {
    let fallback = if debug_requested() { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .try_init();
    }
}

fn debug_requested() -> bool {
    matches!(
        std::env::var("LOG_LEVEL_DEBUG").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE")
    )
}
