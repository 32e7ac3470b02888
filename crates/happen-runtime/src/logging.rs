use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global `tracing` subscriber, honoring `RUST_LOG` and falling
/// back to `default_level` when it is unset. Safe to call at most once per
/// process; a second call is a no-op error the caller can ignore.
pub fn init_tracing(default_level: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}
