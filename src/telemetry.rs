use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,stream_relay=debug";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default, e.g. `RUST_LOG=stream_relay::relay=trace`.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .init();
}
