//! Process-wide `tracing` subscriber.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info,scanward_core::orchestration::scheduler=info";

/// `RUST_LOG` wins over `fallback`; `fallback` wins over [`DEFAULT_FILTER`].
pub fn build_filter(fallback: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        fallback
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    })
}

/// Installs a registry with an env filter and a fmt layer.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(fallback: Option<&str>) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(build_filter(fallback))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}
