use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::CacheError;
use crate::error::Result;

/// Installs a global fmt subscriber filtered by `RUST_LOG`, `info` when unset.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(CacheError::config)?;

    info!("Tracing initialized");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_installs_once() {
        init_tracing().unwrap();
        assert!(matches!(init_tracing(), Err(CacheError::Config(_))));
    }
}
