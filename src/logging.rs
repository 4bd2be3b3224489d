use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber. `RUST_LOG` wins over
/// `default_level`.
pub fn init(default_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .with_context(|| format!("invalid log level {default_level:?}"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
}
