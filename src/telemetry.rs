use tracing_subscriber::EnvFilter;

use crate::error::{OrchestratorError, Result};

/// Initialize tracing once at startup. `LOG_LEVEL` drives the filter;
/// an explicit `RUST_LOG` still wins.
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|err| OrchestratorError::Config(format!("invalid LOG_LEVEL: {err}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| OrchestratorError::Config(format!("tracing init failed: {err}")))?;
    Ok(())
}
