//! Log subscriber setup for binaries embedding framewire.
//!
//! The library itself only emits `tracing` events.

use tracing_subscriber::EnvFilter;

use crate::error::{FramewireError, Result};

/// Default filter: framewire events at `level`.
fn default_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(format!("framewire={level}"))
        .map_err(|e| FramewireError::Config(format!("bad log level {level:?}: {e}")))
}

/// Install a global fmt subscriber. `RUST_LOG` wins over `level` when set.
///
/// Returns an error if `level` is not understood or a subscriber is
/// already installed.
pub fn init(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(level)?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| FramewireError::Config(format!("logging already initialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(default_filter("debug").is_ok());
        assert!(default_filter("info").is_ok());
    }
}
