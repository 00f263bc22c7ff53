//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::EnvFilter;

use crate::types::{Result, StoreError};

/// Filter used when neither an explicit filter nor `RUST_LOG` is given.
pub const DEFAULT_FILTER: &str = "dirstore=info";

/// Installs a formatted stderr subscriber.
///
/// `filter` takes precedence over `RUST_LOG`; both use `EnvFilter` directive
/// syntax. Installing twice is not an error, the first subscriber stays.
pub fn init_logging(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|err| StoreError::Config(format!("invalid log filter: {err}")))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_ids(true)
        .with_target(true)
        .with_ansi(false)
        .try_init();
    Ok(())
}
