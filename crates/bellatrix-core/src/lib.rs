/*!
 * Bellatrix Core
 *
 * This crate provides the shared plumbing for the Bellatrix workspace:
 * configuration, logging, error types and the notification bus.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use tokio;
    pub use tracing;
}

/// Bellatrix core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with default logging
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("Bellatrix Core {} initialized", VERSION);
    Ok(())
}

/// Library initialization driven by a loaded configuration
pub fn init_with_config(config: &config::Config) -> Result<(), error::Error> {
    logging::init_with_config(&config.logging)?;
    tracing::info!(
        environment = %config.general.environment,
        "Bellatrix Core {} initialized",
        VERSION
    );
    Ok(())
}
