/*!
 * Logging functionality for Bellatrix.
 *
 * Tracing setup plus the span helpers used by the device and engine crates.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_config(&LoggingConfig::default())
}

/// Initialize the logging system from a logging configuration
///
/// `RUST_LOG` takes precedence over the configured level when it is set.
pub fn init_with_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("Invalid log filter '{}': {}", config.level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_format {
        registry
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(config.with_target))
            .try_init()
    };

    result.map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `port` - The serial port the component instance is bound to, if any
pub fn component_span(name: &str, port: Option<&str>) -> Span {
    match port {
        Some(port) => tracing::info_span!("component", name = %name, port = %port),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}
