/*!
 * Bellatrix Devices
 *
 * Serial channels to AT-command devices, the table-driven response parser,
 * and the connection manager that keeps each device's telemetry current.
 */

#![warn(missing_docs)]

// Re-export core types
pub use bellatrix_core::prelude;

pub mod assembler;
pub mod channel;
pub mod command;
pub mod device;
pub mod discovery;
pub mod manager;
pub mod notification;
pub mod parser;
pub mod registry;
pub mod telemetry;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use channel::{ChunkStream, SerialChannel};
pub use command::Command;
pub use device::{Device, DeviceError, Result};
pub use discovery::{DiscoveryReport, PortProvider};
pub use manager::ConnectionManager;
pub use notification::{Notification, NotificationBus};
pub use parser::{extract_between, ResponseParser};
pub use telemetry::{DeviceField, DeviceInfo, FieldUpdate, FieldValue, LockState};

#[cfg(feature = "serial")]
pub use channel::SerialPortChannel;
#[cfg(feature = "serial")]
pub use discovery::SerialPortProvider;

/// Bellatrix devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = Vec::new();

    #[cfg(feature = "serial")]
    transports.push("serial");

    #[cfg(feature = "mock")]
    transports.push("mock");

    transports
}
