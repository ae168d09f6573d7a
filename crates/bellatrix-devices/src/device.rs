/*!
 * Connected device handle and device error types.
 *
 * A [`Device`] pairs an open serial channel with the latest telemetry
 * snapshot for that port. Only the connection manager's response pump
 * mutates the snapshot; everyone else reads copies of it.
 */
use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use bellatrix_core::error::Error as CoreError;

use crate::channel::SerialChannel;
use crate::telemetry::{DeviceField, DeviceInfo, FieldUpdate};

/// Error type for device operations
///
/// Every variant that concerns a specific port carries its name.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The port could not be opened or enumerated
    #[error("Connection error on {port}: {reason}")]
    Connection {
        /// Offending port
        port: String,
        /// Underlying reason
        reason: String,
    },

    /// Transmission failed on an open channel
    #[error("Write error on {port}: {reason}")]
    Write {
        /// Offending port
        port: String,
        /// Underlying reason
        reason: String,
    },

    /// The channel was closed while an operation was pending
    #[error("Connection closed on {port}")]
    ConnectionClosed {
        /// Offending port
        port: String,
    },

    /// No connected device on this port
    #[error("Device not found: {port}")]
    NotFound {
        /// Requested port
        port: String,
    },

    /// The incoming stream of a channel was already taken
    #[error("Incoming stream already taken on {port}")]
    StreamTaken {
        /// Offending port
        port: String,
    },

    /// The command cannot be sent
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Listing available ports failed
    #[error("Port enumeration failed: {0}")]
    Enumeration(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl DeviceError {
    /// Create a connection error
    pub fn connection<P: Into<String>, R: ToString>(port: P, reason: R) -> Self {
        DeviceError::Connection { port: port.into(), reason: reason.to_string() }
    }

    /// Create a write error
    pub fn write<P: Into<String>, R: ToString>(port: P, reason: R) -> Self {
        DeviceError::Write { port: port.into(), reason: reason.to_string() }
    }

    /// Create a connection-closed error
    pub fn closed<P: Into<String>>(port: P) -> Self {
        DeviceError::ConnectionClosed { port: port.into() }
    }

    /// Create a not-found error
    pub fn not_found<P: Into<String>>(port: P) -> Self {
        DeviceError::NotFound { port: port.into() }
    }

    /// Port the error is attributed to, if any
    pub fn port(&self) -> Option<&str> {
        match self {
            DeviceError::Connection { port, .. }
            | DeviceError::Write { port, .. }
            | DeviceError::ConnectionClosed { port }
            | DeviceError::NotFound { port }
            | DeviceError::StreamTaken { port } => Some(port),
            _ => None,
        }
    }

    /// Whether the error means the channel went away
    pub fn is_closed(&self) -> bool {
        matches!(self, DeviceError::ConnectionClosed { .. })
    }
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// A connected device
#[derive(Debug)]
pub struct Device {
    port_name: String,
    channel: Arc<dyn SerialChannel>,
    info: watch::Sender<DeviceInfo>,
}

impl Device {
    pub(crate) fn new(channel: Arc<dyn SerialChannel>) -> Self {
        let port_name = channel.port_name().to_string();
        let (info, _) = watch::channel(DeviceInfo::new(port_name.clone()));
        Self { port_name, channel, info }
    }

    /// Port this device is attached to
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Copy of the current telemetry
    pub fn snapshot(&self) -> DeviceInfo {
        self.info.borrow().clone()
    }

    /// Receiver that observes every telemetry change
    pub fn watch(&self) -> watch::Receiver<DeviceInfo> {
        self.info.subscribe()
    }

    /// Whether the underlying channel is still open
    pub fn is_connected(&self) -> bool {
        self.channel.is_open()
    }

    /// Resolves once the channel has been closed
    pub async fn closed(&self) {
        self.channel.closed().await
    }

    /// Close the underlying channel; idempotent
    pub async fn close(&self) {
        self.channel.close().await
    }

    pub(crate) async fn write_line(&self, text: &str) -> Result<()> {
        self.channel.write_line(text).await
    }

    /// Apply parsed updates as a single atomic change
    pub(crate) fn apply(&self, updates: &[FieldUpdate]) -> Vec<DeviceField> {
        let mut changed = Vec::new();
        self.info.send_if_modified(|info| {
            changed = info.apply(updates);
            !changed.is_empty()
        });
        if !changed.is_empty() {
            debug!(port = %self.port_name, ?changed, "Telemetry updated");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannel;
    use crate::telemetry::LockState;

    #[test]
    fn test_error_carries_port() {
        let err = DeviceError::write("COM7", "broken pipe");
        assert_eq!(err.port(), Some("COM7"));
        assert_eq!(err.to_string(), "Write error on COM7: broken pipe");
        assert!(DeviceError::closed("COM7").is_closed());
        assert_eq!(DeviceError::InvalidCommand("x".into()).port(), None);
    }

    #[tokio::test]
    async fn test_apply_notifies_watchers_once() {
        let device = Device::new(Arc::new(MockChannel::new("COM4")));
        let mut rx = device.watch();
        rx.borrow_and_update();

        let changed = device.apply(&[
            FieldUpdate::text(DeviceField::Imei, "356789012345678"),
            FieldUpdate::lock(DeviceField::ActivationLock, LockState::Unlocked),
        ]);
        assert_eq!(changed.len(), 2);
        assert!(rx.has_changed().unwrap());

        let info = rx.borrow_and_update().clone();
        assert_eq!(info.imei.as_deref(), Some("356789012345678"));
        assert_eq!(info.activation_lock, LockState::Unlocked);

        // unchanged values do not wake watchers
        device.apply(&[FieldUpdate::text(DeviceField::Imei, "356789012345678")]);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_close_disconnects() {
        let device = Device::new(Arc::new(MockChannel::new("COM4")));
        assert!(device.is_connected());
        device.close().await;
        assert!(!device.is_connected());
        device.closed().await;
        assert!(matches!(
            device.write_line("AT").await,
            Err(DeviceError::ConnectionClosed { .. })
        ));
    }
}
