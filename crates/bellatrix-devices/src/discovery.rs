/*!
 * Port enumeration and opening.
 *
 * A [`PortProvider`] lists the serial ports present on the host and opens
 * exclusive channels to them. The connection manager drives discovery
 * through this trait so that tests can substitute an in-memory provider.
 */
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::SerialChannel;
use crate::device::{Device, DeviceError, Result};

/// Source of serial ports
#[async_trait]
pub trait PortProvider: Send + Sync + Debug {
    /// Provider name, for logging
    fn name(&self) -> &str;

    /// Names of the ports currently present
    async fn available_ports(&self) -> Result<Vec<String>>;

    /// Open an exclusive channel to a port
    async fn open(&self, port: &str) -> Result<Arc<dyn SerialChannel>>;
}

/// Outcome of a discovery pass
///
/// Ports that failed to open are reported as warnings; they never abort
/// the pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Devices connected by this pass, in port order
    pub devices: Vec<Arc<Device>>,
    /// Per-port failures
    pub warnings: Vec<DeviceError>,
}

impl DiscoveryReport {
    /// Port names of the connected devices
    pub fn port_names(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|device| device.port_name().to_string())
            .collect()
    }

    /// Whether every enumerated port connected
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Keep ports matching the filter, sorted and without duplicates
pub(crate) fn select_ports(mut ports: Vec<String>, filter: Option<&str>) -> Vec<String> {
    if let Some(filter) = filter.filter(|f| !f.is_empty()) {
        ports.retain(|port| port.contains(filter));
    }
    ports.sort();
    ports.dedup();
    ports
}

#[cfg(feature = "serial")]
pub use self::serial::SerialPortProvider;

#[cfg(feature = "serial")]
mod serial {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tracing::debug;

    use bellatrix_core::config::SerialConfig;

    use super::{select_ports, PortProvider};
    use crate::channel::{SerialChannel, SerialPortChannel};
    use crate::device::{DeviceError, Result};

    /// Provider backed by the host's serial ports
    #[derive(Debug, Clone)]
    pub struct SerialPortProvider {
        config: SerialConfig,
    }

    impl SerialPortProvider {
        /// Create a provider using these port settings
        pub fn new(config: SerialConfig) -> Self {
            Self { config }
        }

        /// Port settings
        pub fn config(&self) -> &SerialConfig {
            &self.config
        }
    }

    #[async_trait]
    impl PortProvider for SerialPortProvider {
        fn name(&self) -> &str {
            "serial"
        }

        async fn available_ports(&self) -> Result<Vec<String>> {
            let ports = tokio::task::spawn_blocking(tokio_serial::available_ports)
                .await
                .map_err(|e| DeviceError::Enumeration(e.to_string()))?
                .map_err(|e| DeviceError::Enumeration(e.to_string()))?;

            let names = ports.into_iter().map(|port| port.port_name).collect();
            let selected = select_ports(names, self.config.port_filter.as_deref());
            debug!(count = selected.len(), "Enumerated serial ports");
            Ok(selected)
        }

        async fn open(&self, port: &str) -> Result<Arc<dyn SerialChannel>> {
            let channel = SerialPortChannel::open(port, &self.config)?;
            Ok(Arc::new(channel))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_ports_sorts_and_dedups() {
        let ports = vec!["COM4".to_string(), "COM1".to_string(), "COM4".to_string()];
        assert_eq!(select_ports(ports, None), vec!["COM1", "COM4"]);
    }

    #[test]
    fn test_select_ports_applies_filter() {
        let ports = vec![
            "/dev/ttyACM0".to_string(),
            "/dev/ttyS0".to_string(),
            "/dev/ttyACM1".to_string(),
        ];
        assert_eq!(
            select_ports(ports.clone(), Some("ttyACM")),
            vec!["/dev/ttyACM0", "/dev/ttyACM1"]
        );
        assert_eq!(select_ports(ports, Some("")).len(), 3);
    }

    #[test]
    fn test_report_helpers() {
        let report = DiscoveryReport {
            devices: Vec::new(),
            warnings: vec![DeviceError::connection("COM2", "busy")],
        };
        assert!(!report.is_clean());
        assert!(report.port_names().is_empty());
    }
}
