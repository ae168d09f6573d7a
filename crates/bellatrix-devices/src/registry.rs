/*!
 * Registry of connected devices, keyed by port name.
 */
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::device::{Device, DeviceError, Result};

/// Device registry
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<String, Arc<Device>>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device; a port can hold only one device
    pub fn register(&self, device: Arc<Device>) -> Result<()> {
        let mut devices = self.devices.write().map_err(|_| {
            DeviceError::Other("Failed to acquire write lock on device registry".to_string())
        })?;

        let port = device.port_name().to_string();
        if devices.contains_key(&port) {
            return Err(DeviceError::Other(format!(
                "Device on port {} already registered",
                port
            )));
        }

        debug!(port = %port, "Registered device");
        devices.insert(port, device);
        Ok(())
    }

    /// Remove a device, returning it
    pub fn unregister(&self, port: &str) -> Result<Arc<Device>> {
        let mut devices = self.devices.write().map_err(|_| {
            DeviceError::Other("Failed to acquire write lock on device registry".to_string())
        })?;

        let device = devices.remove(port).ok_or_else(|| DeviceError::not_found(port))?;
        debug!(port, "Unregistered device");
        Ok(device)
    }

    /// Remove every device, returning them in port order
    pub fn drain(&self) -> Result<Vec<Arc<Device>>> {
        let mut devices = self.devices.write().map_err(|_| {
            DeviceError::Other("Failed to acquire write lock on device registry".to_string())
        })?;

        Ok(std::mem::take(&mut *devices).into_values().collect())
    }

    /// Get a device by port
    pub fn get(&self, port: &str) -> Result<Arc<Device>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::Other("Failed to acquire read lock on device registry".to_string())
        })?;

        devices.get(port).cloned().ok_or_else(|| DeviceError::not_found(port))
    }

    /// All devices in port order
    pub fn devices(&self) -> Result<Vec<Arc<Device>>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::Other("Failed to acquire read lock on device registry".to_string())
        })?;

        Ok(devices.values().cloned().collect())
    }

    /// All registered port names
    pub fn port_names(&self) -> Result<Vec<String>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::Other("Failed to acquire read lock on device registry".to_string())
        })?;

        Ok(devices.keys().cloned().collect())
    }

    /// Number of registered devices
    pub fn count(&self) -> Result<usize> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::Other("Failed to acquire read lock on device registry".to_string())
        })?;

        Ok(devices.len())
    }

    /// Whether a device is registered on this port
    pub fn contains(&self, port: &str) -> Result<bool> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::Other("Failed to acquire read lock on device registry".to_string())
        })?;

        Ok(devices.contains_key(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannel;

    fn device(port: &str) -> Arc<Device> {
        Arc::new(Device::new(Arc::new(MockChannel::new(port))))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = DeviceRegistry::new();
        registry.register(device("COM3")).unwrap();
        registry.register(device("COM1")).unwrap();

        assert_eq!(registry.count().unwrap(), 2);
        assert!(registry.contains("COM1").unwrap());
        assert_eq!(registry.get("COM3").unwrap().port_name(), "COM3");
        assert_eq!(registry.port_names().unwrap(), vec!["COM1", "COM3"]);
        assert!(matches!(
            registry.get("COM9"),
            Err(DeviceError::NotFound { ref port }) if port == "COM9"
        ));
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let registry = DeviceRegistry::new();
        registry.register(device("COM1")).unwrap();
        assert!(registry.register(device("COM1")).is_err());
    }

    #[test]
    fn test_unregister_and_drain() {
        let registry = DeviceRegistry::new();
        registry.register(device("COM1")).unwrap();
        registry.register(device("COM2")).unwrap();

        assert_eq!(registry.unregister("COM1").unwrap().port_name(), "COM1");
        assert!(registry.unregister("COM1").is_err());

        let drained = registry.drain().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(registry.count().unwrap(), 0);
    }
}
