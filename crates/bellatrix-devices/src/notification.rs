/*!
 * Notifications published to observers (console, device table, progress).
 */
use serde::Serialize;

use bellatrix_core::event::SharedEventBus;

use crate::telemetry::{DeviceField, DeviceInfo};

/// Something observers may want to render
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A device was connected by discovery
    DeviceDiscovered(DeviceInfo),
    /// A device's telemetry changed
    DeviceUpdated {
        /// Port of the device
        port_name: String,
        /// Fields that changed
        changed: Vec<DeviceField>,
        /// Snapshot after the change
        info: DeviceInfo,
    },
    /// Raw text received from a device
    ConsoleLine {
        /// Port of the device
        port_name: String,
        /// Received text
        text: String,
    },
    /// A script run advanced
    ScriptProgress {
        /// Port of the device
        port_name: String,
        /// Script being run
        script: String,
        /// Percentage of steps sent, 0 when the run finished
        percent: u8,
    },
    /// A script run ended
    ScriptFinished {
        /// Port of the device
        port_name: String,
        /// Script that ran
        script: String,
        /// Whether every step was sent
        completed: bool,
        /// Failure description, if the run failed
        error: Option<String>,
    },
    /// A port could not be connected during discovery
    DiscoveryWarning {
        /// Offending port
        port_name: String,
        /// Failure description
        message: String,
    },
    /// A device was disconnected
    DeviceDisconnected {
        /// Port of the device
        port_name: String,
    },
}

impl Notification {
    /// Port the notification concerns
    pub fn port_name(&self) -> &str {
        match self {
            Notification::DeviceDiscovered(info) => &info.port_name,
            Notification::DeviceUpdated { port_name, .. }
            | Notification::ConsoleLine { port_name, .. }
            | Notification::ScriptProgress { port_name, .. }
            | Notification::ScriptFinished { port_name, .. }
            | Notification::DiscoveryWarning { port_name, .. }
            | Notification::DeviceDisconnected { port_name } => port_name,
        }
    }
}

/// Bus carrying [`Notification`]s
pub type NotificationBus = SharedEventBus<Notification>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_name() {
        let n = Notification::ConsoleLine {
            port_name: "COM5".into(),
            text: "OK".into(),
        };
        assert_eq!(n.port_name(), "COM5");
        assert_eq!(
            Notification::DeviceDiscovered(DeviceInfo::new("COM6")).port_name(),
            "COM6"
        );
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let n = Notification::ScriptProgress {
            port_name: "COM5".into(),
            script: "Unlock".into(),
            percent: 50,
        };
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "script_progress");
        assert_eq!(value["percent"], 50);
    }
}
