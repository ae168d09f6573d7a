/*!
 * Device telemetry: the structured state extracted from device responses.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tri-state lock status reported by a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// The lock is engaged
    Locked,
    /// The lock is released
    Unlocked,
    /// Not reported yet, or reported with an unrecognized status
    #[default]
    Unknown,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LockState::Locked => "locked",
            LockState::Unlocked => "unlocked",
            LockState::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// A telemetry field of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceField {
    /// International mobile equipment identity
    Imei,
    /// Manufacturer serial number
    SerialNo,
    /// Model number
    ModelNo,
    /// Carrier / product code
    Carrier,
    /// Activation (reactivation) lock
    ActivationLock,
    /// Network (carrier) lock
    NetworkLock,
    /// Android version string
    AndroidVersion,
    /// Storage size
    StorageSize,
}

impl DeviceField {
    /// Every field, in display order
    pub const ALL: [DeviceField; 8] = [
        DeviceField::Imei,
        DeviceField::SerialNo,
        DeviceField::ModelNo,
        DeviceField::Carrier,
        DeviceField::ActivationLock,
        DeviceField::NetworkLock,
        DeviceField::AndroidVersion,
        DeviceField::StorageSize,
    ];

    /// Stable snake_case name of the field
    pub fn name(&self) -> &'static str {
        match self {
            DeviceField::Imei => "imei",
            DeviceField::SerialNo => "serial_no",
            DeviceField::ModelNo => "model_no",
            DeviceField::Carrier => "carrier",
            DeviceField::ActivationLock => "activation_lock",
            DeviceField::NetworkLock => "network_lock",
            DeviceField::AndroidVersion => "android_version",
            DeviceField::StorageSize => "storage_size",
        }
    }

    /// Whether the field holds a [`LockState`] rather than text
    pub fn is_lock(&self) -> bool {
        matches!(self, DeviceField::ActivationLock | DeviceField::NetworkLock)
    }
}

impl fmt::Display for DeviceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// New value for a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Free text value
    Text(String),
    /// Lock status value
    Lock(LockState),
}

/// A single field assignment produced by the response parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    /// Target field
    pub field: DeviceField,
    /// New value
    pub value: FieldValue,
}

impl FieldUpdate {
    /// Text assignment
    pub fn text<S: Into<String>>(field: DeviceField, value: S) -> Self {
        Self { field, value: FieldValue::Text(value.into()) }
    }

    /// Lock assignment
    pub fn lock(field: DeviceField, state: LockState) -> Self {
        Self { field, value: FieldValue::Lock(state) }
    }
}

/// Immutable snapshot of one device's identity and telemetry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Serial port the device is attached to
    pub port_name: String,
    /// IMEI
    pub imei: Option<String>,
    /// Serial number
    pub serial_no: Option<String>,
    /// Model number
    pub model_no: Option<String>,
    /// Carrier / product code
    pub carrier: Option<String>,
    /// Activation lock status
    pub activation_lock: LockState,
    /// Network lock status
    pub network_lock: LockState,
    /// Android version
    pub android_version: Option<String>,
    /// Storage size
    pub storage_size: Option<String>,
    /// When telemetry last changed
    pub last_updated: Option<DateTime<Utc>>,
}

impl DeviceInfo {
    /// Create an empty snapshot for a port
    pub fn new<S: Into<String>>(port_name: S) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Apply updates in order and return the fields whose value changed
    ///
    /// A field appears at most once in the result even if several updates
    /// touched it.
    pub fn apply(&mut self, updates: &[FieldUpdate]) -> Vec<DeviceField> {
        let mut changed = Vec::new();
        for update in updates {
            let did_change = match (&update.value, update.field.is_lock()) {
                (FieldValue::Text(text), false) => self.set_text(update.field, text),
                (FieldValue::Lock(state), true) => self.set_lock(update.field, *state),
                _ => {
                    warn!(
                        port = %self.port_name,
                        field = %update.field,
                        "Ignoring update with mismatched value kind"
                    );
                    false
                }
            };
            if did_change && !changed.contains(&update.field) {
                changed.push(update.field);
            }
        }
        if !changed.is_empty() {
            self.last_updated = Some(Utc::now());
        }
        changed
    }

    /// Display value of a field, `None` while unknown
    pub fn get(&self, field: DeviceField) -> Option<String> {
        match field {
            DeviceField::ActivationLock => lock_display(self.activation_lock),
            DeviceField::NetworkLock => lock_display(self.network_lock),
            _ => self.text_slot(field).and_then(|slot| slot.clone()),
        }
    }

    fn set_text(&mut self, field: DeviceField, text: &str) -> bool {
        let Some(slot) = self.text_slot_mut(field) else {
            return false;
        };
        if slot.as_deref() == Some(text) {
            return false;
        }
        *slot = Some(text.to_string());
        true
    }

    fn set_lock(&mut self, field: DeviceField, state: LockState) -> bool {
        let slot = match field {
            DeviceField::ActivationLock => &mut self.activation_lock,
            DeviceField::NetworkLock => &mut self.network_lock,
            _ => return false,
        };
        if *slot == state {
            return false;
        }
        *slot = state;
        true
    }

    fn text_slot(&self, field: DeviceField) -> Option<&Option<String>> {
        match field {
            DeviceField::Imei => Some(&self.imei),
            DeviceField::SerialNo => Some(&self.serial_no),
            DeviceField::ModelNo => Some(&self.model_no),
            DeviceField::Carrier => Some(&self.carrier),
            DeviceField::AndroidVersion => Some(&self.android_version),
            DeviceField::StorageSize => Some(&self.storage_size),
            DeviceField::ActivationLock | DeviceField::NetworkLock => None,
        }
    }

    fn text_slot_mut(&mut self, field: DeviceField) -> Option<&mut Option<String>> {
        match field {
            DeviceField::Imei => Some(&mut self.imei),
            DeviceField::SerialNo => Some(&mut self.serial_no),
            DeviceField::ModelNo => Some(&mut self.model_no),
            DeviceField::Carrier => Some(&mut self.carrier),
            DeviceField::AndroidVersion => Some(&mut self.android_version),
            DeviceField::StorageSize => Some(&mut self.storage_size),
            DeviceField::ActivationLock | DeviceField::NetworkLock => None,
        }
    }
}

fn lock_display(state: LockState) -> Option<String> {
    match state {
        LockState::Unknown => None,
        known => Some(known.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_snapshot_is_unknown() {
        let info = DeviceInfo::new("/dev/ttyACM0");
        assert_eq!(info.port_name, "/dev/ttyACM0");
        assert_eq!(info.activation_lock, LockState::Unknown);
        for field in DeviceField::ALL {
            assert_eq!(info.get(field), None, "{} should start unknown", field);
        }
        assert!(info.last_updated.is_none());
    }

    #[test]
    fn test_apply_reports_only_changed_fields() {
        let mut info = DeviceInfo::new("COM3");
        let updates = vec![
            FieldUpdate::text(DeviceField::Imei, "123456789012345"),
            FieldUpdate::lock(DeviceField::NetworkLock, LockState::Locked),
        ];
        assert_eq!(
            info.apply(&updates),
            vec![DeviceField::Imei, DeviceField::NetworkLock]
        );
        assert!(info.last_updated.is_some());

        // same values again: nothing changes
        assert!(info.apply(&updates).is_empty());

        let changed = info.apply(&[
            FieldUpdate::text(DeviceField::Imei, "123456789012345"),
            FieldUpdate::text(DeviceField::ModelNo, "SM-G991U"),
        ]);
        assert_eq!(changed, vec![DeviceField::ModelNo]);
        assert_eq!(info.get(DeviceField::NetworkLock).as_deref(), Some("locked"));
    }

    #[test]
    fn test_apply_deduplicates_fields() {
        let mut info = DeviceInfo::new("COM3");
        let changed = info.apply(&[
            FieldUpdate::text(DeviceField::Carrier, "TMB"),
            FieldUpdate::text(DeviceField::Carrier, "XAA"),
        ]);
        assert_eq!(changed, vec![DeviceField::Carrier]);
        assert_eq!(info.carrier.as_deref(), Some("XAA"));
    }

    #[test]
    fn test_apply_ignores_mismatched_kind() {
        let mut info = DeviceInfo::new("COM3");
        let changed = info.apply(&[
            FieldUpdate::text(DeviceField::ActivationLock, "LOCK"),
            FieldUpdate::lock(DeviceField::Imei, LockState::Locked),
        ]);
        assert!(changed.is_empty());
        assert_eq!(info, DeviceInfo::new("COM3"));
    }

    #[test]
    fn test_lock_state_serializes_snake_case() {
        let json = serde_json::to_string(&LockState::Unlocked).unwrap();
        assert_eq!(json, "\"unlocked\"");
        assert_eq!(DeviceField::AndroidVersion.to_string(), "android_version");
    }
}
