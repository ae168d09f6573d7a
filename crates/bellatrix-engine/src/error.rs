/*!
 * Error types for the Bellatrix engine crate.
 */
use thiserror::Error;

use bellatrix_devices::DeviceError;

/// Error type for Bellatrix engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// A script step failed to send; the run was aborted
    #[error("Step {step} of script '{script}' failed on {port}: {source}")]
    Step {
        /// Device the run targeted
        port: String,
        /// Script being run
        script: String,
        /// Zero-based index of the failed step
        step: usize,
        /// Underlying device error
        #[source]
        source: DeviceError,
    },

    /// The run was cancelled before every step was sent
    #[error("Script '{script}' aborted on {port} after {steps_sent} step(s)")]
    Aborted {
        /// Device the run targeted
        port: String,
        /// Script being run
        script: String,
        /// Steps written before the abort
        steps_sent: usize,
    },

    /// The script is running and cannot be edited
    #[error("Script is running: {0}")]
    ScriptBusy(String),

    /// The device already has an active run
    #[error("Device is busy: {0}")]
    DeviceBusy(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] bellatrix_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Command store error
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists error
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for Bellatrix engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new step error
    pub fn step<P: Into<String>, S: Into<String>>(
        port: P,
        script: S,
        step: usize,
        source: DeviceError,
    ) -> Self {
        Error::Step {
            port: port.into(),
            script: script.into(),
            step,
            source,
        }
    }

    /// Create a new aborted error
    pub fn aborted<P: Into<String>, S: Into<String>>(port: P, script: S, steps_sent: usize) -> Self {
        Error::Aborted {
            port: port.into(),
            script: script.into(),
            steps_sent,
        }
    }

    /// Create a new script busy error
    pub fn script_busy<S: AsRef<str>>(name: S) -> Self {
        Error::ScriptBusy(name.as_ref().to_string())
    }

    /// Create a new device busy error
    pub fn device_busy<S: AsRef<str>>(port: S) -> Self {
        Error::DeviceBusy(port.as_ref().to_string())
    }

    /// Create a new store error
    pub fn store<S: AsRef<str>>(msg: S) -> Self {
        Error::Store(msg.as_ref().to_string())
    }

    /// Create a new validation error
    pub fn validation<S: AsRef<str>>(msg: S) -> Self {
        Error::Validation(msg.as_ref().to_string())
    }

    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        Error::NotFound(msg.as_ref().to_string())
    }

    /// Create a new already exists error
    pub fn already_exists<S: AsRef<str>>(msg: S) -> Self {
        Error::AlreadyExists(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }

    /// Port the error is attributed to, if any
    pub fn port(&self) -> Option<&str> {
        match self {
            Error::Step { port, .. } | Error::Aborted { port, .. } => Some(port),
            Error::DeviceBusy(port) => Some(port),
            Error::Device(err) => err.port(),
            _ => None,
        }
    }

    /// Whether the error is a cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Aborted { .. } => true,
            Error::Step { source, .. } => source.is_closed(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_attribution() {
        let err = Error::step("COM2", "Unlock", 1, DeviceError::write("COM2", "broken pipe"));
        assert_eq!(err.port(), Some("COM2"));
        assert!(!err.is_cancellation());
        assert!(err.to_string().contains("Step 1 of script 'Unlock' failed on COM2"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_cancellation_kinds() {
        assert!(Error::aborted("COM1", "Info", 0).is_cancellation());
        assert!(Error::step("COM1", "Info", 0, DeviceError::closed("COM1")).is_cancellation());
        assert!(!Error::script_busy("Info").is_cancellation());
    }

    #[test]
    fn test_device_error_port_passthrough() {
        let err: Error = DeviceError::not_found("COM9").into();
        assert_eq!(err.port(), Some("COM9"));
        assert_eq!(Error::validation("x").port(), None);
    }
}
