/*!
 * Commands sent to devices.
 */
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceError, Result};

/// An instruction with a human-readable description and a post-send delay
///
/// Two commands are equal when all three fields are equal; script step
/// removal relies on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    instruction: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    delay_ms: u64,
}

impl Command {
    /// Create a command with no post-send delay
    pub fn new<I: Into<String>, D: Into<String>>(instruction: I, description: D) -> Self {
        Self {
            instruction: instruction.into(),
            description: description.into(),
            delay_ms: 0,
        }
    }

    /// Create an ad hoc command whose description is its instruction
    pub fn raw<I: Into<String>>(instruction: I) -> Self {
        let instruction = instruction.into();
        Self::new(instruction.clone(), instruction)
    }

    /// Set the post-send delay in milliseconds
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Text written to the device, without the line terminator
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Human-readable description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Delay in milliseconds
    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// Delay as a duration
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Reject commands that cannot be sent
    pub fn validate(&self) -> Result<()> {
        if self.instruction.trim().is_empty() {
            return Err(DeviceError::InvalidCommand(
                "instruction must not be empty".to_string(),
            ));
        }
        if self.instruction.contains(['\r', '\n']) {
            return Err(DeviceError::InvalidCommand(format!(
                "instruction {:?} must not contain line terminators",
                self.instruction
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {}ms)", self.instruction, self.description, self.delay_ms)
    }
}
