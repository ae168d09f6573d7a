/*!
 * Named, ordered command sequences.
 */
use serde::{Deserialize, Serialize};

use bellatrix_devices::Command;

use crate::error::{Error, Result};

/// A named sequence of commands run in order against one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    commands: Vec<Command>,
}

impl Script {
    /// Create an empty script
    pub fn new<N: Into<String>, D: Into<String>>(name: N, description: D) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            commands: Vec::new(),
        }
    }

    /// Builder-style append
    pub fn with_command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Unique script name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Steps in execution order
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the script has no steps
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Append a step
    pub fn add_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Remove every step equal to `command` in all three fields
    ///
    /// Returns how many steps were removed.
    pub fn remove_command(&mut self, command: &Command) -> usize {
        let before = self.commands.len();
        self.commands.retain(|step| step != command);
        before - self.commands.len()
    }

    /// Check the script can be stored and run
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("script name must not be empty"));
        }
        for (index, command) in self.commands.iter().enumerate() {
            command.validate().map_err(|e| {
                Error::validation(format!("script '{}' step {}: {}", self.name, index, e))
            })?;
        }
        Ok(())
    }
}
