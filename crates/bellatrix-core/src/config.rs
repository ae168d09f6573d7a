/*!
 * Configuration management for Bellatrix.
 *
 * Settings are layered: built-in defaults, then an optional TOML file, then
 * environment variables (`BELLATRIX__SERIAL__BAUD_RATE=115200`).
 */
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Environment variable prefix used by the binaries
pub const ENV_PREFIX: &str = "BELLATRIX";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Serial transport configuration
    #[serde(default)]
    pub serial: SerialConfig,

    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, `bellatrix_devices=trace`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,

    /// Whether to include the event target in each line
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Serial transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Baud rate used when opening every port
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Terminator appended to every outgoing instruction
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,

    /// Size of the buffer used for each read from the port
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Quiet period after which buffered output counts as one response.
    /// Zero parses every received chunk on its own.
    #[serde(default = "default_response_idle_ms")]
    pub response_idle_ms: u64,

    /// Only ports whose name contains this substring are opened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_filter: Option<String>,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path of the JSON command/script store
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Capacity of the notification broadcast channel
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,

    /// Delay given to placeholder steps appended to a script
    #[serde(default = "default_step_delay_ms")]
    pub default_step_delay_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            line_terminator: default_line_terminator(),
            read_buffer_size: default_read_buffer_size(),
            response_idle_ms: default_response_idle_ms(),
            port_filter: None,
        }
    }
}

impl SerialConfig {
    /// Quiet period as a duration, `None` when chunks are parsed individually
    pub fn response_idle(&self) -> Option<Duration> {
        match self.response_idle_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            notification_capacity: default_notification_capacity(),
            default_step_delay_ms: default_step_delay_ms(),
        }
    }
}

impl EngineConfig {
    /// Store path as a `PathBuf`
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.store_path)
    }
}

impl Config {
    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_app_name() -> String {
    "bellatrix".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_line_terminator() -> String {
    "\r".to_string()
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_response_idle_ms() -> u64 {
    150
}

fn default_store_path() -> String {
    "./data/bellatrix.json".to_string()
}

fn default_notification_capacity() -> usize {
    1024
}

fn default_step_delay_ms() -> u64 {
    1000
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<PathBuf>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let default_config = Config::default();
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            if config_file.exists() {
                debug!("Loading configuration from {}", config_file.display());
                config_builder = config_builder.add_source(File::from(config_file));
            } else {
                debug!(
                    "Configuration file {} does not exist, using defaults",
                    config_file.display()
                );
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        if config.serial.line_terminator.is_empty() {
            return Err(Error::config("serial.line_terminator must not be empty"));
        }
        if config.serial.read_buffer_size == 0 {
            return Err(Error::config("serial.read_buffer_size must be greater than zero"));
        }

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "bellatrix");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.line_terminator, "\r");
        assert_eq!(config.engine.default_step_delay_ms, 1000);
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "bellatrix");
        assert_eq!(config.serial.read_buffer_size, 1024);
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("bellatrix.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [serial]
                baud_rate = 115200
                response_idle_ms = 0
                port_filter = "ttyACM"

                [engine]
                store_path = "/tmp/store.json"
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(&file_path).build()?;

        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.serial.response_idle(), None);
        assert_eq!(config.serial.port_filter.as_deref(), Some("ttyACM"));
        assert_eq!(config.engine.store_path(), PathBuf::from("/tmp/store.json"));
        // untouched sections keep their defaults
        assert_eq!(config.serial.line_terminator, "\r");

        Ok(())
    }

    #[test]
    fn test_config_builder_missing_file_uses_defaults() -> Result<()> {
        let config = ConfigBuilder::new()
            .with_config_file("/nonexistent/bellatrix.toml")
            .build()?;
        assert_eq!(config.serial.baud_rate, 9600);
        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("BELLATRIXTEST__SERIAL__BAUD_RATE", "57600");
        env::set_var("BELLATRIXTEST__LOGGING__LEVEL", "trace");

        let config = ConfigBuilder::new()
            .with_environment_prefix("BELLATRIXTEST")
            .build()?;

        assert_eq!(config.serial.baud_rate, 57600);
        assert_eq!(config.logging.level, "trace");

        env::remove_var("BELLATRIXTEST__SERIAL__BAUD_RATE");
        env::remove_var("BELLATRIXTEST__LOGGING__LEVEL");

        Ok(())
    }

    #[test]
    fn test_response_idle() {
        let mut serial = SerialConfig::default();
        assert_eq!(serial.response_idle(), Some(Duration::from_millis(150)));
        serial.response_idle_ms = 0;
        assert_eq!(serial.response_idle(), None);
    }

    #[test]
    fn test_to_toml_round_trips_through_builder() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("dump.toml");
        let mut config = Config::default();
        config.serial.baud_rate = 19200;
        std::fs::write(&file_path, config.to_toml()?)?;

        let loaded = ConfigBuilder::new().with_config_file(&file_path).build()?;
        assert_eq!(loaded.serial.baud_rate, 19200);
        Ok(())
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let shared2 = shared.clone();
        assert_eq!(shared2.get().general.app_name, "bellatrix");
    }
}
