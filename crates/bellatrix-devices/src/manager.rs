/*!
 * Connection manager.
 *
 * Owns the live device set. Discovery opens one channel per port and
 * spawns a response pump per device; the pump is the only writer of that
 * device's telemetry. Commands are written straight to the device channel.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn, Instrument};

use bellatrix_core::config::SerialConfig;
use bellatrix_core::logging::component_span;

use crate::assembler::{ResponseAssembler, DEFAULT_PENDING_LIMIT};
use crate::channel::ChunkStream;
use crate::command::Command;
use crate::device::{Device, DeviceError, Result};
use crate::discovery::{select_ports, DiscoveryReport, PortProvider};
use crate::notification::{Notification, NotificationBus};
use crate::parser::ResponseParser;
use crate::registry::DeviceRegistry;
use crate::telemetry::DeviceInfo;

/// Idle window used when no configuration is given
pub const DEFAULT_RESPONSE_IDLE: Duration = Duration::from_millis(150);

/// Discovers devices, dispatches commands and routes responses
#[derive(Debug)]
pub struct ConnectionManager {
    provider: Arc<dyn PortProvider>,
    registry: DeviceRegistry,
    parser: ResponseParser,
    notifications: NotificationBus,
    response_idle: Option<Duration>,
    response_limit: usize,
    pumps: StdMutex<HashMap<String, JoinHandle<()>>>,
    discovery_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager with the built-in rules and default idle window
    pub fn new(provider: Arc<dyn PortProvider>, notifications: NotificationBus) -> Self {
        Self {
            provider,
            registry: DeviceRegistry::new(),
            parser: ResponseParser::new(),
            notifications,
            response_idle: Some(DEFAULT_RESPONSE_IDLE),
            response_limit: DEFAULT_PENDING_LIMIT,
            pumps: StdMutex::new(HashMap::new()),
            discovery_lock: Mutex::new(()),
        }
    }

    /// Create a manager using the serial configuration section
    pub fn from_config(
        provider: Arc<dyn PortProvider>,
        config: &SerialConfig,
        notifications: NotificationBus,
    ) -> Self {
        Self::new(provider, notifications)
            .with_response_idle(config.response_idle())
            .with_response_limit(config.read_buffer_size.saturating_mul(16))
    }

    /// Use a different rule table
    pub fn with_parser(mut self, parser: ResponseParser) -> Self {
        self.parser = parser;
        self
    }

    /// Set the idle window; `None` parses every chunk on its own
    pub fn with_response_idle(mut self, idle: Option<Duration>) -> Self {
        self.response_idle = idle;
        self
    }

    /// Largest partial response held back before it is parsed anyway
    pub fn with_response_limit(mut self, limit: usize) -> Self {
        self.response_limit = limit;
        self
    }

    /// Notification bus
    pub fn notifications(&self) -> &NotificationBus {
        &self.notifications
    }

    /// Port provider
    pub fn provider(&self) -> &Arc<dyn PortProvider> {
        &self.provider
    }

    /// Refresh the live device set
    ///
    /// Closes every channel from the previous pass before opening new ones.
    /// Ports that fail to open are reported in the returned warnings.
    pub async fn discover(&self) -> Result<DiscoveryReport> {
        let _guard = self.discovery_lock.lock().await;
        let span = component_span("connection_manager", None);

        async {
            let closed = self.disconnect_all().await;
            if closed > 0 {
                debug!(closed, "Closed previous device set");
            }

            let ports = select_ports(self.provider.available_ports().await?, None);
            info!(provider = self.provider.name(), count = ports.len(), "Discovering devices");

            let mut report = DiscoveryReport::default();
            for port in ports {
                match self.connect(&port).await {
                    Ok(device) => report.devices.push(device),
                    Err(err) => {
                        warn!(port = %port, error = %err, "Skipping port");
                        self.notifications.publish(Notification::DiscoveryWarning {
                            port_name: port.clone(),
                            message: err.to_string(),
                        });
                        report.warnings.push(err);
                    }
                }
            }

            info!(
                connected = report.devices.len(),
                skipped = report.warnings.len(),
                "Discovery finished"
            );
            Ok::<_, DeviceError>(report)
        }
        .instrument(span)
        .await
    }

    async fn connect(&self, port: &str) -> Result<Arc<Device>> {
        let channel = self.provider.open(port).await?;
        let incoming = match channel.incoming() {
            Ok(incoming) => incoming,
            Err(err) => {
                channel.close().await;
                return Err(err);
            }
        };

        let device = Arc::new(Device::new(channel));
        if let Err(err) = self.registry.register(Arc::clone(&device)) {
            device.close().await;
            return Err(err);
        }

        let pump = tokio::spawn(
            pump_responses(
                Arc::clone(&device),
                incoming,
                self.parser,
                self.notifications.clone(),
                self.response_idle,
                self.response_limit,
            )
            .instrument(component_span("response_pump", Some(port))),
        );
        lock_pumps(&self.pumps).insert(port.to_string(), pump);

        debug!(port, "Device connected");
        self.notifications
            .publish(Notification::DeviceDiscovered(device.snapshot()));
        Ok(device)
    }

    /// Send a command to a device
    ///
    /// Telemetry changes only when the device's reply is later parsed.
    pub async fn run_command(&self, device: &Device, command: &Command) -> Result<()> {
        command.validate()?;
        if !device.is_connected() {
            return Err(DeviceError::closed(device.port_name()));
        }
        debug!(port = device.port_name(), instruction = command.instruction(), "Sending command");
        device.write_line(command.instruction()).await
    }

    /// Send one command to several devices concurrently
    ///
    /// Each port gets its own result; a failure on one port does not affect
    /// the others.
    pub async fn run_command_on(
        &self,
        ports: &[String],
        command: &Command,
    ) -> Vec<(String, Result<()>)> {
        let sends = ports.iter().map(|port| async move {
            let result = match self.device(port) {
                Ok(device) => self.run_command(&device, command).await,
                Err(err) => Err(err),
            };
            (port.clone(), result)
        });
        join_all(sends).await
    }

    /// Send an ad hoc line to one device
    pub async fn send_raw(&self, port: &str, text: &str) -> Result<()> {
        let device = self.device(port)?;
        self.run_command(&device, &Command::raw(text)).await
    }

    /// Connected device on a port
    pub fn device(&self, port: &str) -> Result<Arc<Device>> {
        self.registry.get(port)
    }

    /// All connected devices in port order
    pub fn devices(&self) -> Result<Vec<Arc<Device>>> {
        self.registry.devices()
    }

    /// Telemetry snapshot of one device
    pub fn snapshot(&self, port: &str) -> Result<DeviceInfo> {
        Ok(self.device(port)?.snapshot())
    }

    /// Telemetry snapshots of every device
    pub fn snapshots(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices()?.iter().map(|device| device.snapshot()).collect())
    }

    /// Close one device and drop it from the live set
    pub async fn disconnect(&self, port: &str) -> Result<()> {
        let device = self.registry.unregister(port)?;
        self.shutdown(&device).await;
        Ok(())
    }

    /// Close every device, returning how many were closed
    pub async fn disconnect_all(&self) -> usize {
        let devices = match self.registry.drain() {
            Ok(devices) => devices,
            Err(err) => {
                warn!(error = %err, "Failed to drain device registry");
                return 0;
            }
        };
        for device in &devices {
            self.shutdown(device).await;
        }
        devices.len()
    }

    async fn shutdown(&self, device: &Device) {
        device.close().await;
        let pump = lock_pumps(&self.pumps).remove(device.port_name());
        if let Some(pump) = pump {
            if let Err(err) = pump.await {
                warn!(port = device.port_name(), error = %err, "Response pump failed");
            }
        }
        debug!(port = device.port_name(), "Device disconnected");
        self.notifications.publish(Notification::DeviceDisconnected {
            port_name: device.port_name().to_string(),
        });
    }
}

fn lock_pumps(
    pumps: &StdMutex<HashMap<String, JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
    match pumps.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn pump_responses(
    device: Arc<Device>,
    mut incoming: ChunkStream,
    parser: ResponseParser,
    notifications: NotificationBus,
    idle: Option<Duration>,
    limit: usize,
) {
    let mut assembler = ResponseAssembler::new(idle).with_limit(limit);
    loop {
        let next = match assembler.idle() {
            Some(window) if assembler.has_pending() => {
                match timeout(window, incoming.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        if let Some(response) = assembler.flush() {
                            handle_response(&device, &parser, &notifications, &response);
                        }
                        continue;
                    }
                }
            }
            _ => incoming.next().await,
        };

        let Some(chunk) = next else {
            break;
        };
        trace!(port = device.port_name(), chunk = %chunk, "Raw device output");
        notifications.publish(Notification::ConsoleLine {
            port_name: device.port_name().to_string(),
            text: chunk.clone(),
        });
        for response in assembler.push(&chunk) {
            handle_response(&device, &parser, &notifications, &response);
        }
    }

    if let Some(response) = assembler.flush() {
        handle_response(&device, &parser, &notifications, &response);
    }
    debug!(port = device.port_name(), "Response pump stopped");
}

fn handle_response(
    device: &Device,
    parser: &ResponseParser,
    notifications: &NotificationBus,
    response: &str,
) {
    let parsed = parser.parse(response);
    let Some(marker) = parsed.marker else {
        trace!(port = device.port_name(), "Response matched no marker");
        return;
    };

    let changed = device.apply(&parsed.updates);
    debug!(port = device.port_name(), marker, changed = changed.len(), "Parsed response");
    if !changed.is_empty() {
        notifications.publish(Notification::DeviceUpdated {
            port_name: device.port_name().to_string(),
            changed,
            info: device.snapshot(),
        });
    }
}
