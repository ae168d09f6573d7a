/*!
 * Engine facade used by callers (CLI, UI).
 *
 * Ties the connection manager, the command store and the set of active
 * script runs together. At most one run is active per device, and a
 * script cannot be edited while any run of it is active.
 */
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::Mutex;
use tracing::{debug, info, Instrument};

use bellatrix_core::config::Config;
use bellatrix_core::event::EventReceiver;
use bellatrix_core::logging::operation_span;
use bellatrix_devices::{
    Command, ConnectionManager, DeviceError, DiscoveryReport, Notification, NotificationBus,
    PortProvider,
};

use crate::error::{Error, Result};
use crate::runner::{RunControl, RunHandle, ScriptRunner};
use crate::script::Script;
use crate::store::CommandStore;

/// Instruction of a freshly appended placeholder step
pub const PLACEHOLDER_INSTRUCTION: &str = "ENTER COMMAND";
/// Description of a freshly appended placeholder step
pub const PLACEHOLDER_DESCRIPTION: &str = "ENTER DESCRIPTION";

const DEFAULT_STEP_DELAY_MS: u64 = 1000;

/// Per-port outcome of a fan-out command
pub type CommandResults = Vec<(String, std::result::Result<(), DeviceError>)>;

/// Device command and script engine
#[derive(Debug)]
pub struct Engine {
    manager: Arc<ConnectionManager>,
    store: Arc<dyn CommandStore>,
    runs: StdMutex<Vec<RunControl>>,
    script_lock: Mutex<()>,
    default_step_delay_ms: u64,
}

impl Engine {
    /// Create an engine over an existing manager and store
    pub fn new(manager: Arc<ConnectionManager>, store: Arc<dyn CommandStore>) -> Self {
        Self {
            manager,
            store,
            runs: StdMutex::new(Vec::new()),
            script_lock: Mutex::new(()),
            default_step_delay_ms: DEFAULT_STEP_DELAY_MS,
        }
    }

    /// Build the manager and engine from configuration
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn PortProvider>,
        store: Arc<dyn CommandStore>,
    ) -> Self {
        let notifications = NotificationBus::with_capacity(config.engine.notification_capacity);
        let manager = ConnectionManager::from_config(provider, &config.serial, notifications);
        Self::new(Arc::new(manager), store)
            .with_default_step_delay(config.engine.default_step_delay_ms)
    }

    /// Delay given to placeholder steps
    pub fn with_default_step_delay(mut self, delay_ms: u64) -> Self {
        self.default_step_delay_ms = delay_ms;
        self
    }

    /// Connection manager
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Command store
    pub fn store(&self) -> &Arc<dyn CommandStore> {
        &self.store
    }

    /// Subscribe to notifications
    pub fn subscribe(&self) -> EventReceiver<Notification> {
        self.manager.notifications().subscribe()
    }

    /// Cancel every run, wait for them to stop, then rediscover devices
    pub async fn refresh_devices(&self) -> Result<DiscoveryReport> {
        async {
            // no run may start or script change until the new ports are up
            let _guard = self.script_lock.lock().await;
            let stopping = self.active_runs();
            for run in &stopping {
                run.cancel();
            }
            for run in &stopping {
                run.finished().await;
            }
            if !stopping.is_empty() {
                debug!(runs = stopping.len(), "Stopped active runs before discovery");
            }
            self.prune();
            Ok::<_, Error>(self.manager.discover().await?)
        }
        .instrument(operation_span("refresh_devices", "engine"))
        .await
    }

    /// Send an ad hoc instruction to several devices
    pub async fn run_command(&self, ports: &[String], instruction: &str) -> Result<CommandResults> {
        let command = Command::raw(instruction);
        command.validate()?;
        Ok(self.manager.run_command_on(ports, &command).await)
    }

    /// Send a saved command to several devices
    pub async fn run_saved_command(
        &self,
        ports: &[String],
        instruction: &str,
    ) -> Result<CommandResults> {
        let command = self.store.command(instruction).await?;
        Ok(self.manager.run_command_on(ports, &command).await)
    }

    /// Start a saved script on each port
    ///
    /// Nothing starts unless every port has a connected, idle device.
    /// Naming a port twice counts as busy.
    pub async fn run_script(&self, name: &str, ports: &[String]) -> Result<Vec<RunHandle>> {
        let _guard = self.script_lock.lock().await;
        let script = self.store.script(name).await?;
        script.validate()?;

        let mut seen = HashSet::with_capacity(ports.len());
        if let Some(port) = ports.iter().find(|port| !seen.insert(port.as_str())) {
            return Err(Error::device_busy(port));
        }

        let mut devices = Vec::with_capacity(ports.len());
        for port in ports {
            let device = self.manager.device(port)?;
            if !device.is_connected() {
                return Err(DeviceError::closed(port.as_str()).into());
            }
            devices.push(device);
        }

        let mut runs = self.lock_runs();
        runs.retain(|run| !run.is_finished());
        for port in ports {
            if runs.iter().any(|run| run.port_name() == port) {
                return Err(Error::device_busy(port));
            }
        }

        let handles: Vec<RunHandle> = devices
            .into_iter()
            .map(|device| {
                ScriptRunner::new(Arc::clone(&self.manager), device, script.clone()).spawn()
            })
            .collect();
        runs.extend(handles.iter().map(RunHandle::control));

        info!(script = name, devices = handles.len(), "Script runs started");
        Ok(handles)
    }

    /// Cancel active runs on a port, returning how many were signalled
    pub fn cancel_runs(&self, port: &str) -> usize {
        let runs = self.active_runs();
        let mut cancelled = 0;
        for run in runs.iter().filter(|run| run.port_name() == port) {
            run.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Cancel every active run
    pub fn cancel_all(&self) -> usize {
        let runs = self.active_runs();
        for run in &runs {
            run.cancel();
        }
        runs.len()
    }

    /// Runs that have not ended yet
    pub fn active_runs(&self) -> Vec<RunControl> {
        self.lock_runs()
            .iter()
            .filter(|run| !run.is_finished())
            .cloned()
            .collect()
    }

    /// Append a step to a saved script
    pub async fn append_script_command(&self, name: &str, command: Command) -> Result<Script> {
        command.validate()?;
        self.edit_script(name, |script| {
            script.add_command(command);
            Ok(())
        })
        .await
        .map(|(script, _)| script)
    }

    /// Append a placeholder step to be edited later
    pub async fn append_placeholder_step(&self, name: &str) -> Result<Script> {
        let placeholder = Command::new(PLACEHOLDER_INSTRUCTION, PLACEHOLDER_DESCRIPTION)
            .with_delay(self.default_step_delay_ms);
        self.append_script_command(name, placeholder).await
    }

    /// Remove every step matching `command` exactly; returns the count
    pub async fn remove_script_command(&self, name: &str, command: &Command) -> Result<usize> {
        self.edit_script(name, |script| Ok(script.remove_command(command)))
            .await
            .map(|(_, removed)| removed)
    }

    async fn edit_script<F, T>(&self, name: &str, edit: F) -> Result<(Script, T)>
    where
        F: FnOnce(&mut Script) -> Result<T>,
    {
        let _guard = self.script_lock.lock().await;
        if self.active_runs().iter().any(|run| run.script() == name) {
            return Err(Error::script_busy(name));
        }

        let mut script = self.store.script(name).await?;
        let outcome = edit(&mut script)?;
        self.store.add_script(script.clone()).await?;
        debug!(script = name, steps = script.len(), "Script edited");
        Ok((script, outcome))
    }

    fn prune(&self) {
        self.lock_runs().retain(|run| !run.is_finished());
    }

    fn lock_runs(&self) -> MutexGuard<'_, Vec<RunControl>> {
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
