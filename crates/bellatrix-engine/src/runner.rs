/*!
 * Script execution.
 *
 * A [`ScriptRunner`] drives one script against one device: for each step
 * it reports progress, sends the command, then waits the step's delay so
 * the delay paces the next command. Runs on different devices are fully
 * independent tasks.
 */
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use bellatrix_core::logging::component_span;
use bellatrix_devices::{ConnectionManager, Device, DeviceError, Notification};

use crate::error::{Error, Result};
use crate::script::Script;

/// Lifecycle of a script run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, not started
    Idle,
    /// Sending steps
    Running,
    /// Every step was sent
    Completed,
    /// Stopped early by cancellation or a failed step
    Aborted,
}

impl RunState {
    /// Whether the run has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }
}

/// Cooperative cancellation signal shared by a run and its controllers
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<watch::Sender<bool>>);

impl CancelToken {
    /// Create an untriggered token
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        let mut rx = self.0.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Run identifier
    pub id: Uuid,
    /// Device the run targeted
    pub port_name: String,
    /// Script that ran
    pub script: String,
    /// Steps written
    pub steps_sent: usize,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run ended
    pub finished_at: DateTime<Utc>,
}

/// Observes and cancels a run without owning its result
#[derive(Debug, Clone)]
pub struct RunControl {
    id: Uuid,
    port_name: String,
    script: String,
    cancel: CancelToken,
    state: watch::Receiver<RunState>,
}

impl RunControl {
    /// Run identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Device the run targets
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Script being run
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Current state
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Whether the run has ended
    ///
    /// A run whose task is gone without reaching a terminal state counts as
    /// finished.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal() || self.state.has_changed().is_err()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the run has ended
    pub async fn finished(&self) {
        let mut rx = self.state.clone();
        while !rx.borrow_and_update().is_terminal() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Owned handle to a spawned run
#[derive(Debug)]
pub struct RunHandle {
    control: RunControl,
    task: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    /// Run identifier
    pub fn id(&self) -> Uuid {
        self.control.id
    }

    /// Device the run targets
    pub fn port_name(&self) -> &str {
        &self.control.port_name
    }

    /// Current state
    pub fn state(&self) -> RunState {
        self.control.state()
    }

    /// Request cancellation; the run stops before its next step
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Cloneable observer for this run
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Wait for the run to end and take its outcome
    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| Error::other(format!("script run task failed: {}", e)))?
    }
}

/// Runs one script against one device
#[derive(Debug)]
pub struct ScriptRunner {
    id: Uuid,
    manager: Arc<ConnectionManager>,
    device: Arc<Device>,
    script: Script,
    cancel: CancelToken,
    state: watch::Sender<RunState>,
}

impl ScriptRunner {
    /// Create an idle runner
    pub fn new(manager: Arc<ConnectionManager>, device: Arc<Device>, script: Script) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            id: Uuid::new_v4(),
            manager,
            device,
            script,
            cancel: CancelToken::new(),
            state,
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current state
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Observer for this run
    pub fn control(&self) -> RunControl {
        RunControl {
            id: self.id,
            port_name: self.device.port_name().to_string(),
            script: self.script.name().to_string(),
            cancel: self.cancel.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Run on a new task
    pub fn spawn(self) -> RunHandle {
        let control = self.control();
        let span = component_span("script_runner", Some(self.device.port_name()));
        let task = tokio::spawn(async move { self.run().await }.instrument(span));
        RunHandle { control, task }
    }

    /// Send every step in order
    ///
    /// Cancellation yields [`Error::Aborted`]; a failed or interrupted write
    /// yields [`Error::Step`] naming the step. Either way no further steps
    /// are sent.
    pub async fn run(&self) -> Result<RunReport> {
        let started_at = Utc::now();
        let port = self.device.port_name();
        let total = self.script.len();
        self.state.send_replace(RunState::Running);
        info!(port, script = self.script.name(), steps = total, run = %self.id, "Script started");

        for (index, command) in self.script.commands().iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(self.abort(index));
            }
            if !self.device.is_connected() {
                return Err(self.fail(index, DeviceError::closed(port)));
            }

            self.progress(((index + 1) * 100 / total) as u8);

            // a write in flight always completes; cancellation takes effect after it
            if let Err(err) = self.manager.run_command(&self.device, command).await {
                return Err(self.fail(index, err));
            }
            debug!(port, step = index, instruction = command.instruction(), "Step sent");

            let is_last = index + 1 == total;
            if !command.delay().is_zero() {
                // a closed channel ends the wait early; the next step reports it
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        if !is_last {
                            return Err(self.abort(index + 1));
                        }
                    }
                    _ = self.device.closed() => {}
                    _ = tokio::time::sleep(command.delay()) => {}
                }
            }
        }

        self.progress(0);
        self.state.send_replace(RunState::Completed);
        self.finished(true, None);
        info!(port, script = self.script.name(), run = %self.id, "Script completed");

        Ok(RunReport {
            id: self.id,
            port_name: port.to_string(),
            script: self.script.name().to_string(),
            steps_sent: total,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn progress(&self, percent: u8) {
        self.manager.notifications().publish(Notification::ScriptProgress {
            port_name: self.device.port_name().to_string(),
            script: self.script.name().to_string(),
            percent,
        });
    }

    fn finished(&self, completed: bool, error: Option<String>) {
        self.manager.notifications().publish(Notification::ScriptFinished {
            port_name: self.device.port_name().to_string(),
            script: self.script.name().to_string(),
            completed,
            error,
        });
    }

    fn abort(&self, steps_sent: usize) -> Error {
        let err = Error::aborted(self.device.port_name(), self.script.name(), steps_sent);
        info!(port = self.device.port_name(), steps_sent, run = %self.id, "Script cancelled");
        self.state.send_replace(RunState::Aborted);
        self.finished(false, Some(err.to_string()));
        err
    }

    fn fail(&self, step: usize, source: DeviceError) -> Error {
        let err = Error::step(self.device.port_name(), self.script.name(), step, source);
        warn!(port = self.device.port_name(), error = %err, run = %self.id, "Script aborted");
        self.state.send_replace(RunState::Aborted);
        self.finished(false, Some(err.to_string()));
        err
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use bellatrix_devices::mock::MockPortProvider;
    use bellatrix_devices::{Command, NotificationBus};
    use tokio::time::Instant;

    async fn setup(ports: &[&str]) -> (Arc<MockPortProvider>, Arc<ConnectionManager>) {
        let provider = Arc::new(MockPortProvider::new(ports.iter().copied()));
        let manager = Arc::new(ConnectionManager::new(provider.clone(), NotificationBus::new()));
        manager.discover().await.unwrap();
        (provider, manager)
    }

    fn three_steps() -> Script {
        Script::new("Info", "Read identity")
            .with_command(Command::new("AT+DEVCONINFO", "Device info").with_delay(100))
            .with_command(Command::new("AT+VERSNAME=3,2,3", "Android version").with_delay(200))
            .with_command(Command::new("AT+REACTIVE=1,0,0", "Activation").with_delay(50))
    }

    fn assert_paced(elapsed: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "elapsed {:?}, expected {:?}",
            elapsed,
            expected
        );
    }

    fn progress_for(notifications: &mut tokio::sync::broadcast::Receiver<Notification>, port: &str) -> Vec<u8> {
        let mut percents = Vec::new();
        while let Ok(notification) = notifications.try_recv() {
            if let Notification::ScriptProgress { port_name, percent, .. } = notification {
                if port_name == port {
                    percents.push(percent);
                }
            }
        }
        percents
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_writes_and_pacing() {
        let (provider, manager) = setup(&["COM1"]).await;
        let mut rx = manager.notifications().subscribe();
        let device = manager.device("COM1").unwrap();

        let started = Instant::now();
        let runner = ScriptRunner::new(manager.clone(), device, three_steps());
        let report = runner.run().await.unwrap();

        assert_eq!(report.steps_sent, 3);
        assert_eq!(runner.state(), RunState::Completed);
        assert_paced(started.elapsed(), 350);
        assert_eq!(
            provider.channel("COM1").unwrap().instructions(),
            vec!["AT+DEVCONINFO", "AT+VERSNAME=3,2,3", "AT+REACTIVE=1,0,0"]
        );
        assert_eq!(progress_for(&mut rx, "COM1"), vec![33, 66, 100, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_follows_each_send() {
        let (provider, manager) = setup(&["COM1"]).await;
        let device = manager.device("COM1").unwrap();
        let handle = ScriptRunner::new(manager.clone(), device, three_steps()).spawn();
        let channel = provider.channel("COM1").unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(channel.instructions().len(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.instructions().len(), 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(channel.instructions().len(), 3);
        handle.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_isolate_failures() {
        let (provider, manager) = setup(&["COM1", "COM2"]).await;
        provider.channel("COM1").unwrap().fail_writes_after(1);

        let a = ScriptRunner::new(manager.clone(), manager.device("COM1").unwrap(), three_steps()).spawn();
        let b = ScriptRunner::new(manager.clone(), manager.device("COM2").unwrap(), three_steps()).spawn();

        let started = Instant::now();
        let failed = a.wait().await.unwrap_err();
        assert!(matches!(
            failed,
            Error::Step { ref port, step: 1, source: DeviceError::Write { .. }, .. } if port == "COM1"
        ));

        let report = b.wait().await.unwrap();
        assert_eq!(report.steps_sent, 3);
        assert_paced(started.elapsed(), 350);
        assert_eq!(provider.channel("COM1").unwrap().instructions(), vec!["AT+DEVCONINFO"]);
        assert_eq!(
            provider.channel("COM2").unwrap().instructions(),
            vec!["AT+DEVCONINFO", "AT+VERSNAME=3,2,3", "AT+REACTIVE=1,0,0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_before_next_step() {
        let (provider, manager) = setup(&["COM1"]).await;
        let mut rx = manager.notifications().subscribe();
        let handle = ScriptRunner::new(manager.clone(), manager.device("COM1").unwrap(), three_steps()).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), RunState::Running);
        handle.cancel();

        let control = handle.control();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, Error::Aborted { steps_sent: 1, .. }));
        assert!(err.is_cancellation());
        assert_eq!(control.state(), RunState::Aborted);
        assert_eq!(provider.channel("COM1").unwrap().instructions(), vec!["AT+DEVCONINFO"]);

        let progress = progress_for(&mut rx, "COM1");
        assert_eq!(progress, vec![33]);
    }

    #[tokio::test]
    async fn test_cancel_before_start_sends_nothing() {
        let (provider, manager) = setup(&["COM1"]).await;
        let cancel = CancelToken::new();
        cancel.cancel();
        let runner = ScriptRunner::new(manager.clone(), manager.device("COM1").unwrap(), three_steps())
            .with_cancel_token(cancel);
        assert!(matches!(runner.run().await, Err(Error::Aborted { steps_sent: 0, .. })));
        assert!(provider.channel("COM1").unwrap().instructions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_channel_aborts_with_connection_closed() {
        let (provider, manager) = setup(&["COM1"]).await;
        let handle = ScriptRunner::new(manager.clone(), manager.device("COM1").unwrap(), three_steps()).spawn();

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.disconnect("COM1").await.unwrap();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Step { step: 1, source: DeviceError::ConnectionClosed { .. }, .. }
        ));
        assert!(err.is_cancellation());
        assert_eq!(provider.channel("COM1").unwrap().instructions(), vec!["AT+DEVCONINFO"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_pending_write() {
        let (provider, manager) = setup(&["COM1"]).await;
        provider.channel("COM1").unwrap().set_write_latency(Duration::from_secs(30));
        let handle = ScriptRunner::new(manager.clone(), manager.device("COM1").unwrap(), three_steps()).spawn();

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.device("COM1").unwrap().close().await;

        assert!(matches!(
            handle.wait().await,
            Err(Error::Step { step: 0, source: DeviceError::ConnectionClosed { .. }, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_write_keeps_the_step() {
        let (provider, manager) = setup(&["COM1"]).await;
        let channel = provider.channel("COM1").unwrap();
        channel.set_write_latency(Duration::from_millis(500));
        let handle = ScriptRunner::new(manager.clone(), manager.device("COM1").unwrap(), three_steps()).spawn();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(channel.instructions().is_empty());
        handle.cancel();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, Error::Aborted { steps_sent: 1, .. }));
        assert_eq!(channel.instructions(), vec!["AT+DEVCONINFO"]);
    }

    #[tokio::test]
    async fn test_empty_script_completes() {
        let (provider, manager) = setup(&["COM1"]).await;
        let mut rx = manager.notifications().subscribe();
        let runner = ScriptRunner::new(manager.clone(), manager.device("COM1").unwrap(), Script::new("Empty", ""));
        let report = runner.run().await.unwrap();
        assert_eq!(report.steps_sent, 0);
        assert_eq!(progress_for(&mut rx, "COM1"), vec![0]);
        assert!(provider.channel("COM1").unwrap().instructions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_notification() {
        let (_provider, manager) = setup(&["COM1"]).await;
        let mut rx = manager.notifications().subscribe();
        let handle = ScriptRunner::new(manager.clone(), manager.device("COM1").unwrap(), three_steps()).spawn();
        let control = handle.control();
        control.finished().await;
        assert!(control.is_finished());
        handle.wait().await.unwrap();

        let mut finished = None;
        while let Ok(notification) = rx.try_recv() {
            if let Notification::ScriptFinished { completed, error, .. } = notification {
                finished = Some((completed, error));
            }
        }
        assert_eq!(finished, Some((true, None)));
    }
}
