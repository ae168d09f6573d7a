//! Subcommand handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use tokio::task::JoinHandle;
use tracing::warn;

use bellatrix_core::config::{ConfigBuilder, SharedConfig, ENV_PREFIX};
use bellatrix_core::event::recv_skipping_lag;
use bellatrix_devices::{
    Command, DeviceField, DeviceInfo, Notification, PortProvider, SerialPortProvider,
};
use bellatrix_engine::{Engine, Error as EngineError, JsonFileStore, RunControl, RunHandle, Script};

use crate::{dry_run, Cli, CommandAction, ScriptAction};

/// Loaded configuration plus the engine built from it
pub struct Context {
    config: SharedConfig,
    engine: Engine,
    json: bool,
}

impl Context {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = ConfigBuilder::new().with_environment_prefix(ENV_PREFIX);
        if let Some(path) = &cli.config {
            builder = builder.with_config_file(path);
        }
        let mut config = builder.build().context("failed to load configuration")?;
        if let Some(level) = &cli.log_level {
            config.logging.level = level.clone();
        }
        bellatrix_core::init_with_config(&config)?;

        let provider: Arc<dyn PortProvider> = if cli.mock.is_empty() {
            Arc::new(SerialPortProvider::new(config.serial.clone()))
        } else {
            dry_run::provider(&cli.mock)
        };
        let store = Arc::new(JsonFileStore::new(config.engine.store_path()));
        let engine = Engine::from_config(&config, provider, store);

        Ok(Self {
            config: config.into(),
            engine,
            json: cli.json,
        })
    }

    /// Print notifications until the returned task is aborted
    fn watch_notifications(&self) -> JoinHandle<()> {
        let mut rx = self.engine.subscribe();
        let json = self.json;
        tokio::spawn(async move {
            while let Ok(notification) = recv_skipping_lag(&mut rx).await {
                print_notification(&notification, json);
            }
        })
    }
}

fn print_notification(notification: &Notification, json: bool) {
    if json {
        match serde_json::to_string(notification) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to encode notification: {}", e),
        }
        return;
    }

    let port = notification.port_name();
    match notification {
        Notification::DeviceDiscovered(_) => println!("[{}] connected", port),
        Notification::DeviceUpdated { changed, .. } => {
            let names: Vec<_> = changed.iter().map(DeviceField::name).collect();
            println!("[{}] updated {}", port, names.join(", "));
        }
        Notification::ConsoleLine { text, .. } => {
            for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
                println!("[{}] < {}", port, line);
            }
        }
        Notification::ScriptProgress { script, percent, .. } => {
            println!("[{}] {} {}%", port, script, percent)
        }
        Notification::ScriptFinished {
            script,
            completed,
            error,
            ..
        } => match (completed, error) {
            (true, _) => println!("[{}] {} completed", port, script),
            (false, Some(error)) => println!("[{}] {} stopped: {}", port, script, error),
            (false, None) => println!("[{}] {} stopped", port, script),
        },
        Notification::DiscoveryWarning { message, .. } => {
            println!("[{}] warning: {}", port, message)
        }
        Notification::DeviceDisconnected { .. } => println!("[{}] disconnected", port),
    }
}

fn print_device(info: &DeviceInfo) {
    println!("{}", info.port_name);
    for field in DeviceField::ALL {
        let value = info.get(field).unwrap_or_else(|| "-".to_string());
        println!("  {:<16} {}", field.name(), value);
    }
}

pub async fn cmd_ports(ctx: &Context) -> Result<()> {
    let provider = ctx.engine.manager().provider();
    let ports = provider.available_ports().await?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

pub async fn cmd_discover(ctx: &Context, queries: &[String], wait_ms: u64) -> Result<()> {
    let printer = ctx.watch_notifications();
    let report = ctx.engine.refresh_devices().await?;
    let ports = report.port_names();
    if ports.is_empty() {
        printer.abort();
        println!("No devices connected");
        return Ok(());
    }

    for query in queries {
        for (port, result) in ctx.engine.run_command(&ports, query).await? {
            if let Err(e) = result {
                eprintln!("[{}] {}: {}", port, query, e);
            }
        }
    }
    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
    printer.abort();

    for info in ctx.engine.manager().snapshots()? {
        print_device(&info);
    }
    ctx.engine.manager().disconnect_all().await;
    Ok(())
}

pub async fn cmd_send(ctx: &Context, port: &str, text: &str, wait_ms: u64) -> Result<()> {
    let printer = ctx.watch_notifications();
    ctx.engine.refresh_devices().await?;
    ctx.engine.manager().send_raw(port, text).await?;
    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
    printer.abort();

    print_device(&ctx.engine.manager().snapshot(port)?);
    ctx.engine.manager().disconnect_all().await;
    Ok(())
}

pub async fn cmd_run(ctx: &Context, script: &str, ports: Vec<String>) -> Result<()> {
    let printer = ctx.watch_notifications();
    let report = ctx.engine.refresh_devices().await?;
    let ports = if ports.is_empty() { report.port_names() } else { ports };
    if ports.is_empty() {
        printer.abort();
        bail!("no devices connected");
    }

    let handles = ctx.engine.run_script(script, &ports).await?;
    let controls: Vec<RunControl> = handles.iter().map(RunHandle::control).collect();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling runs");
            for control in &controls {
                control.cancel();
            }
        }
    });

    let total = handles.len();
    let mut failed = 0;
    for handle in handles {
        let port = handle.port_name().to_string();
        match handle.wait().await {
            Ok(report) => println!("[{}] {} step(s) sent", port, report.steps_sent),
            Err(e) => {
                failed += 1;
                eprintln!("[{}] {}", port, e);
            }
        }
    }
    interrupt.abort();
    printer.abort();
    ctx.engine.manager().disconnect_all().await;

    if failed > 0 {
        bail!("{} of {} run(s) did not complete", failed, total);
    }
    Ok(())
}

pub async fn cmd_commands(ctx: &Context, action: CommandAction) -> Result<()> {
    let store = ctx.engine.store();
    match action {
        CommandAction::List => {
            for command in store.load_commands().await? {
                println!(
                    "{:<24} {:>6}ms  {}",
                    command.instruction(),
                    command.delay_ms(),
                    command.description()
                );
            }
        }
        CommandAction::Add {
            instruction,
            description,
            delay_ms,
        } => {
            store
                .add_command(Command::new(instruction, description).with_delay(delay_ms))
                .await?;
        }
        CommandAction::Remove { instruction } => {
            if !store.remove_command(&instruction).await? {
                bail!("no saved command '{}'", instruction);
            }
        }
    }
    Ok(())
}

pub async fn cmd_scripts(ctx: &Context, action: ScriptAction) -> Result<()> {
    let store = ctx.engine.store();
    match action {
        ScriptAction::List => {
            for script in store.load_scripts().await? {
                println!("{:<24} {:>3} step(s)  {}", script.name(), script.len(), script.description());
            }
        }
        ScriptAction::Show { name } => {
            let script = store.script(&name).await?;
            println!("{}: {}", script.name(), script.description());
            for (index, command) in script.commands().iter().enumerate() {
                println!(
                    "  {:>2}. {:<24} {:>6}ms  {}",
                    index + 1,
                    command.instruction(),
                    command.delay_ms(),
                    command.description()
                );
            }
        }
        ScriptAction::Add { name, description } => {
            match store.script(&name).await {
                Ok(_) => return Err(EngineError::already_exists(format!("script '{}'", name)).into()),
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            store.add_script(Script::new(name, description)).await?;
        }
        ScriptAction::Remove { name } => {
            if !store.remove_script(&name).await? {
                bail!("no saved script '{}'", name);
            }
        }
        ScriptAction::AddStep {
            name,
            instruction,
            description,
            delay_ms,
        } => {
            let script = match instruction {
                Some(instruction) => {
                    let command = Command::new(instruction, description).with_delay(delay_ms);
                    ctx.engine.append_script_command(&name, command).await?
                }
                None => ctx.engine.append_placeholder_step(&name).await?,
            };
            println!("{} now has {} step(s)", script.name(), script.len());
        }
        ScriptAction::RemoveStep {
            name,
            instruction,
            description,
            delay_ms,
        } => {
            let command = Command::new(instruction, description).with_delay(delay_ms);
            let removed = ctx.engine.remove_script_command(&name, &command).await?;
            println!("Removed {} step(s) from {}", removed, name);
        }
    }
    Ok(())
}

pub fn cmd_config_show(ctx: &Context) -> Result<()> {
    print!("{}", ctx.config.get().to_toml()?);
    Ok(())
}
