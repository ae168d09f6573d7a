//! bellatrix - command-line caller for the Bellatrix device engine.
//!
//! Discovers attached devices over serial, sends AT commands, runs saved
//! scripts and edits the command/script store.

mod commands;
mod dry_run;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bellatrix")]
#[command(about = "Manage serial AT-command devices", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overrides the configured level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Use in-memory devices on these ports instead of real hardware
    #[arg(long, global = true, value_delimiter = ',')]
    mock: Vec<String>,

    /// Print notifications as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports present on the host
    Ports,

    /// Connect every port and show device telemetry
    Discover {
        /// Instructions to send to every device after connecting
        #[arg(long)]
        query: Vec<String>,

        /// How long to listen for responses
        #[arg(long, default_value_t = 1500)]
        wait_ms: u64,
    },

    /// Send a raw line to one device
    Send {
        /// Target port
        #[arg(long)]
        port: String,

        /// Text to send
        text: String,

        /// How long to listen for the response
        #[arg(long, default_value_t = 1500)]
        wait_ms: u64,
    },

    /// Run a saved script
    Run {
        /// Script name
        script: String,

        /// Target ports, every connected device when omitted
        #[arg(long)]
        port: Vec<String>,
    },

    /// Manage saved commands
    #[command(subcommand)]
    Commands(CommandAction),

    /// Manage saved scripts
    #[command(subcommand)]
    Scripts(ScriptAction),

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigAction),
}

#[derive(Subcommand)]
enum CommandAction {
    /// List saved commands
    List,

    /// Save a command
    Add {
        /// AT instruction
        instruction: String,

        /// Description
        #[arg(long, default_value = "")]
        description: String,

        /// Delay after sending, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },

    /// Remove a saved command
    Remove {
        /// AT instruction
        instruction: String,
    },
}

#[derive(Subcommand)]
enum ScriptAction {
    /// List saved scripts
    List,

    /// Show a script's steps
    Show {
        /// Script name
        name: String,
    },

    /// Create an empty script
    Add {
        /// Script name
        name: String,

        /// Description
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Remove a script
    Remove {
        /// Script name
        name: String,
    },

    /// Append a step, or a placeholder when no instruction is given
    AddStep {
        /// Script name
        name: String,

        /// AT instruction
        instruction: Option<String>,

        /// Description
        #[arg(long, default_value = "")]
        description: String,

        /// Delay after sending, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },

    /// Remove every step matching instruction, description and delay
    RemoveStep {
        /// Script name
        name: String,

        /// AT instruction
        instruction: String,

        /// Description
        #[arg(long, default_value = "")]
        description: String,

        /// Delay after sending, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = commands::Context::load(&cli)?;

    match cli.command {
        Commands::Ports => commands::cmd_ports(&ctx).await?,
        Commands::Discover { query, wait_ms } => {
            commands::cmd_discover(&ctx, &query, wait_ms).await?
        }
        Commands::Send {
            port,
            text,
            wait_ms,
        } => commands::cmd_send(&ctx, &port, &text, wait_ms).await?,
        Commands::Run { script, port } => commands::cmd_run(&ctx, &script, port).await?,
        Commands::Commands(action) => commands::cmd_commands(&ctx, action).await?,
        Commands::Scripts(action) => commands::cmd_scripts(&ctx, action).await?,
        Commands::Config(ConfigAction::Show) => commands::cmd_config_show(&ctx)?,
    }

    Ok(())
}
