/*!
 * Saved commands and scripts.
 *
 * The engine reads and writes definitions through [`CommandStore`]. Two
 * implementations ship: an in-memory store and a JSON file store that
 * rewrites the whole document atomically on every change.
 */
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use bellatrix_devices::Command;

use crate::error::{Error, Result};
use crate::script::Script;

/// Source and sink of command and script definitions
#[async_trait]
pub trait CommandStore: Send + Sync + std::fmt::Debug {
    /// All saved commands in insertion order
    async fn load_commands(&self) -> Result<Vec<Command>>;

    /// All saved scripts in insertion order
    async fn load_scripts(&self) -> Result<Vec<Script>>;

    /// Save a command, replacing one with the same instruction
    async fn add_command(&self, command: Command) -> Result<()>;

    /// Save a script, replacing one with the same name
    async fn add_script(&self, script: Script) -> Result<()>;

    /// Remove the command with this instruction; false if absent
    async fn remove_command(&self, instruction: &str) -> Result<bool>;

    /// Remove the script with this name; false if absent
    async fn remove_script(&self, name: &str) -> Result<bool>;

    /// Look up a command by instruction
    async fn command(&self, instruction: &str) -> Result<Command> {
        self.load_commands()
            .await?
            .into_iter()
            .find(|command| command.instruction() == instruction)
            .ok_or_else(|| Error::not_found(format!("command '{}'", instruction)))
    }

    /// Look up a script by name
    async fn script(&self, name: &str) -> Result<Script> {
        self.load_scripts()
            .await?
            .into_iter()
            .find(|script| script.name() == name)
            .ok_or_else(|| Error::not_found(format!("script '{}'", name)))
    }
}

/// Serialized form of a store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDocument {
    /// Saved commands
    #[serde(default)]
    pub commands: Vec<Command>,
    /// Saved scripts
    #[serde(default)]
    pub scripts: Vec<Script>,
}

impl StoreDocument {
    fn upsert_command(&mut self, command: Command) -> Result<()> {
        command.validate()?;
        match self
            .commands
            .iter_mut()
            .find(|saved| saved.instruction() == command.instruction())
        {
            Some(saved) => *saved = command,
            None => self.commands.push(command),
        }
        Ok(())
    }

    fn upsert_script(&mut self, script: Script) -> Result<()> {
        script.validate()?;
        match self.scripts.iter_mut().find(|saved| saved.name() == script.name()) {
            Some(saved) => *saved = script,
            None => self.scripts.push(script),
        }
        Ok(())
    }

    fn remove_command(&mut self, instruction: &str) -> bool {
        let before = self.commands.len();
        self.commands.retain(|command| command.instruction() != instruction);
        self.commands.len() != before
    }

    fn remove_script(&mut self, name: &str) -> bool {
        let before = self.scripts.len();
        self.scripts.retain(|script| script.name() != name);
        self.scripts.len() != before
    }
}

/// Store kept in memory only
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<StoreDocument>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-filled with a document
    pub fn with_document(document: StoreDocument) -> Self {
        Self { document: Mutex::new(document) }
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn load_commands(&self) -> Result<Vec<Command>> {
        Ok(self.document.lock().await.commands.clone())
    }

    async fn load_scripts(&self) -> Result<Vec<Script>> {
        Ok(self.document.lock().await.scripts.clone())
    }

    async fn add_command(&self, command: Command) -> Result<()> {
        self.document.lock().await.upsert_command(command)
    }

    async fn add_script(&self, script: Script) -> Result<()> {
        self.document.lock().await.upsert_script(script)
    }

    async fn remove_command(&self, instruction: &str) -> Result<bool> {
        Ok(self.document.lock().await.remove_command(instruction))
    }

    async fn remove_script(&self, name: &str) -> Result<bool> {
        Ok(self.document.lock().await.remove_script(name))
    }
}

/// Store persisted as a pretty-printed JSON document
///
/// A missing file reads as an empty store. Writes go to a sibling temp
/// file which is then renamed over the document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Create a store backed by this file
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<StoreDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(StoreDocument::default()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::store(format!("failed to parse {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Store file missing, starting empty");
                Ok(StoreDocument::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, document: &StoreDocument) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            path = %self.path.display(),
            commands = document.commands.len(),
            scripts = document.scripts.len(),
            "Store saved"
        );
        Ok(())
    }

    async fn update<F, T>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut StoreDocument) -> Result<T> + Send,
        T: Send,
    {
        let _guard = self.lock.lock().await;
        let mut document = self.read().await?;
        let outcome = change(&mut document)?;
        self.write(&document).await?;
        Ok(outcome)
    }
}

#[async_trait]
impl CommandStore for JsonFileStore {
    async fn load_commands(&self) -> Result<Vec<Command>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.commands)
    }

    async fn load_scripts(&self) -> Result<Vec<Script>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.scripts)
    }

    async fn add_command(&self, command: Command) -> Result<()> {
        self.update(|document| document.upsert_command(command)).await
    }

    async fn add_script(&self, script: Script) -> Result<()> {
        self.update(|document| document.upsert_script(script)).await
    }

    async fn remove_command(&self, instruction: &str) -> Result<bool> {
        self.update(|document| Ok(document.remove_command(instruction))).await
    }

    async fn remove_script(&self, name: &str) -> Result<bool> {
        self.update(|document| Ok(document.remove_script(name))).await
    }
}
