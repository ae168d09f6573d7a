/*!
 * Bellatrix Engine
 *
 * Saved commands and scripts, the per-device script runner, and the
 * engine facade that front-ends use to drive connected devices.
 */

#![warn(missing_docs)]

// Re-export core types
pub use bellatrix_core::prelude;

pub mod engine;
pub mod error;
pub mod runner;
pub mod script;
pub mod store;

pub use engine::{CommandResults, Engine, PLACEHOLDER_DESCRIPTION, PLACEHOLDER_INSTRUCTION};
pub use error::{Error, Result};
pub use runner::{CancelToken, RunControl, RunHandle, RunReport, RunState, ScriptRunner};
pub use script::Script;
pub use store::{CommandStore, JsonFileStore, MemoryStore, StoreDocument};

/// Bellatrix engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
