/*!
 * Prelude module for Bellatrix Core.
 *
 * Re-exports the types most callers need in one import.
 */

pub use crate::error::{Error, Result};

pub use crate::event::{recv_skipping_lag, EventBus, EventReceiver, SharedEventBus};

pub use crate::config::{Config, ConfigBuilder, SharedConfig};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::init;
