/*!
 * Prelude module for devlink core.
 *
 * Re-exports the types and helpers most devlink code needs.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{BoundedString, Id};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{cancel_after, millis_to_duration, with_retry, with_timeout, Deadline};

// Re-export cancellation
pub use tokio_util::sync::CancellationToken;

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
