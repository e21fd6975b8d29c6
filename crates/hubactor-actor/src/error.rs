//! Actor error types.

use hubactor_core::{CommandError, ConfigError, QueueError};
use hubactor_devices::DeviceError;

/// Actor construction and command handling errors.
///
/// Returned by handlers, a handler error fails the user command with the
/// error text.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    /// Verb registered twice (or clashing with a device name)
    #[error("duplicate verb {0:?}")]
    DuplicateVerb(String),

    #[error("invalid verb {0:?}")]
    InvalidVerb(String),

    #[error("{0} takes no arguments")]
    NoArgsAllowed(String),

    #[error("forwarded verb {verb:?} names unknown slot {slot:?}")]
    UnknownSlot { verb: String, slot: String },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for actor operations.
pub type Result<T> = std::result::Result<T, ActorError>;
