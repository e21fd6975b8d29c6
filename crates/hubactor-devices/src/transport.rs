//! Line-oriented device transport.
//!
//! A transport moves lines of text to and from one device. It knows nothing
//! about commands; [`crate::Device`] builds command handling on top of it.
//!
//! ```text
//!   Device                 Transport              hardware
//! ┌──────────┐  write_line ┌───────────┐  TCP    ┌──────────┐
//! │ pending  │────────────▶│           │────────▶│          │
//! │ commands │◀────────────│  reads /  │◀────────│          │
//! └──────────┘  read cb    │  states   │         └──────────┘
//!                          └───────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use hubactor_core::callbacks::{Callback, CallbackId};

use crate::error::TransportError;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Connection attempt or link failed
    Failed,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Disconnected => "Disconnected",
            TransportState::Connecting => "Connecting",
            TransportState::Connected => "Connected",
            TransportState::Disconnecting => "Disconnecting",
            TransportState::Failed => "Failed",
        }
    }

    /// Fully connected or fully disconnected.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            TransportState::Connected | TransportState::Disconnected | TransportState::Failed
        )
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport trait - moves lines to and from one device.
///
/// Read and state callbacks may be called from any task; they must not block.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short description, e.g. `host:port`.
    fn describe(&self) -> String;

    fn state(&self) -> TransportState;

    /// Open the connection.
    async fn connect(&self) -> Result<()>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;

    /// Write one line; the line terminator is added by the transport.
    fn write_line(&self, line: &str) -> Result<()>;

    /// Register for every line read from the device (terminator removed).
    fn add_read_callback(&self, callback: Callback<str>) -> CallbackId;

    fn remove_read_callback(&self, id: CallbackId) -> bool;

    /// Register for every connection state change.
    fn add_state_callback(&self, callback: Callback<TransportState>) -> CallbackId;

    fn remove_state_callback(&self, id: CallbackId) -> bool;

    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Fully connected or fully disconnected.
    fn is_done(&self) -> bool {
        self.state().is_done()
    }
}

/// Shared transport trait object.
pub type DynTransport = Arc<dyn Transport>;
