//! Devices for hub actors.
//!
//! Provides:
//! - Line-oriented [`Transport`] trait and an in-memory [`MockTransport`]
//! - [`Device`]: command issue and connect/disconnect sequencing
//! - [`DeviceSet`]: named slots with command fan-out
//! - [`DeviceCollection`]: devices by unique name

pub mod collection;
pub mod device;
pub mod device_set;
pub mod error;
pub mod mock;
pub mod transport;

// Re-exports
pub use collection::DeviceCollection;

pub use device::{
    CONNECTION_LOST_MSG, ConnState, DISCONNECTED_MSG, Device, DeviceBuilder, DeviceHandler,
};

pub use device_set::{CallFunc, DevCmdInfo, DeviceSet, NOT_AVAILABLE, RunCmdDict, SlotCmd};

pub use error::{DeviceError, TransportError};

pub use mock::{EchoHandler, MockTransport, echo_reply};

pub use transport::{DynTransport, Transport, TransportState};
