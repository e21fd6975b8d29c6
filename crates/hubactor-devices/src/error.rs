//! Error types for devices and transports.

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Transport is not connected.
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Misuse of a device, device collection or device set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("one or more slots is unknown: {}", .0.join(", "))]
    UnknownSlots(Vec<String>),

    #[error("one or more slots is empty: {}", .0.join(", "))]
    EmptySlots(Vec<String>),

    #[error("names in slot list are not unique: {0}")]
    DuplicateSlot(String),

    #[error("{devices} devices given for {slots} slots")]
    LengthMismatch { slots: usize, devices: usize },

    #[error("expected {expected} bools but got {got}")]
    BoolListLength { expected: usize, got: usize },

    #[error("duplicate device name {0:?}")]
    DuplicateDevice(String),

    #[error("illegal device name {0:?}")]
    InvalidDeviceName(String),

    #[error("command {0:?} is already done")]
    CommandDone(String),
}
