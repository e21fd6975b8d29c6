//! Command lifecycle and scheduling core for hub actors.
//!
//! Provides:
//! - Command state machine with time limits, observers and tracking
//! - Command linking (one main command gated on sub-commands)
//! - Priority command queue with verb collision rules
//! - Status sinks for user-visible output
//! - TOML configuration

pub mod callbacks;
pub mod command;
pub mod config;
pub mod error;
pub mod link;
pub mod queue;
pub mod status;

// Re-exports
pub use callbacks::{Callback, CallbackId, CallbackList};

pub use command::{
    Command, CommandBuilder, CommandIdGen, CommandState, FullState, TIMED_OUT_MSG, WeakCommand,
};

pub use config::{ActorConfig, DevicesConfig, RuleConfig, SlotConfig};

pub use error::{CommandError, ConfigError, QueueError};

pub use link::link_commands;

pub use queue::{CommandQueue, KillFn, Priority, QueuePolicy, QueueStats, Rule, RuleAction};

pub use status::{
    ChannelSink, MsgCode, RecordingSink, StatusReport, StatusSink, TracingSink, quote_str,
    report_command,
};
