//! Error types for the command core.

use crate::command::CommandState;

/// Misuse of a command's state machine, or a command line that cannot be parsed.
///
/// Everything except [`CommandError::Parse`] indicates a bug in the calling
/// code rather than a user mistake.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command {cmd_str:?} is {state}; cannot change state to {new_state}")]
    AlreadyDone {
        cmd_str: String,
        state: CommandState,
        new_state: CommandState,
    },

    #[error("command {cmd_str:?} cannot return to {new_state} from {state}")]
    InvalidTransition {
        cmd_str: String,
        state: CommandState,
        new_state: CommandState,
    },

    #[error("unknown command state {0:?}")]
    UnknownState(String),

    #[error("command {0:?} is finished; cannot track a command")]
    TrackAfterDone(String),

    #[error("command {0:?} is already tracking a command")]
    AlreadyTracking(String),

    #[error("could not parse command {0:?}")]
    Parse(String),
}

/// Errors from configuring or feeding the priority command queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("cannot queue unrecognized command: {0}")]
    UnknownVerb(String),

    #[error("cannot add rule to unrecognized command: {0}")]
    UnknownRuleVerb(String),

    #[error("unknown rule action {0:?}; must be one of cancel_new, cancel_queued, kill_running")]
    UnknownAction(String),

    #[error("invalid priority {0:?}; must be a non-negative integer or \"immediate\"")]
    InvalidPriority(String),

    #[error("rule {action} for new command {new_verb} vs. queued command {queued_verb} is already set")]
    DuplicateRule {
        action: crate::queue::RuleAction,
        new_verb: String,
        queued_verb: String,
    },

    #[error(
        "cannot set rule {action} for new command {new_verb} vs. queued command {queued_verb}: already set to {existing}"
    )]
    ConflictingRule {
        action: crate::queue::RuleAction,
        existing: crate::queue::RuleAction,
        new_verb: String,
        queued_verb: String,
    },

    #[error("command {0:?} is already done; cannot queue it")]
    CommandDone(String),
}

/// Errors loading an actor configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid queue policy: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid device config: {0}")]
    Devices(String),
}
