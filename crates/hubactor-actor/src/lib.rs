//! Hub actor built on the command core and device sets.
//!
//! Provides:
//! - User command line parsing
//! - A verb table of local handlers and device-forwarded verbs
//! - [`Actor`]: dispatch through the priority queue, built-in verbs and
//!   direct device access

pub mod actor;
pub mod error;
pub mod line;
pub mod table;

// Re-exports
pub use actor::{Actor, ActorBuilder, BUILTIN_VERBS, CONN_STATE_KEYWORD, KILLED_BY_QUEUE_MSG};

pub use error::{ActorError, Result};

pub use line::parse_user_line;

pub use table::{CommandTable, Handler, Outcome, Target, VerbEntry};
