//! Verb dispatch table.
//!
//! Built once when the actor is constructed. Each verb maps either to a
//! local handler or to a command forwarded to the device in one slot.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use hubactor_core::Command;

use crate::actor::Actor;
use crate::error::{ActorError, Result};

/// What a local handler left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler is finished; the command is set Done if still active.
    Finished,
    /// Work continues in the background and will finish the command.
    Background,
}

/// Local command handler.
pub type Handler = Arc<dyn Fn(&Actor, &Command) -> Result<Outcome> + Send + Sync>;

/// Where a verb goes.
#[derive(Clone)]
pub enum Target {
    Local(Handler),
    /// Sent to the device in `slot` as `<device_verb> <args>`.
    Device { slot: String, device_verb: String },
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local(_) => f.write_str("Local"),
            Target::Device { slot, device_verb } => f
                .debug_struct("Device")
                .field("slot", slot)
                .field("device_verb", device_verb)
                .finish(),
        }
    }
}

/// One table entry.
#[derive(Debug, Clone)]
pub struct VerbEntry {
    pub verb: String,
    pub help: String,
    pub target: Target,
}

impl VerbEntry {
    /// `verb: help`, or `verb help` when the help already starts with an
    /// argument summary ending in `:`.
    pub fn help_line(&self) -> String {
        if self.help.contains(':') {
            format!("{} {}", self.verb, self.help)
        } else {
            format!("{}: {}", self.verb, self.help)
        }
    }
}

/// Verbs known to an actor.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: IndexMap<String, VerbEntry>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local handler.
    pub fn add_local<F>(&mut self, verb: &str, help: &str, handler: F) -> Result<()>
    where
        F: Fn(&Actor, &Command) -> Result<Outcome> + Send + Sync + 'static,
    {
        self.insert(verb, help, Target::Local(Arc::new(handler)))
    }

    /// Register an already shared handler.
    pub fn add_shared(&mut self, verb: &str, help: &str, handler: Handler) -> Result<()> {
        self.insert(verb, help, Target::Local(handler))
    }

    /// Forward `verb` to the device in `slot`, renamed to `device_verb`.
    pub fn add_device_verb(
        &mut self,
        verb: &str,
        slot: &str,
        device_verb: &str,
        help: &str,
    ) -> Result<()> {
        self.insert(
            verb,
            help,
            Target::Device {
                slot: slot.to_string(),
                device_verb: device_verb.to_string(),
            },
        )
    }

    fn insert(&mut self, verb: &str, help: &str, target: Target) -> Result<()> {
        let verb = verb.trim().to_lowercase();
        if verb.is_empty() || verb.contains(char::is_whitespace) {
            return Err(ActorError::InvalidVerb(verb));
        }
        if self.entries.contains_key(&verb) {
            return Err(ActorError::DuplicateVerb(verb));
        }
        self.entries.insert(
            verb.clone(),
            VerbEntry {
                verb,
                help: help.to_string(),
                target,
            },
        );
        Ok(())
    }

    pub fn get(&self, verb: &str) -> Option<&VerbEntry> {
        self.entries.get(verb)
    }

    pub fn contains(&self, verb: &str) -> bool {
        self.entries.contains_key(verb)
    }

    /// Verbs in registration order.
    pub fn verbs(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &VerbEntry> {
        self.entries.values()
    }

    /// Sorted help lines.
    pub fn help_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.entries.values().map(VerbEntry::help_line).collect();
        lines.sort();
        lines
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
