//! Status output.
//!
//! The core never writes to users directly. Terminal states, warnings and
//! keyword updates go to a [`StatusSink`] that is passed in explicitly.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::command::Command;

/// One-character status code prefixed to every status line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MsgCode {
    /// `i`
    Info,
    /// `w`
    Warning,
    /// `f`
    Failed,
    /// `:`
    Done,
}

impl MsgCode {
    pub fn as_char(&self) -> char {
        match self {
            MsgCode::Info => 'i',
            MsgCode::Warning => 'w',
            MsgCode::Failed => 'f',
            MsgCode::Done => ':',
        }
    }

    /// True for codes that end a command.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MsgCode::Failed | MsgCode::Done)
    }
}

impl fmt::Display for MsgCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Quote a string for a keyword value: wrap in double quotes, escape `\` and `"`.
pub fn quote_str(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// A status message as delivered to users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    pub code: MsgCode,
    pub msg: String,
    pub user_id: u32,
    pub cmd_id: u32,
    pub timestamp: DateTime<Utc>,
}

impl StatusReport {
    /// Build a report; ids come from `cmd`, or 0 when there is none.
    pub fn new(code: MsgCode, msg: impl Into<String>, cmd: Option<&Command>) -> Self {
        Self {
            code,
            msg: msg.into(),
            user_id: cmd.map_or(0, Command::user_id),
            cmd_id: cmd.map_or(0, Command::cmd_id),
            timestamp: Utc::now(),
        }
    }

    /// The line written to users: `userID cmdID code message`.
    pub fn to_line(&self) -> String {
        format!("{} {} {} {}", self.user_id, self.cmd_id, self.code, self.msg)
    }
}

/// Receiver of user-visible status. Must not block.
pub trait StatusSink: Send + Sync {
    fn report(&self, code: MsgCode, msg: &str, cmd: Option<&Command>);
}

/// Report a command's current state using [`Command::hub_format`].
pub fn report_command(sink: &dyn StatusSink, cmd: &Command) {
    let (code, msg) = cmd.hub_format();
    sink.report(code, &msg, Some(cmd));
}

/// Sink that writes status into the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn report(&self, code: MsgCode, msg: &str, cmd: Option<&Command>) {
        let user_id = cmd.map_or(0, Command::user_id);
        let cmd_id = cmd.map_or(0, Command::cmd_id);
        match code {
            MsgCode::Warning | MsgCode::Failed => {
                warn!(user_id, cmd_id, code = %code, "{msg}")
            }
            MsgCode::Info | MsgCode::Done => info!(user_id, cmd_id, code = %code, "{msg}"),
        }
    }
}

/// Sink that forwards reports over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatusReport>,
}

impl ChannelSink {
    /// Create a sink and the receiver its reports arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelSink {
    fn report(&self, code: MsgCode, msg: &str, cmd: Option<&Command>) {
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(StatusReport::new(code, msg, cmd));
    }
}

/// Sink that keeps every report in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    reports: Arc<Mutex<Vec<StatusReport>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything reported so far.
    pub fn reports(&self) -> Vec<StatusReport> {
        self.reports.lock().clone()
    }

    /// Report lines (`userID cmdID code message`).
    pub fn lines(&self) -> Vec<String> {
        self.reports.lock().iter().map(StatusReport::to_line).collect()
    }

    /// Messages reported with `code`.
    pub fn messages_with(&self, code: MsgCode) -> Vec<String> {
        self.reports
            .lock()
            .iter()
            .filter(|report| report.code == code)
            .map(|report| report.msg.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

impl StatusSink for RecordingSink {
    fn report(&self, code: MsgCode, msg: &str, cmd: Option<&Command>) {
        self.reports.lock().push(StatusReport::new(code, msg, cmd));
    }
}

impl<S: StatusSink + ?Sized> StatusSink for Arc<S> {
    fn report(&self, code: MsgCode, msg: &str, cmd: Option<&Command>) {
        (**self).report(code, msg, cmd)
    }
}
