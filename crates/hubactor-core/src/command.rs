//! Command state machine.
//!
//! A [`Command`] is one unit of work: a command from a user, or a command sent
//! on to a device. It owns its state, an optional time limit and a list of
//! observers that are called synchronously on every state change.
//!
//! ```text
//! Ready ──▶ Running ──▶ Cancelling ──▶ Cancelled
//!   │          │    └──▶ Failing ────▶ Failed
//!   └──────────┴───────────────────────▶ Done / Cancelled / Failed
//! ```
//!
//! Terminal states are final. Trying to leave one is a bug in the caller and
//! is reported as [`CommandError::AlreadyDone`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::callbacks::{CallbackId, CallbackList};
use crate::error::CommandError;
use crate::status::{MsgCode, quote_str};

/// Text message set when a command's time limit expires.
pub const TIMED_OUT_MSG: &str = "Timed out";

/// Command state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    /// Created, not started
    Ready,
    /// Executing
    Running,
    /// Cancellation requested, not yet finished
    Cancelling,
    /// Failure detected, not yet finished
    Failing,
    /// Finished successfully
    Done,
    /// Cancelled, including superseded
    Cancelled,
    /// Failed, including timed out
    Failed,
}

impl CommandState {
    /// Every state, in lifecycle order.
    pub const ALL: [CommandState; 7] = [
        CommandState::Ready,
        CommandState::Running,
        CommandState::Cancelling,
        CommandState::Failing,
        CommandState::Done,
        CommandState::Cancelled,
        CommandState::Failed,
    ];

    /// Running, cancelling or failing.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CommandState::Running | CommandState::Cancelling | CommandState::Failing
        )
    }

    /// Any terminal state.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            CommandState::Done | CommandState::Cancelled | CommandState::Failed
        )
    }

    /// Cancelled or failed.
    pub fn did_fail(&self) -> bool {
        matches!(self, CommandState::Cancelled | CommandState::Failed)
    }

    /// Status code used when reporting this state to users.
    pub fn msg_code(&self) -> MsgCode {
        match self {
            CommandState::Ready | CommandState::Running => MsgCode::Info,
            CommandState::Cancelling | CommandState::Failing => MsgCode::Warning,
            CommandState::Cancelled | CommandState::Failed => MsgCode::Failed,
            CommandState::Done => MsgCode::Done,
        }
    }

    /// Lower-case state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Ready => "ready",
            CommandState::Running => "running",
            CommandState::Cancelling => "cancelling",
            CommandState::Failing => "failing",
            CommandState::Done => "done",
            CommandState::Cancelled => "cancelled",
            CommandState::Failed => "failed",
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandState {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CommandError::UnknownState(s.to_string()))
    }
}

/// State plus the messages that accompanied the last transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullState {
    pub state: CommandState,
    pub text_msg: String,
    pub hub_msg: String,
}

/// Monotonic id source for device command ids.
///
/// Owned by whoever issues the ids (a device, an actor); never global.
#[derive(Debug)]
pub struct CommandIdGen {
    next: AtomicU64,
    start: u64,
    wrap: u64,
}

impl CommandIdGen {
    /// Ids run from 1 and wrap back to 1 after `u32::MAX`.
    pub fn new() -> Self {
        Self::with_range(1, u64::from(u32::MAX))
    }

    /// Ids run from `start` and wrap back to `start` after `wrap`.
    pub fn with_range(start: u64, wrap: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
            start,
            wrap: wrap.max(start),
        }
    }

    /// Take the next id.
    pub fn next_id(&self) -> u64 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current >= self.wrap {
                self.start
            } else {
                current + 1
            };
            match self.next.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for CommandIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a command body into a lower-cased verb and the remaining arguments.
pub fn split_verb(body: &str) -> (String, String) {
    let body = body.trim();
    match body.split_once(char::is_whitespace) {
        Some((verb, args)) => (verb.to_lowercase(), args.trim().to_string()),
        None => (body.to_lowercase(), String::new()),
    }
}

/// Builder for [`Command`].
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    cmd_str: String,
    body: Option<String>,
    verb: Option<String>,
    user_id: u32,
    cmd_id: u32,
    loc_cmd_id: Option<u64>,
    time_limit: Option<Duration>,
}

impl CommandBuilder {
    /// Start a builder for `cmd_str`; the verb is parsed from it unless overridden.
    pub fn new(cmd_str: impl Into<String>) -> Self {
        Self {
            cmd_str: cmd_str.into(),
            body: None,
            verb: None,
            user_id: 0,
            cmd_id: 0,
            loc_cmd_id: None,
            time_limit: None,
        }
    }

    /// Set the user and command ids.
    pub fn with_ids(mut self, user_id: u32, cmd_id: u32) -> Self {
        self.user_id = user_id;
        self.cmd_id = cmd_id;
        self
    }

    /// Set the command body (the part after any header); verb and args come from it.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Override the parsed verb.
    pub fn with_verb(mut self, verb: impl Into<String>) -> Self {
        self.verb = Some(verb.into().to_lowercase());
        self
    }

    /// Set the local (device) command id.
    pub fn with_loc_cmd_id(mut self, loc_cmd_id: u64) -> Self {
        self.loc_cmd_id = Some(loc_cmd_id);
        self
    }

    /// Set a time limit; zero means none.
    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = Some(time_limit).filter(|limit| !limit.is_zero());
        self
    }

    /// Build the command, in state Ready.
    pub fn build(self) -> Command {
        let body = self.body.unwrap_or_else(|| self.cmd_str.clone());
        let (parsed_verb, args) = split_verb(&body);
        let verb = self.verb.unwrap_or(parsed_verb);
        Command {
            inner: Arc::new(CommandInner {
                cmd_str: self.cmd_str,
                body,
                verb,
                args,
                user_id: self.user_id,
                cmd_id: self.cmd_id,
                loc_cmd_id: self.loc_cmd_id,
                core: Mutex::new(CommandCore {
                    state: CommandState::Ready,
                    text_msg: String::new(),
                    hub_msg: String::new(),
                    time_limit: self.time_limit,
                    timer: None,
                    tracking: None,
                }),
                callbacks: CallbackList::new(),
            }),
        }
    }
}

struct CommandInner {
    cmd_str: String,
    body: String,
    verb: String,
    args: String,
    user_id: u32,
    cmd_id: u32,
    loc_cmd_id: Option<u64>,
    core: Mutex<CommandCore>,
    callbacks: CallbackList<Command>,
}

struct CommandCore {
    state: CommandState,
    text_msg: String,
    hub_msg: String,
    time_limit: Option<Duration>,
    timer: Option<JoinHandle<()>>,
    tracking: Option<TrackLink>,
}

struct TrackLink {
    source: Command,
    callback: CallbackId,
}

/// Shared handle to one command. Cloning gives another handle to the same command.
#[derive(Clone)]
pub struct Command {
    inner: Arc<CommandInner>,
}

/// Non-owning handle to a command, for timers and observers.
#[derive(Clone)]
pub struct WeakCommand {
    inner: Weak<CommandInner>,
}

impl WeakCommand {
    /// Upgrade if the command still exists.
    pub fn upgrade(&self) -> Option<Command> {
        self.inner.upgrade().map(|inner| Command { inner })
    }
}

impl Command {
    /// Create a synthetic command (user id and command id 0) in state Ready.
    pub fn new(cmd_str: impl Into<String>) -> Self {
        CommandBuilder::new(cmd_str).build()
    }

    /// Start building a command.
    pub fn builder(cmd_str: impl Into<String>) -> CommandBuilder {
        CommandBuilder::new(cmd_str)
    }

    /// Full command string as received.
    pub fn cmd_str(&self) -> &str {
        &self.inner.cmd_str
    }

    /// Command string without any header.
    pub fn body(&self) -> &str {
        &self.inner.body
    }

    /// Lower-cased command verb.
    pub fn verb(&self) -> &str {
        &self.inner.verb
    }

    /// Everything after the verb.
    pub fn args(&self) -> &str {
        &self.inner.args
    }

    pub fn user_id(&self) -> u32 {
        self.inner.user_id
    }

    pub fn cmd_id(&self) -> u32 {
        self.inner.cmd_id
    }

    /// Local command id, set on commands sent to a device.
    pub fn loc_cmd_id(&self) -> Option<u64> {
        self.inner.loc_cmd_id
    }

    /// The line written to a device: `<locCmdID> <cmdStr>`, or just the command
    /// string when no local id was assigned.
    pub fn full_cmd_str(&self) -> String {
        match self.inner.loc_cmd_id {
            Some(id) => format!("{} {}", id, self.inner.cmd_str),
            None => self.inner.cmd_str.clone(),
        }
    }

    pub fn state(&self) -> CommandState {
        self.inner.core.lock().state
    }

    pub fn text_msg(&self) -> String {
        self.inner.core.lock().text_msg.clone()
    }

    pub fn hub_msg(&self) -> String {
        self.inner.core.lock().hub_msg.clone()
    }

    /// State and messages, read together.
    pub fn full_state(&self) -> FullState {
        let core = self.inner.core.lock();
        FullState {
            state: core.state,
            text_msg: core.text_msg.clone(),
            hub_msg: core.hub_msg.clone(),
        }
    }

    /// Running, cancelling or failing.
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Finished, successfully or not.
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Cancelled or failed.
    pub fn did_fail(&self) -> bool {
        self.state().did_fail()
    }

    pub fn msg_code(&self) -> MsgCode {
        self.state().msg_code()
    }

    /// Status as `(code, "hubMsg; Text=\"textMsg\"")`.
    pub fn hub_format(&self) -> (MsgCode, String) {
        let core = self.inner.core.lock();
        let mut parts = Vec::new();
        if !core.hub_msg.is_empty() {
            parts.push(core.hub_msg.clone());
        }
        if !core.text_msg.is_empty() {
            parts.push(format!("Text={}", quote_str(&core.text_msg)));
        }
        (core.state.msg_code(), parts.join("; "))
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.inner.core.lock().time_limit
    }

    /// True if both handles refer to the same command.
    pub fn ptr_eq(&self, other: &Command) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakCommand {
        WeakCommand {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Change state, replacing both messages, and call every observer.
    pub fn set_state(
        &self,
        new_state: CommandState,
        text_msg: impl Into<String>,
    ) -> Result<(), CommandError> {
        self.apply(new_state, text_msg.into(), String::new(), false)
    }

    /// Like [`Command::set_state`], with a keyword=value message as well.
    pub fn set_full_state(
        &self,
        new_state: CommandState,
        text_msg: impl Into<String>,
        hub_msg: impl Into<String>,
    ) -> Result<(), CommandError> {
        self.apply(new_state, text_msg.into(), hub_msg.into(), false)
    }

    fn apply(
        &self,
        new_state: CommandState,
        text_msg: String,
        hub_msg: String,
        skip_if_done: bool,
    ) -> Result<(), CommandError> {
        let (old_state, link, timer) = {
            let mut core = self.inner.core.lock();
            if core.state.is_done() {
                if skip_if_done {
                    return Ok(());
                }
                return Err(CommandError::AlreadyDone {
                    cmd_str: self.inner.cmd_str.clone(),
                    state: core.state,
                    new_state,
                });
            }
            if new_state == CommandState::Ready {
                return Err(CommandError::InvalidTransition {
                    cmd_str: self.inner.cmd_str.clone(),
                    state: core.state,
                    new_state,
                });
            }
            if core.state == CommandState::Ready && new_state.is_active() {
                self.arm_timer(&mut core);
            }
            let old_state = core.state;
            core.state = new_state;
            core.text_msg = text_msg;
            core.hub_msg = hub_msg;
            if new_state.is_done() {
                (old_state, core.tracking.take(), core.timer.take())
            } else {
                (old_state, None, None)
            }
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        debug!(cmd = %self, from = %old_state, to = %new_state, "command state change");

        self.inner.callbacks.fire(self);

        if new_state.is_done() {
            self.inner.callbacks.clear();
            if let Some(link) = link {
                link.source.remove_callback(link.callback);
            }
        }
        Ok(())
    }

    /// Set or clear the time limit.
    ///
    /// A limit on a command that has not started is armed when it leaves
    /// Ready. On an active command the countdown restarts from now. Done
    /// commands ignore the new limit.
    pub fn set_time_limit(&self, time_limit: Option<Duration>) {
        let mut core = self.inner.core.lock();
        core.time_limit = time_limit.filter(|limit| !limit.is_zero());
        if core.state.is_done() {
            return;
        }
        if core.time_limit.is_none() {
            if let Some(timer) = core.timer.take() {
                timer.abort();
            }
        } else if core.state.is_active() {
            self.arm_timer(&mut core);
        }
    }

    /// Builder-style [`Command::set_time_limit`].
    pub fn with_time_limit(self, time_limit: Duration) -> Self {
        self.set_time_limit(Some(time_limit));
        self
    }

    fn arm_timer(&self, core: &mut CommandCore) {
        if let Some(timer) = core.timer.take() {
            timer.abort();
        }
        let Some(limit) = core.time_limit else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(cmd = %self, "no async runtime; time limit not enforced");
            return;
        };
        let weak = self.downgrade();
        core.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(limit).await;
            if let Some(cmd) = weak.upgrade() {
                cmd.time_out();
            }
        }));
    }

    fn time_out(&self) {
        debug!(cmd = %self, "time limit expired");
        if let Err(err) = self.apply(
            CommandState::Failed,
            TIMED_OUT_MSG.to_string(),
            String::new(),
            true,
        ) {
            error!(cmd = %self, error = %err, "failed to time out command");
        }
    }

    /// Register an observer, called with this command on every state change.
    ///
    /// On a command that is already done the observer is called once, right
    /// away, and not stored; `None` is returned in that case.
    pub fn add_callback<F>(&self, callback: F) -> Option<CallbackId>
    where
        F: Fn(&Command) + Send + Sync + 'static,
    {
        {
            let core = self.inner.core.lock();
            if !core.state.is_done() {
                return Some(self.inner.callbacks.add(callback));
            }
        }
        callback(self);
        None
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.callbacks.remove(id)
    }

    /// Number of registered observers (always 0 once done).
    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.len()
    }

    /// Mirror `source`: every state change of `source` is copied onto this
    /// command, messages included.
    pub fn track(&self, source: &Command) -> Result<(), CommandError> {
        {
            let core = self.inner.core.lock();
            if core.state.is_done() {
                return Err(CommandError::TrackAfterDone(self.inner.cmd_str.clone()));
            }
            if core.tracking.is_some() {
                return Err(CommandError::AlreadyTracking(self.inner.cmd_str.clone()));
            }
        }

        let weak = self.downgrade();
        let Some(callback) = source.add_callback(move |tracked: &Command| {
            if let Some(cmd) = weak.upgrade() {
                cmd.copy_state_from(tracked);
            }
        }) else {
            // source was already done and its state has been copied
            return Ok(());
        };

        let mut core = self.inner.core.lock();
        if core.state.is_done() {
            drop(core);
            source.remove_callback(callback);
        } else {
            core.tracking = Some(TrackLink {
                source: source.clone(),
                callback,
            });
        }
        Ok(())
    }

    /// Stop tracking; does nothing if not tracking.
    pub fn untrack(&self) {
        let link = self.inner.core.lock().tracking.take();
        if let Some(link) = link {
            link.source.remove_callback(link.callback);
        }
    }

    /// True while tracking another command.
    pub fn is_tracking(&self) -> bool {
        self.inner.core.lock().tracking.is_some()
    }

    fn copy_state_from(&self, tracked: &Command) {
        let full = tracked.full_state();
        if let Err(err) = self.set_full_state(full.state, full.text_msg, full.hub_msg) {
            error!(cmd = %self, tracked = %tracked, error = %err, "tracking command failed");
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({:?})", self.inner.cmd_str)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Command")
            .field("cmd_str", &self.inner.cmd_str)
            .field("user_id", &self.inner.user_id)
            .field("cmd_id", &self.inner.cmd_id)
            .field("loc_cmd_id", &self.inner.loc_cmd_id)
            .field("state", &core.state)
            .field("time_limit", &core.time_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder(cmd: &Command) -> Arc<Mutex<Vec<CommandState>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        cmd.add_callback(move |c: &Command| seen_cb.lock().push(c.state()));
        seen
    }

    #[test]
    fn test_state_predicates() {
        assert!(CommandState::Running.is_active());
        assert!(CommandState::Cancelling.is_active());
        assert!(CommandState::Failing.is_active());
        assert!(!CommandState::Ready.is_active());
        assert!(CommandState::Done.is_done());
        assert!(!CommandState::Done.did_fail());
        assert!(CommandState::Cancelled.did_fail());
        assert!(CommandState::Failed.did_fail());
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!("Done".parse::<CommandState>(), Ok(CommandState::Done));
        assert_eq!(
            "cancelling".parse::<CommandState>(),
            Ok(CommandState::Cancelling)
        );
        assert!(matches!(
            "finished".parse::<CommandState>(),
            Err(CommandError::UnknownState(_))
        ));
    }

    #[test]
    fn test_verb_and_args() {
        let cmd = Command::new("Move 1 2  3");
        assert_eq!(cmd.verb(), "move");
        assert_eq!(cmd.args(), "1 2  3");
        assert_eq!(cmd.user_id(), 0);
        assert_eq!(cmd.cmd_id(), 0);
        assert_eq!(cmd.state(), CommandState::Ready);
    }

    #[test]
    fn test_callbacks_fire_in_order_and_clear_when_done() {
        let cmd = Command::new("init");
        let seen = recorder(&cmd);
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        cmd.add_callback(move |_: &Command| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });

        cmd.set_state(CommandState::Running, "").unwrap();
        cmd.set_state(CommandState::Done, "").unwrap();

        assert_eq!(*seen.lock(), vec![CommandState::Running, CommandState::Done]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(cmd.callback_count(), 0);
    }

    #[test]
    fn test_done_is_final() {
        let cmd = Command::new("init");
        cmd.set_state(CommandState::Failed, "broken").unwrap();
        for state in CommandState::ALL {
            assert!(matches!(
                cmd.set_state(state, ""),
                Err(CommandError::AlreadyDone { .. })
            ));
        }
        assert_eq!(cmd.text_msg(), "broken");
    }

    #[test]
    fn test_cannot_return_to_ready() {
        let cmd = Command::new("init");
        cmd.set_state(CommandState::Running, "").unwrap();
        assert!(matches!(
            cmd.set_state(CommandState::Ready, ""),
            Err(CommandError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_messages_replaced_on_every_change() {
        let cmd = Command::new("init");
        cmd.set_full_state(CommandState::Running, "starting", "Stage=1")
            .unwrap();
        assert_eq!(cmd.hub_msg(), "Stage=1");
        cmd.set_state(CommandState::Done, "").unwrap();
        assert_eq!(cmd.text_msg(), "");
        assert_eq!(cmd.hub_msg(), "");
    }

    #[test]
    fn test_add_callback_on_done_command_calls_once() {
        let cmd = Command::new("init");
        cmd.set_state(CommandState::Done, "").unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        let id = cmd.add_callback(move |c: &Command| {
            assert!(c.is_done());
            count_cb.fetch_add(1, Ordering::SeqCst);
        });
        assert!(id.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(cmd.callback_count(), 0);
    }

    #[test]
    fn test_track_copies_state_and_messages() {
        let parent = Command::new("user");
        let child = Command::new("dev");
        parent.track(&child).unwrap();
        assert!(parent.is_tracking());

        child.set_state(CommandState::Running, "").unwrap();
        assert_eq!(parent.state(), CommandState::Running);
        child
            .set_full_state(CommandState::Failed, "motor stalled", "Axis=az")
            .unwrap();
        assert_eq!(
            parent.full_state(),
            FullState {
                state: CommandState::Failed,
                text_msg: "motor stalled".to_string(),
                hub_msg: "Axis=az".to_string(),
            }
        );
        assert!(!parent.is_tracking());
    }

    #[test]
    fn test_track_already_done_source() {
        let parent = Command::new("user");
        let child = Command::new("dev");
        child.set_state(CommandState::Done, "ok").unwrap();
        parent.track(&child).unwrap();
        assert_eq!(parent.state(), CommandState::Done);
        assert_eq!(parent.text_msg(), "ok");
    }

    #[test]
    fn test_track_errors() {
        let parent = Command::new("user");
        let first = Command::new("a");
        let second = Command::new("b");
        parent.track(&first).unwrap();
        assert!(matches!(
            parent.track(&second),
            Err(CommandError::AlreadyTracking(_))
        ));

        let done = Command::new("done");
        done.set_state(CommandState::Done, "").unwrap();
        assert!(matches!(
            done.track(&second),
            Err(CommandError::TrackAfterDone(_))
        ));
    }

    #[test]
    fn test_finishing_tracker_detaches_from_source() {
        let parent = Command::new("user");
        let child = Command::new("dev");
        parent.track(&child).unwrap();
        assert_eq!(child.callback_count(), 1);

        parent.set_state(CommandState::Cancelled, "superseded").unwrap();
        assert_eq!(child.callback_count(), 0);
        child.set_state(CommandState::Done, "").unwrap();
        assert_eq!(parent.state(), CommandState::Cancelled);
    }

    #[test]
    fn test_untrack() {
        let parent = Command::new("user");
        let child = Command::new("dev");
        parent.track(&child).unwrap();
        parent.untrack();
        child.set_state(CommandState::Done, "").unwrap();
        assert_eq!(parent.state(), CommandState::Ready);
    }

    #[test]
    fn test_hub_format() {
        let cmd = Command::new("move");
        cmd.set_full_state(CommandState::Failed, "said \"no\"", "Axis=rot")
            .unwrap();
        let (code, msg) = cmd.hub_format();
        assert_eq!(code, MsgCode::Failed);
        assert_eq!(msg, r#"Axis=rot; Text="said \"no\"""#);
    }

    #[test]
    fn test_full_cmd_str() {
        let cmd = Command::builder("home az").with_loc_cmd_id(17).build();
        assert_eq!(cmd.full_cmd_str(), "17 home az");
        assert_eq!(Command::new("home").full_cmd_str(), "home");
    }

    #[test]
    fn test_id_gen_wraps() {
        let ids = CommandIdGen::with_range(1, 3);
        let taken: Vec<u64> = (0..5).map(|_| ids.next_id()).collect();
        assert_eq!(taken, vec![1, 2, 3, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_limit_fails_command() {
        let cmd = Command::new("slow").with_time_limit(Duration::from_millis(100));
        cmd.set_state(CommandState::Running, "").unwrap();

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(cmd.state(), CommandState::Running);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(cmd.state(), CommandState::Failed);
        assert_eq!(cmd.text_msg(), TIMED_OUT_MSG);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_limit_not_armed_while_ready() {
        let cmd = Command::new("slow").with_time_limit(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(cmd.state(), CommandState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_restarts_countdown() {
        let cmd = Command::new("slow").with_time_limit(Duration::from_millis(100));
        cmd.set_state(CommandState::Running, "").unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        cmd.set_time_limit(Some(Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cmd.state(), CommandState::Running);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cmd.state(), CommandState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_cancels_timer() {
        let cmd = Command::new("quick").with_time_limit(Duration::from_millis(100));
        cmd.set_state(CommandState::Running, "").unwrap();
        cmd.set_state(CommandState::Done, "").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cmd.state(), CommandState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_limit_disarms_timer() {
        let cmd = Command::new("slow").with_time_limit(Duration::from_millis(100));
        cmd.set_state(CommandState::Running, "").unwrap();
        cmd.set_time_limit(None);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cmd.state(), CommandState::Running);
    }
}
