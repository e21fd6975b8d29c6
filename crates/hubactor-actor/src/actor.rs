//! The actor: parses user command lines and dispatches them.
//!
//! Dispatch order for a verb:
//! 1. the verb table (local handlers, then device-forwarded verbs)
//! 2. direct device access: the verb is a device name and the arguments
//!    are sent to that device verbatim
//!
//! Verbs with a queue priority run through the [`CommandQueue`]; built-in
//! verbs and verbs without a priority run at once. Every user command's
//! final state is reported to the status sink.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use hubactor_core::{
    ActorConfig, Command, CommandQueue, CommandState, KillFn, MsgCode, QueuePolicy, StatusSink,
    TracingSink, quote_str, report_command,
};
use hubactor_devices::{DISCONNECTED_MSG, DeviceSet};

use crate::error::{ActorError, Result};
use crate::line::parse_user_line;
use crate::table::{CommandTable, Handler, Outcome, Target};

/// Message given to a running command the queue asked to kill.
pub const KILLED_BY_QUEUE_MSG: &str = "killed by queue";

/// Keyword used to show device connection states.
pub const CONN_STATE_KEYWORD: &str = "ConnState";

/// Verbs every actor handles itself. Never queued.
pub const BUILTIN_VERBS: [&str; 5] = ["conndev", "disconndev", "help", "ping", "status"];

/// Set `cmd` to `state` unless it already finished.
fn finish(cmd: &Command, state: CommandState, text_msg: impl Into<String>) {
    if cmd.is_done() {
        return;
    }
    if let Err(err) = cmd.set_state(state, text_msg) {
        error!(cmd = %cmd, error = %err, "could not finish command");
    }
}

fn default_kill(killed: &Command, killer: &Command) {
    debug!(killed = %killed, killer = %killer, "queue kill request");
    finish(killed, CommandState::Cancelled, KILLED_BY_QUEUE_MSG);
}

struct Forward {
    verb: String,
    slot: String,
    device_verb: String,
    help: String,
}

struct Local {
    verb: String,
    help: String,
    handler: Handler,
}

/// Builder for [`Actor`].
pub struct ActorBuilder {
    name: String,
    policy: QueuePolicy,
    kill_fn: Option<KillFn>,
    sink: Arc<dyn StatusSink>,
    devices: Option<DeviceSet>,
    locals: Vec<Local>,
    forwards: Vec<Forward>,
}

impl ActorBuilder {
    /// Name, queue policy and slot verbs from a configuration.
    pub fn with_config(mut self, config: &ActorConfig) -> Result<Self> {
        self.name = config.actor.name.clone();
        self.policy = config.queue_policy()?;
        for slot in &config.devices.slots {
            for verb in &slot.verbs {
                self = self.with_device_verb(verb, &slot.slot, verb, "");
            }
        }
        Ok(self)
    }

    pub fn with_policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How the queue kills a running command (`killed`, `killer`).
    ///
    /// Must eventually finish `killed`. The default cancels it.
    pub fn with_kill_fn<K>(mut self, kill_fn: K) -> Self
    where
        K: Fn(&Command, &Command) + Send + Sync + 'static,
    {
        self.kill_fn = Some(Arc::new(kill_fn));
        self
    }

    /// Where user-visible status goes; defaults to the log.
    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_devices(mut self, devices: DeviceSet) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Register a local command.
    pub fn with_handler<F>(mut self, verb: &str, help: &str, handler: F) -> Self
    where
        F: Fn(&Actor, &Command) -> Result<Outcome> + Send + Sync + 'static,
    {
        self.locals.push(Local {
            verb: verb.to_string(),
            help: help.to_string(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Forward `verb` to the device in `slot` as `device_verb`.
    pub fn with_device_verb(mut self, verb: &str, slot: &str, device_verb: &str, help: &str) -> Self {
        let help = if help.is_empty() {
            format!("send {device_verb} to the {slot} device")
        } else {
            help.to_string()
        };
        self.forwards.push(Forward {
            verb: verb.to_string(),
            slot: slot.to_string(),
            device_verb: device_verb.to_string(),
            help,
        });
        self
    }

    /// Build the verb table and the queue.
    ///
    /// Fails on a verb registered twice, a verb equal to a device name, or a
    /// forwarded verb naming an unknown slot.
    pub fn build(self) -> Result<Actor> {
        let devices = match self.devices {
            Some(devices) => devices,
            None => DeviceSet::new(Vec::new(), Vec::new(), CONN_STATE_KEYWORD, self.sink.clone(), None)?,
        };

        let mut table = CommandTable::new();
        table.add_local("ping", "verify that actor is alive", cmd_ping)?;
        table.add_local("status", "show status", cmd_status)?;
        table.add_local("help", "print this help", cmd_help)?;
        table.add_local(
            "conndev",
            "[slot ...]: connect devices (all if none given)",
            cmd_conndev,
        )?;
        table.add_local(
            "disconndev",
            "[slot ...]: disconnect devices (all if none given)",
            cmd_disconndev,
        )?;
        for local in self.locals {
            table.add_shared(&local.verb, &local.help, local.handler)?;
        }
        for forward in self.forwards {
            if !devices.contains(&forward.slot) {
                return Err(ActorError::UnknownSlot {
                    verb: forward.verb,
                    slot: forward.slot,
                });
            }
            table.add_device_verb(&forward.verb, &forward.slot, &forward.device_verb, &forward.help)?;
        }
        for device in devices.devices().into_iter().flatten() {
            if table.contains(&device.name().to_lowercase()) {
                return Err(ActorError::DuplicateVerb(device.name().to_string()));
            }
        }

        let queue = match self.kill_fn {
            Some(kill_fn) => CommandQueue::new(self.policy, move |killed: &Command, killer: &Command| {
                kill_fn(killed, killer)
            }),
            None => CommandQueue::new(self.policy, default_kill),
        };

        debug!(actor = %self.name, verbs = table.len(), "actor built");
        Ok(Actor {
            inner: Arc::new(ActorInner {
                name: self.name,
                table,
                devices,
                queue,
                sink: self.sink,
            }),
        })
    }
}

struct ActorInner {
    name: String,
    table: CommandTable,
    devices: DeviceSet,
    queue: CommandQueue,
    sink: Arc<dyn StatusSink>,
}

/// A hub actor. Clones share the same actor.
#[derive(Clone)]
pub struct Actor {
    inner: Arc<ActorInner>,
}

impl Actor {
    pub fn builder(name: impl Into<String>) -> ActorBuilder {
        ActorBuilder {
            name: name.into(),
            policy: QueuePolicy::new(),
            kill_fn: None,
            sink: Arc::new(TracingSink),
            devices: None,
            locals: Vec::new(),
            forwards: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn table(&self) -> &CommandTable {
        &self.inner.table
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.inner.devices
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.inner.queue
    }

    /// Send status to users.
    pub fn report(&self, code: MsgCode, msg: &str, cmd: Option<&Command>) {
        self.inner.sink.report(code, msg, cmd);
    }

    /// Parse and dispatch one line from user `user_id`.
    ///
    /// An unparseable line is reported as a failure and `None` returned.
    pub fn handle_line(&self, user_id: u32, line: &str) -> Option<Command> {
        match parse_user_line(user_id, line) {
            Ok(cmd) => {
                self.dispatch(cmd.clone());
                Some(cmd)
            }
            Err(err) => {
                warn!(user_id, line, error = %err, "unparseable command");
                let stub = Command::builder(line).with_ids(user_id, 0).build();
                self.report(
                    MsgCode::Failed,
                    &format!("Text={}", quote_str(&err.to_string())),
                    Some(&stub),
                );
                None
            }
        }
    }

    /// Run a user command.
    pub fn dispatch(&self, cmd: Command) {
        let sink = self.inner.sink.clone();
        cmd.add_callback(move |cmd: &Command| {
            if cmd.is_done() {
                report_command(sink.as_ref(), cmd);
            }
        });
        if cmd.is_done() {
            return;
        }
        if cmd.body().trim().is_empty() {
            finish(&cmd, CommandState::Done, "");
            return;
        }

        let verb = cmd.verb().to_string();
        let target = match self.inner.table.get(&verb) {
            Some(entry) => entry.target.clone(),
            None => match self.inner.devices.slot_from_dev_name(&verb) {
                Some(slot) => Target::Device {
                    slot,
                    device_verb: String::new(),
                },
                None => {
                    if let Err(err) = cmd.set_full_state(
                        CommandState::Failed,
                        "",
                        format!("UnknownCommand={verb}"),
                    ) {
                        error!(cmd = %cmd, error = %err, "could not reject command");
                    }
                    return;
                }
            },
        };

        let queued = !BUILTIN_VERBS.contains(&verb.as_str())
            && self.inner.queue.policy().priority_of(&verb).is_some();
        if !queued {
            self.run_target(&target, &cmd);
            return;
        }
        debug!(cmd = %cmd, "queueing command");
        let actor = self.clone();
        let result = self
            .inner
            .queue
            .add_cmd(cmd.clone(), move |cmd: &Command| actor.run_target(&target, cmd));
        if let Err(err) = result {
            finish(&cmd, CommandState::Failed, err.to_string());
        }
    }

    fn run_target(&self, target: &Target, cmd: &Command) {
        match target {
            Target::Local(handler) => {
                if cmd.state() == CommandState::Ready {
                    finish(cmd, CommandState::Running, "");
                }
                match handler(self, cmd) {
                    Ok(Outcome::Finished) => finish(cmd, CommandState::Done, ""),
                    Ok(Outcome::Background) => {}
                    Err(err) => {
                        if cmd.is_done() {
                            warn!(cmd = %cmd, error = %err, "handler failed after finishing its command");
                        }
                        finish(cmd, CommandState::Failed, err.to_string());
                    }
                }
            }
            Target::Device { slot, device_verb } => {
                let dev_cmd_str = [device_verb.as_str(), cmd.args()]
                    .into_iter()
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                if dev_cmd_str.is_empty() {
                    finish(cmd, CommandState::Failed, "no command given for the device");
                    return;
                }
                match self.inner.devices.get(slot) {
                    Some(device) => {
                        debug!(cmd = %cmd, device = %device, line = %dev_cmd_str, "forwarding to device");
                        device.start_cmd(&dev_cmd_str, Some(cmd), None);
                    }
                    None => finish(cmd, CommandState::Failed, format!("no device in slot {slot}")),
                }
            }
        }
    }

    /// Fail everything queued or running, then disconnect every device.
    pub fn shutdown(&self) -> Result<Command> {
        self.inner.queue.kill_all(DISCONNECTED_MSG);
        Ok(self.inner.devices.disconnect(None, None, None)?)
    }

    /// Slots named by `args` (slot or device names); `None` if empty.
    fn slots_from_args(&self, args: &str) -> Option<Vec<String>> {
        let slots: Vec<String> = args
            .split_whitespace()
            .map(|name| {
                if self.inner.devices.contains(name) {
                    name.to_string()
                } else {
                    self.inner
                        .devices
                        .slot_from_dev_name(name)
                        .unwrap_or_else(|| name.to_string())
                }
            })
            .collect();
        (!slots.is_empty()).then_some(slots)
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("name", &self.inner.name)
            .field("verbs", &self.inner.table.len())
            .field("devices", &self.inner.devices)
            .finish()
    }
}

fn check_no_args(cmd: &Command) -> Result<()> {
    if cmd.args().is_empty() {
        Ok(())
    } else {
        Err(ActorError::NoArgsAllowed(cmd.verb().to_string()))
    }
}

fn cmd_ping(_actor: &Actor, cmd: &Command) -> Result<Outcome> {
    check_no_args(cmd)?;
    cmd.set_state(CommandState::Done, "alive")?;
    Ok(Outcome::Finished)
}

fn cmd_status(actor: &Actor, cmd: &Command) -> Result<Outcome> {
    check_no_args(cmd)?;
    let queue = actor.queue();
    let running = queue.running().map(|running| running.cmd_str().to_string());
    actor.report(
        MsgCode::Info,
        &format!(
            "Actor={}; QueueLen={}; Running={}",
            quote_str(actor.name()),
            queue.len(),
            quote_str(running.as_deref().unwrap_or(""))
        ),
        Some(cmd),
    );
    if !actor.devices().is_empty() {
        actor.devices().show_conn_state(Some(cmd));
    }
    Ok(Outcome::Finished)
}

fn cmd_help(actor: &Actor, cmd: &Command) -> Result<Outcome> {
    let mut lines = actor.table().help_lines();
    let device_names: Vec<String> = actor
        .devices()
        .devices()
        .into_iter()
        .flatten()
        .map(|device| device.name().to_string())
        .collect();
    if !device_names.is_empty() {
        lines.push(String::new());
        lines.push("Direct device access commands:".to_string());
        for name in device_names {
            lines.push(format!("{name} <text>: send <text> to device {name}"));
        }
    }
    for line in lines {
        actor.report(MsgCode::Info, &format!("Text={}", quote_str(&line)), Some(cmd));
    }
    Ok(Outcome::Finished)
}

fn cmd_conndev(actor: &Actor, cmd: &Command) -> Result<Outcome> {
    let slots = actor.slots_from_args(cmd.args());
    actor.devices().connect(slots, Some(cmd.clone()), None)?;
    Ok(Outcome::Background)
}

fn cmd_disconndev(actor: &Actor, cmd: &Command) -> Result<Outcome> {
    let slots = actor.slots_from_args(cmd.args());
    actor.devices().disconnect(slots, Some(cmd.clone()), None)?;
    Ok(Outcome::Background)
}
