//! Ordered set of device slots with command fan-out.
//!
//! A slot may be empty. Operations over "all slots" skip empty ones, while
//! naming an empty slot explicitly is an error.
//!
//! ```text
//!              parent
//!   ┌────────────┼────────────┐
//!   ▼            ▼            ▼
//! slot "rot"   slot "foc"   slot "spare" (empty, skipped)
//! dev cmd ─▶ call_func ─▶ chained dev cmd
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use hubactor_core::callbacks::CallbackId;
use hubactor_core::status::{MsgCode, StatusSink, quote_str};
use hubactor_core::{Command, CommandState, link_commands};

use crate::device::{Device, finish};
use crate::error::DeviceError;

/// Shown for empty slots in the connection-state keyword.
pub const NOT_AVAILABLE: &str = "NotAvailable";

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Called when a slot's device command finishes; may return a follow-up
/// command for the same slot.
pub type CallFunc = Arc<dyn Fn(&DevCmdInfo) -> Option<Command> + Send + Sync>;

/// One command, or a list run one after another, for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotCmd {
    One(String),
    List(Vec<String>),
}

impl SlotCmd {
    pub fn is_empty(&self) -> bool {
        match self {
            SlotCmd::One(cmd) => cmd.trim().is_empty(),
            SlotCmd::List(cmds) => cmds.iter().all(|cmd| cmd.trim().is_empty()),
        }
    }
}

impl From<&str> for SlotCmd {
    fn from(cmd: &str) -> Self {
        SlotCmd::One(cmd.to_string())
    }
}

impl From<String> for SlotCmd {
    fn from(cmd: String) -> Self {
        SlotCmd::One(cmd)
    }
}

impl From<Vec<String>> for SlotCmd {
    fn from(cmds: Vec<String>) -> Self {
        SlotCmd::List(cmds)
    }
}

/// What a [`CallFunc`] sees.
#[derive(Debug, Clone)]
pub struct DevCmdInfo {
    pub slot: String,
    pub device: Device,
    pub dev_cmd: Command,
    pub parent: Command,
}

struct SetInner {
    slots: Vec<String>,
    devices: Mutex<Vec<Option<Device>>>,
    dev_callbacks: Mutex<Vec<Option<CallbackId>>>,
    conn_state_keyword: String,
    sink: Arc<dyn StatusSink>,
    default_time_limit: Option<Duration>,
    last_states: Mutex<Option<Vec<String>>>,
}

impl Drop for SetInner {
    fn drop(&mut self) {
        let devices = self.devices.get_mut();
        for (device, id) in devices.iter().zip(self.dev_callbacks.get_mut().iter()) {
            if let (Some(device), Some(id)) = (device, id) {
                device.remove_callback(*id);
            }
        }
    }
}

/// Devices in named slots. Clones share the same set.
#[derive(Clone)]
pub struct DeviceSet {
    inner: Arc<SetInner>,
}

impl DeviceSet {
    /// Build a set from slot names and a parallel list of devices.
    ///
    /// `conn_state_keyword` names the keyword used by
    /// [`DeviceSet::show_conn_state`].
    pub fn new(
        slots: Vec<String>,
        devices: Vec<Option<Device>>,
        conn_state_keyword: impl Into<String>,
        sink: Arc<dyn StatusSink>,
        default_time_limit: Option<Duration>,
    ) -> Result<Self> {
        if slots.len() != devices.len() {
            return Err(DeviceError::LengthMismatch {
                slots: slots.len(),
                devices: devices.len(),
            });
        }
        let mut seen = HashSet::new();
        for slot in &slots {
            if !seen.insert(slot.as_str()) {
                return Err(DeviceError::DuplicateSlot(slot.clone()));
            }
        }

        let count = slots.len();
        let set = DeviceSet {
            inner: Arc::new(SetInner {
                slots,
                devices: Mutex::new(devices.clone()),
                dev_callbacks: Mutex::new(vec![None; count]),
                conn_state_keyword: conn_state_keyword.into(),
                sink,
                default_time_limit: default_time_limit.filter(|limit| !limit.is_zero()),
                last_states: Mutex::new(None),
            }),
        };
        for (index, device) in devices.iter().enumerate() {
            if let Some(device) = device {
                set.watch_device(index, device);
            }
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    pub fn slots(&self) -> &[String] {
        &self.inner.slots
    }

    pub fn contains(&self, slot: &str) -> bool {
        self.index_of(slot).is_some()
    }

    /// Devices in slot order; `None` for empty slots.
    pub fn devices(&self) -> Vec<Option<Device>> {
        self.inner.devices.lock().clone()
    }

    pub fn index_of(&self, slot: &str) -> Option<usize> {
        self.inner.slots.iter().position(|name| name == slot)
    }

    pub fn slot_from_index(&self, index: usize) -> Option<&str> {
        self.inner.slots.get(index).map(String::as_str)
    }

    /// The device in `slot`, if the slot exists and is filled.
    pub fn get(&self, slot: &str) -> Option<Device> {
        let index = self.index_of(slot)?;
        self.inner.devices.lock()[index].clone()
    }

    pub fn dev_exists(&self, slot: &str) -> bool {
        self.get(slot).is_some()
    }

    /// Slot holding the device named `name`.
    pub fn slot_from_dev_name(&self, name: &str) -> Option<String> {
        let devices = self.inner.devices.lock();
        devices
            .iter()
            .position(|device| device.as_ref().is_some_and(|device| device.name() == name))
            .map(|index| self.inner.slots[index].clone())
    }

    /// Slots that hold a device, in order.
    pub fn filled_slots(&self) -> Vec<String> {
        let devices = self.inner.devices.lock();
        self.inner
            .slots
            .iter()
            .zip(devices.iter())
            .filter(|(_, device)| device.is_some())
            .map(|(slot, _)| slot.clone())
            .collect()
    }

    /// Slots whose flag is set. Filled or not.
    pub fn slot_list_from_bools(&self, flags: &[bool]) -> Result<Vec<String>> {
        if flags.len() != self.len() {
            return Err(DeviceError::BoolListLength {
                expected: self.len(),
                got: flags.len(),
            });
        }
        Ok(self
            .inner
            .slots
            .iter()
            .zip(flags)
            .filter(|(_, flag)| **flag)
            .map(|(slot, _)| slot.clone())
            .collect())
    }

    /// Check that every slot exists, appears once and (unless
    /// `allow_empty`) holds a device.
    pub fn check_slot_list(&self, slots: &[String], allow_empty: bool) -> Result<()> {
        let unknown: Vec<String> = slots
            .iter()
            .filter(|slot| !self.contains(slot))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(DeviceError::UnknownSlots(unknown));
        }
        let mut seen = HashSet::new();
        for slot in slots {
            if !seen.insert(slot.as_str()) {
                return Err(DeviceError::DuplicateSlot(slot.clone()));
            }
        }
        if !allow_empty {
            let empty: Vec<String> = slots
                .iter()
                .filter(|slot| !self.dev_exists(slot))
                .cloned()
                .collect();
            if !empty.is_empty() {
                return Err(DeviceError::EmptySlots(empty));
            }
        }
        Ok(())
    }

    /// `None` means every filled slot; an explicit list is checked strictly.
    pub fn expand_slot_list(&self, slots: Option<Vec<String>>) -> Result<Vec<String>> {
        match slots {
            None => Ok(self.filled_slots()),
            Some(slots) => {
                self.check_slot_list(&slots, false)?;
                Ok(slots)
            }
        }
    }

    /// Use `parent` (or a new command named `name`) as a fan-out parent.
    fn take_parent(&self, parent: Option<Command>, name: &str) -> Result<Command> {
        let parent = parent.unwrap_or_else(|| Command::new(name));
        if parent.is_done() {
            return Err(DeviceError::CommandDone(parent.cmd_str().to_string()));
        }
        if parent.state() == CommandState::Ready {
            finish(&parent, CommandState::Running, "");
        }
        Ok(parent)
    }

    fn time_limit_or_default(&self, time_limit: Option<Duration>) -> Option<Duration> {
        time_limit.or(self.inner.default_time_limit)
    }

    /// Connect devices in `slots` (`None` for all filled slots). `parent`
    /// finishes when every connection has finished.
    pub fn connect(
        &self,
        slots: Option<Vec<String>>,
        parent: Option<Command>,
        time_limit: Option<Duration>,
    ) -> Result<Command> {
        self.connect_or_disconnect(slots, parent, time_limit, true)
    }

    /// Disconnect devices in `slots` (`None` for all filled slots).
    pub fn disconnect(
        &self,
        slots: Option<Vec<String>>,
        parent: Option<Command>,
        time_limit: Option<Duration>,
    ) -> Result<Command> {
        self.connect_or_disconnect(slots, parent, time_limit, false)
    }

    fn connect_or_disconnect(
        &self,
        slots: Option<Vec<String>>,
        parent: Option<Command>,
        time_limit: Option<Duration>,
        connect: bool,
    ) -> Result<Command> {
        let action = if connect { "connect" } else { "disconnect" };
        let slots = self.expand_slot_list(slots)?;
        let parent = self.take_parent(parent, action)?;
        let time_limit = self.time_limit_or_default(time_limit);

        let mut subs = Vec::with_capacity(slots.len());
        for slot in &slots {
            let Some(device) = self.get(slot) else {
                continue;
            };
            let cmd = Command::builder(format!("{action} {slot}"))
                .with_ids(parent.user_id(), parent.cmd_id())
                .build();
            let cmd = if connect {
                device.connect_with(cmd, time_limit)
            } else {
                device.disconnect_with(cmd, time_limit)
            };
            subs.push(cmd);
        }
        debug!(action, slots = ?slots, "device set fan-out");

        // connection states are reported before the parent's final status
        let all = Command::new(format!("{action} slots"));
        let set = self.downgrade();
        let parent_cb = parent.clone();
        all.add_callback(move |all: &Command| {
            if !all.is_done() {
                return;
            }
            if let Some(set) = set.upgrade() {
                let cmd = (!parent_cb.is_done()).then_some(&parent_cb);
                set.show_conn_state(cmd);
            }
            finish(&parent_cb, all.state(), all.text_msg());
        });
        link_commands(&all, subs);
        Ok(parent)
    }

    /// Send the same command (or list) to `slots` (`None` for all filled
    /// slots).
    pub fn start_cmd(
        &self,
        cmd: impl Into<SlotCmd>,
        slots: Option<Vec<String>>,
        parent: Option<Command>,
        time_limit: Option<Duration>,
    ) -> Result<RunCmdDict> {
        let cmd = cmd.into();
        let slots = self.expand_slot_list(slots)?;
        let cmd_dict = slots.into_iter().map(|slot| (slot, cmd.clone())).collect();
        self.start_cmd_dict(cmd_dict, parent, time_limit)
    }

    /// Start a possibly different command on each slot.
    pub fn start_cmd_dict(
        &self,
        cmd_dict: IndexMap<String, SlotCmd>,
        parent: Option<Command>,
        time_limit: Option<Duration>,
    ) -> Result<RunCmdDict> {
        self.run_cmd_dict(cmd_dict, None, parent, time_limit)
    }

    /// Like [`DeviceSet::start_cmd_dict`], calling `call_func` as each
    /// slot's command finishes.
    ///
    /// If `call_func` returns a command, the slot waits for that command
    /// instead, and `call_func` is not called again for the slot.
    pub fn start_cmd_dict_with<F>(
        &self,
        cmd_dict: IndexMap<String, SlotCmd>,
        call_func: F,
        parent: Option<Command>,
        time_limit: Option<Duration>,
    ) -> Result<RunCmdDict>
    where
        F: Fn(&DevCmdInfo) -> Option<Command> + Send + Sync + 'static,
    {
        self.run_cmd_dict(cmd_dict, Some(Arc::new(call_func)), parent, time_limit)
    }

    fn run_cmd_dict(
        &self,
        cmd_dict: IndexMap<String, SlotCmd>,
        call_func: Option<CallFunc>,
        parent: Option<Command>,
        time_limit: Option<Duration>,
    ) -> Result<RunCmdDict> {
        let cmd_dict: IndexMap<String, SlotCmd> = cmd_dict
            .into_iter()
            .filter(|(_, cmd)| !cmd.is_empty())
            .collect();
        let slots: Vec<String> = cmd_dict.keys().cloned().collect();
        self.check_slot_list(&slots, false)?;
        let parent = self.take_parent(parent, "device commands")?;
        let time_limit = self.time_limit_or_default(time_limit);

        let run = Arc::new(CmdDictRun {
            parent: parent.clone(),
            call_func,
            state: Mutex::new(RunState::default()),
        });
        for (slot, cmd) in cmd_dict {
            let Some(device) = self.get(&slot) else {
                continue;
            };
            let dev_cmd = match &cmd {
                SlotCmd::One(cmd_str) => device.start_cmd(cmd_str, None, time_limit),
                SlotCmd::List(cmd_strs) => device.start_cmd_list(cmd_strs, None, time_limit),
            };
            run.state.lock().dev_cmds.insert(slot.clone(), dev_cmd.clone());
            run.watch(slot, device, dev_cmd);
        }
        run.state.lock().started = true;
        run.check_done();
        Ok(RunCmdDict { run })
    }

    /// Put `device` in `slot`, or empty the slot with `None`.
    ///
    /// A new device is connected first. If that fails a warning is reported
    /// and the swap still happens. The old device is disconnected and
    /// `parent` is done once the swap is made.
    pub fn replace_dev(
        &self,
        slot: &str,
        device: Option<Device>,
        parent: Option<Command>,
        time_limit: Option<Duration>,
    ) -> Result<Command> {
        let Some(index) = self.index_of(slot) else {
            return Err(DeviceError::UnknownSlots(vec![slot.to_string()]));
        };
        let parent = self.take_parent(parent, &format!("replace {slot}"))?;

        let Some(device) = device else {
            self.swap_device(index, None);
            finish(&parent, CommandState::Done, "");
            return Ok(parent);
        };

        let connect_cmd = Command::builder(format!("connect {}", device.name()))
            .with_ids(parent.user_id(), parent.cmd_id())
            .build();
        let set = self.downgrade();
        let slot = slot.to_string();
        let new_device = device.clone();
        let swap_parent = parent.clone();
        connect_cmd.add_callback(move |connect_cmd: &Command| {
            if !connect_cmd.is_done() {
                return;
            }
            let Some(set) = set.upgrade() else {
                finish(&swap_parent, CommandState::Failed, "device set is gone");
                return;
            };
            if connect_cmd.did_fail() {
                let text = format!(
                    "Failed to initialize new {slot} device {}: {}",
                    new_device.name(),
                    connect_cmd.text_msg()
                );
                warn!("{text}");
                set.inner
                    .sink
                    .report(MsgCode::Warning, &format!("Text={}", quote_str(&text)), None);
            }
            set.swap_device(index, Some(new_device.clone()));
            finish(&swap_parent, CommandState::Done, "");
        });
        device.connect_with(connect_cmd, self.time_limit_or_default(time_limit));
        Ok(parent)
    }

    /// Install `device` at `index`, disconnecting whatever was there.
    fn swap_device(&self, index: usize, device: Option<Device>) {
        let old = {
            let mut devices = self.inner.devices.lock();
            std::mem::replace(&mut devices[index], device.clone())
        };
        let old_callback = self.inner.dev_callbacks.lock()[index].take();
        if let Some(old) = old {
            if let Some(id) = old_callback {
                old.remove_callback(id);
            }
            if !device.as_ref().is_some_and(|device| device.ptr_eq(&old)) {
                debug!(device = %old.name(), "disconnecting replaced device");
                old.disconnect();
            }
        }
        if let Some(device) = &device {
            self.watch_device(index, device);
        }
        self.show_conn_state(None);
    }

    fn watch_device(&self, index: usize, device: &Device) {
        let set = self.downgrade();
        let id = device.add_callback(move |_: &Device| {
            if let Some(set) = set.upgrade() {
                set.show_conn_state(None);
            }
        });
        self.inner.dev_callbacks.lock()[index] = Some(id);
    }

    /// Report `<keyword>=state0, state1, ...` in slot order.
    ///
    /// With no `cmd` the report is only made if some device is not
    /// connected or the list changed since the last report.
    pub fn show_conn_state(&self, cmd: Option<&Command>) {
        let (states, all_connected) = {
            let devices = self.inner.devices.lock();
            let states: Vec<String> = devices
                .iter()
                .map(|device| {
                    device
                        .as_ref()
                        .map_or(NOT_AVAILABLE, |device| device.conn_state().as_str())
                        .to_string()
                })
                .collect();
            let all_connected = devices.iter().flatten().all(Device::is_connected);
            (states, all_connected)
        };
        let changed = {
            let mut last = self.inner.last_states.lock();
            let changed = last.as_ref() != Some(&states);
            *last = Some(states.clone());
            changed
        };

        let (code, report) = if all_connected {
            (MsgCode::Info, cmd.is_some() || changed)
        } else {
            (MsgCode::Warning, true)
        };
        if report {
            let msg = format!("{}={}", self.inner.conn_state_keyword, states.join(", "));
            self.inner.sink.report(code, &msg, cmd);
        }
    }

    fn downgrade(&self) -> WeakDeviceSet {
        WeakDeviceSet {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSet")
            .field("slots", &self.inner.slots)
            .field("filled", &self.filled_slots())
            .finish()
    }
}

struct WeakDeviceSet {
    inner: Weak<SetInner>,
}

impl WeakDeviceSet {
    fn upgrade(&self) -> Option<DeviceSet> {
        self.inner.upgrade().map(|inner| DeviceSet { inner })
    }
}

#[derive(Default)]
struct RunState {
    dev_cmds: IndexMap<String, Command>,
    /// slot → latest failure message
    failed: IndexMap<String, String>,
    called: HashSet<String>,
    started: bool,
    finished: bool,
}

struct CmdDictRun {
    parent: Command,
    call_func: Option<CallFunc>,
    state: Mutex<RunState>,
}

impl CmdDictRun {
    fn watch(self: &Arc<Self>, slot: String, device: Device, dev_cmd: Command) {
        let run = self.clone();
        dev_cmd.add_callback(move |dev_cmd: &Command| {
            if dev_cmd.is_done() {
                run.on_slot_done(&slot, &device, dev_cmd);
            }
        });
    }

    fn on_slot_done(self: &Arc<Self>, slot: &str, device: &Device, dev_cmd: &Command) {
        let call_func = {
            let mut state = self.state.lock();
            let current = state
                .dev_cmds
                .get(slot)
                .is_some_and(|cmd| cmd.ptr_eq(dev_cmd));
            if !current {
                return;
            }
            if dev_cmd.did_fail() {
                state.failed.insert(slot.to_string(), dev_cmd.text_msg());
            }
            match &self.call_func {
                Some(call_func) if state.called.insert(slot.to_string()) => {
                    Some(call_func.clone())
                }
                _ => None,
            }
        };

        if let Some(call_func) = call_func {
            let info = DevCmdInfo {
                slot: slot.to_string(),
                device: device.clone(),
                dev_cmd: dev_cmd.clone(),
                parent: self.parent.clone(),
            };
            if let Some(next) = call_func(&info) {
                debug!(slot, next = %next, "chained device command");
                self.state.lock().dev_cmds.insert(slot.to_string(), next.clone());
                self.watch(slot.to_string(), device.clone(), next);
                return;
            }
        }
        self.check_done();
    }

    fn check_done(&self) {
        let failed = {
            let mut state = self.state.lock();
            if !state.started || state.finished {
                return;
            }
            if !state.dev_cmds.values().all(Command::is_done) {
                return;
            }
            state.finished = true;
            state.failed.clone()
        };

        if failed.is_empty() {
            finish(&self.parent, CommandState::Done, "");
            return;
        }
        let slots: Vec<&str> = failed.keys().map(String::as_str).collect();
        let mut errors: Vec<&str> = Vec::new();
        for msg in failed.values() {
            if !errors.contains(&msg.as_str()) {
                errors.push(msg);
            }
        }
        finish(
            &self.parent,
            CommandState::Failed,
            format!(
                "{:?} failed for {}: {}",
                self.parent.cmd_str(),
                slots.join(", "),
                errors.join("; ")
            ),
        );
    }
}

/// Handle on a running fan-out.
#[derive(Clone)]
pub struct RunCmdDict {
    run: Arc<CmdDictRun>,
}

impl RunCmdDict {
    /// Finishes when every slot command has finished.
    pub fn parent(&self) -> &Command {
        &self.run.parent
    }

    /// Latest device command per slot.
    pub fn dev_cmds(&self) -> IndexMap<String, Command> {
        self.run.state.lock().dev_cmds.clone()
    }

    /// Slots whose command failed, in the order they failed.
    pub fn failed_slots(&self) -> Vec<String> {
        self.run.state.lock().failed.keys().cloned().collect()
    }
}

impl fmt::Debug for RunCmdDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunCmdDict")
            .field("parent", &self.run.parent)
            .field("failed", &self.failed_slots())
            .finish()
    }
}
