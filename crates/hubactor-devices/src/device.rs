//! Device: commands over a transport, and connection sequencing.
//!
//! ```text
//! connect:    NotConnected ─▶ Connecting ─▶ Connected ─▶ Initializing ─▶ Ready
//! disconnect: Ready ─▶ Deinitializing ─▶ Disconnecting ─▶ NotConnected
//! ```
//!
//! Every device command gets a local command id from the device's own
//! [`CommandIdGen`] and is written as `<locCmdID> <cmdStr>`. Replies go to
//! the device-specific [`DeviceHandler`], which finishes pending commands.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use hubactor_core::callbacks::{CallbackId, CallbackList};
use hubactor_core::status::{MsgCode, StatusSink, TracingSink, quote_str};
use hubactor_core::{Command, CommandIdGen, CommandState};

use crate::transport::{DynTransport, TransportState};

/// Message given to pending commands when the link drops.
pub const CONNECTION_LOST_MSG: &str = "connection lost";

/// Message given to pending commands when the device is disconnected.
pub const DISCONNECTED_MSG: &str = "disconnected";

/// Connection phase of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    NotConnected,
    Connecting,
    /// Transport up, not initialized
    Connected,
    Initializing,
    Ready,
    Deinitializing,
    Disconnecting,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::NotConnected => "NotConnected",
            ConnState::Connecting => "Connecting",
            ConnState::Connected => "Connected",
            ConnState::Initializing => "Initializing",
            ConnState::Ready => "Ready",
            ConnState::Deinitializing => "Deinitializing",
            ConnState::Disconnecting => "Disconnecting",
        }
    }

    /// Transport is (or should be) up.
    fn is_up(&self) -> bool {
        matches!(
            self,
            ConnState::Connected | ConnState::Initializing | ConnState::Ready
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device-specific behaviour.
pub trait DeviceHandler: Send + Sync {
    /// Handle one line from the device: parse it, finish pending commands,
    /// report status.
    fn handle_reply(&self, device: &Device, reply: &str);

    /// Bring a freshly connected device to a known state. Must eventually
    /// finish `cmd`; a failure fails the connect command.
    fn init(&self, _device: &Device, cmd: &Command) {
        finish(cmd, CommandState::Done, "");
    }

    /// Clean up before disconnecting. Failure is reported as a warning and
    /// the disconnect goes ahead.
    fn deinit(&self, device: &Device, cmd: &Command) {
        self.init(device, cmd)
    }
}

/// Set `cmd` to `state` unless it already finished.
pub(crate) fn finish(cmd: &Command, state: CommandState, text_msg: impl Into<String>) {
    if cmd.is_done() {
        return;
    }
    if let Err(err) = cmd.set_state(state, text_msg) {
        error!(cmd = %cmd, error = %err, "could not finish command");
    }
}

struct DeviceInner {
    name: String,
    transport: DynTransport,
    handler: Arc<dyn DeviceHandler>,
    sink: Arc<dyn StatusSink>,
    ids: CommandIdGen,
    default_time_limit: Option<Duration>,
    phase: Mutex<ConnState>,
    /// Command of the connect in progress, if any
    connecting: Mutex<Option<Command>>,
    pending: Mutex<IndexMap<u64, Command>>,
    callbacks: CallbackList<Device>,
    read_callback: CallbackId,
    state_callback: CallbackId,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.transport.remove_read_callback(self.read_callback);
        self.transport.remove_state_callback(self.state_callback);
    }
}

/// Builder for [`Device`].
pub struct DeviceBuilder {
    name: String,
    transport: DynTransport,
    handler: Arc<dyn DeviceHandler>,
    sink: Arc<dyn StatusSink>,
    default_time_limit: Option<Duration>,
}

impl DeviceBuilder {
    /// Where the device reports warnings; defaults to the log.
    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Time limit for commands started without one.
    pub fn with_default_time_limit(mut self, limit: Duration) -> Self {
        self.default_time_limit = Some(limit).filter(|limit| !limit.is_zero());
        self
    }

    pub fn build(self) -> Device {
        let inner = Arc::new_cyclic(|weak: &Weak<DeviceInner>| {
            let read_weak = weak.clone();
            let read_callback = self.transport.add_read_callback(Arc::new(move |line: &str| {
                if let Some(inner) = read_weak.upgrade() {
                    let device = Device { inner };
                    device.inner.handler.handle_reply(&device, line);
                }
            }));
            let state_weak = weak.clone();
            let state_callback =
                self.transport
                    .add_state_callback(Arc::new(move |state: &TransportState| {
                        if let Some(inner) = state_weak.upgrade() {
                            Device { inner }.on_transport_state(*state);
                        }
                    }));
            DeviceInner {
                name: self.name,
                transport: self.transport,
                handler: self.handler,
                sink: self.sink,
                ids: CommandIdGen::new(),
                default_time_limit: self.default_time_limit,
                phase: Mutex::new(ConnState::NotConnected),
                connecting: Mutex::new(None),
                pending: Mutex::new(IndexMap::new()),
                callbacks: CallbackList::new(),
                read_callback,
                state_callback,
            }
        });
        Device { inner }
    }
}

/// One device. Clones share the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn builder(
        name: impl Into<String>,
        transport: DynTransport,
        handler: Arc<dyn DeviceHandler>,
    ) -> DeviceBuilder {
        DeviceBuilder {
            name: name.into(),
            transport,
            handler,
            sink: Arc::new(TracingSink),
            default_time_limit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn transport(&self) -> &DynTransport {
        &self.inner.transport
    }

    pub fn conn_state(&self) -> ConnState {
        *self.inner.phase.lock()
    }

    /// Transport is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Connected and initialized.
    pub fn is_ready(&self) -> bool {
        self.conn_state() == ConnState::Ready
    }

    pub fn default_time_limit(&self) -> Option<Duration> {
        self.inner.default_time_limit
    }

    /// True if both handles refer to the same device.
    pub fn ptr_eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register an observer called on every connection phase change.
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&Device) + Send + Sync + 'static,
    {
        self.inner.callbacks.add(callback)
    }

    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.callbacks.remove(id)
    }

    /// Send status to users through the device's sink.
    pub fn report(&self, code: MsgCode, msg: &str, cmd: Option<&Command>) {
        self.inner.sink.report(code, msg, cmd);
    }

    /// The unfinished command with this local id.
    pub fn pending_cmd(&self, loc_cmd_id: u64) -> Option<Command> {
        self.inner.pending.lock().get(&loc_cmd_id).cloned()
    }

    /// Unfinished commands, oldest first.
    pub fn pending_cmds(&self) -> Vec<Command> {
        self.inner.pending.lock().values().cloned().collect()
    }

    /// Start one command on the device.
    ///
    /// `user_cmd`, if given, tracks the new command. Without `time_limit`
    /// the device default applies. A write failure fails the command at
    /// once.
    pub fn start_cmd(
        &self,
        cmd_str: &str,
        user_cmd: Option<&Command>,
        time_limit: Option<Duration>,
    ) -> Command {
        let mut builder = Command::builder(cmd_str).with_loc_cmd_id(self.inner.ids.next_id());
        if let Some(user) = user_cmd {
            builder = builder.with_ids(user.user_id(), user.cmd_id());
        }
        if let Some(limit) = time_limit.or(self.inner.default_time_limit) {
            builder = builder.with_time_limit(limit);
        }
        let cmd = builder.build();
        if let Some(user) = user_cmd {
            if let Err(err) = user.track(&cmd) {
                error!(device = %self.name(), user_cmd = %user, error = %err, "could not track device command");
            }
        }
        self.send(&cmd);
        cmd
    }

    fn send(&self, cmd: &Command) {
        let Some(loc_cmd_id) = cmd.loc_cmd_id() else {
            error!(device = %self.name(), cmd = %cmd, "device command has no local id");
            return;
        };
        self.inner.pending.lock().insert(loc_cmd_id, cmd.clone());
        let weak = Arc::downgrade(&self.inner);
        cmd.add_callback(move |cmd: &Command| {
            if cmd.is_done() {
                if let Some(inner) = weak.upgrade() {
                    inner.pending.lock().shift_remove(&loc_cmd_id);
                }
            }
        });

        if let Err(err) = cmd.set_state(CommandState::Running, "") {
            error!(device = %self.name(), cmd = %cmd, error = %err, "could not start device command");
            return;
        }
        let line = cmd.full_cmd_str();
        debug!(device = %self.name(), line = %line, "writing to device");
        if let Err(err) = self.inner.transport.write_line(&line) {
            finish(cmd, CommandState::Failed, err.to_string());
        }
    }

    /// Run commands one after another. The returned command fails at the
    /// first failed command, and is done when all of them are.
    pub fn start_cmd_list<S: AsRef<str>>(
        &self,
        cmd_strs: &[S],
        user_cmd: Option<&Command>,
        time_limit: Option<Duration>,
    ) -> Command {
        let joined: Vec<&str> = cmd_strs.iter().map(AsRef::as_ref).collect();
        let mut builder = Command::builder(joined.join("; "));
        if let Some(user) = user_cmd {
            builder = builder.with_ids(user.user_id(), user.cmd_id());
        }
        let parent = builder.build();
        if let Some(user) = user_cmd {
            if let Err(err) = user.track(&parent) {
                error!(device = %self.name(), user_cmd = %user, error = %err, "could not track command list");
            }
        }
        if let Err(err) = parent.set_state(CommandState::Running, "") {
            error!(cmd = %parent, error = %err, "could not start command list");
        }

        let run = Arc::new(CmdListRun {
            device: self.clone(),
            parent: parent.clone(),
            remaining: Mutex::new(joined.iter().map(|s| s.to_string()).collect()),
            time_limit,
        });
        run.start_next();
        parent
    }

    /// Connect using the default time limit.
    pub fn connect(&self) -> Command {
        let cmd = Command::new(format!("connect {}", self.name()));
        self.connect_with(cmd, self.inner.default_time_limit)
    }

    /// Connect the transport, then run the handler's init.
    ///
    /// `cmd` finishes when init finishes; a failed init fails `cmd` but
    /// leaves the transport connected. A device that is already connected
    /// finishes `cmd` at once without running init again; one that is still
    /// connecting or initializing makes `cmd` track the connect in progress.
    /// On timeout `cmd` fails and the transport is left to finish on its own.
    pub fn connect_with(&self, cmd: Command, time_limit: Option<Duration>) -> Command {
        if cmd.is_done() {
            warn!(device = %self.name(), cmd = %cmd, "connect command already done");
            return cmd;
        }
        let phase = self.conn_state();
        if self.is_connected() && matches!(phase, ConnState::Connected | ConnState::Ready) {
            debug!(device = %self.name(), "already connected");
            finish(&cmd, CommandState::Done, "");
            return cmd;
        }

        if time_limit.is_some() {
            cmd.set_time_limit(time_limit);
        }
        if matches!(phase, ConnState::Connecting | ConnState::Initializing) {
            if let Some(in_flight) = self.connect_in_flight() {
                debug!(device = %self.name(), connect = %in_flight, "connect already in progress");
                if let Err(err) = cmd.track(&in_flight) {
                    finish(&cmd, CommandState::Failed, err.to_string());
                }
                return cmd;
            }
        }
        if cmd.state() == CommandState::Ready {
            finish(&cmd, CommandState::Running, "");
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            finish(&cmd, CommandState::Failed, "no async runtime");
            return cmd;
        };
        *self.inner.connecting.lock() = Some(cmd.clone());
        self.set_phase(ConnState::Connecting);
        let device = self.clone();
        let task_cmd = cmd.clone();
        runtime.spawn(async move {
            device.run_connect(task_cmd).await;
        });
        cmd
    }

    fn connect_in_flight(&self) -> Option<Command> {
        self.inner
            .connecting
            .lock()
            .clone()
            .filter(|cmd| !cmd.is_done())
    }

    async fn run_connect(self, cmd: Command) {
        let result = self.inner.transport.connect().await;
        if cmd.is_done() {
            debug!(device = %self.name(), "transport connect finished after its command");
            self.settle_phase();
            return;
        }
        match result {
            Err(err) => {
                self.set_phase(ConnState::NotConnected);
                finish(&cmd, CommandState::Failed, err.to_string());
            }
            Ok(()) => {
                self.set_phase(ConnState::Connected);
                self.run_init(&cmd);
            }
        }
    }

    fn run_init(&self, parent: &Command) {
        self.set_phase(ConnState::Initializing);
        let init_cmd = Command::new(format!("init {}", self.name()));
        let device = self.clone();
        let parent = parent.clone();
        init_cmd.add_callback(move |init: &Command| {
            if !init.is_done() {
                return;
            }
            if init.did_fail() {
                device.set_phase(ConnState::Connected);
                finish(
                    &parent,
                    CommandState::Failed,
                    format!("init failed: {}", init.text_msg()),
                );
            } else {
                device.set_phase(ConnState::Ready);
                finish(&parent, CommandState::Done, "");
            }
        });
        finish(&init_cmd, CommandState::Running, "");
        self.inner.handler.init(self, &init_cmd);
    }

    /// Disconnect using the default time limit.
    pub fn disconnect(&self) -> Command {
        let cmd = Command::new(format!("disconnect {}", self.name()));
        self.disconnect_with(cmd, self.inner.default_time_limit)
    }

    /// Run the handler's deinit (best effort), then close the transport.
    ///
    /// A device that is already disconnected finishes `cmd` at once.
    pub fn disconnect_with(&self, cmd: Command, time_limit: Option<Duration>) -> Command {
        if cmd.is_done() {
            warn!(device = %self.name(), cmd = %cmd, "disconnect command already done");
            return cmd;
        }
        let phase = self.conn_state();
        if phase == ConnState::NotConnected && !self.is_connected() {
            debug!(device = %self.name(), "already disconnected");
            finish(&cmd, CommandState::Done, "");
            return cmd;
        }

        if time_limit.is_some() {
            cmd.set_time_limit(time_limit);
        }
        if cmd.state() == CommandState::Ready {
            finish(&cmd, CommandState::Running, "");
        }

        if matches!(phase, ConnState::Connected | ConnState::Ready) && self.is_connected() {
            self.set_phase(ConnState::Deinitializing);
            let deinit_cmd = Command::new(format!("deinit {}", self.name()));
            let device = self.clone();
            let parent = cmd.clone();
            deinit_cmd.add_callback(move |deinit: &Command| {
                if !deinit.is_done() {
                    return;
                }
                if deinit.did_fail() {
                    let text = format!("{} cleanup failed: {}", device.name(), deinit.text_msg());
                    warn!(device = %device.name(), "{text}");
                    device.report(MsgCode::Warning, &format!("Text={}", quote_str(&text)), None);
                }
                device.close_transport(&parent);
            });
            finish(&deinit_cmd, CommandState::Running, "");
            self.inner.handler.deinit(self, &deinit_cmd);
        } else {
            self.close_transport(&cmd);
        }
        cmd
    }

    fn close_transport(&self, cmd: &Command) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            finish(cmd, CommandState::Failed, "no async runtime");
            return;
        };
        self.set_phase(ConnState::Disconnecting);
        let device = self.clone();
        let cmd = cmd.clone();
        runtime.spawn(async move {
            let result = device.inner.transport.disconnect().await;
            device.fail_pending(DISCONNECTED_MSG);
            device.set_phase(ConnState::NotConnected);
            match result {
                Ok(()) => finish(&cmd, CommandState::Done, ""),
                Err(err) => finish(&cmd, CommandState::Failed, err.to_string()),
            }
        });
    }

    fn on_transport_state(&self, state: TransportState) {
        debug!(device = %self.name(), transport = %state, "transport state change");
        if !matches!(state, TransportState::Disconnected | TransportState::Failed) {
            return;
        }
        if !self.conn_state().is_up() {
            return;
        }
        warn!(device = %self.name(), "device connection lost");
        self.fail_pending(CONNECTION_LOST_MSG);
        self.set_phase(ConnState::NotConnected);
        let text = format!("{} {}", self.name(), CONNECTION_LOST_MSG);
        self.report(MsgCode::Warning, &format!("Text={}", quote_str(&text)), None);
    }

    /// Fail every pending command with `reason`.
    fn fail_pending(&self, reason: &str) {
        let pending: Vec<Command> = self.inner.pending.lock().drain(..).map(|(_, cmd)| cmd).collect();
        for cmd in pending {
            finish(&cmd, CommandState::Failed, reason);
        }
    }

    /// Phase after an abandoned connect: whatever the transport ended up as.
    fn settle_phase(&self) {
        let phase = if self.is_connected() {
            ConnState::Connected
        } else {
            ConnState::NotConnected
        };
        self.set_phase(phase);
    }

    fn set_phase(&self, phase: ConnState) {
        let changed = {
            let mut current = self.inner.phase.lock();
            let changed = *current != phase;
            *current = phase;
            changed
        };
        if changed {
            info!(device = %self.name(), state = %phase, "device connection state");
            self.inner.callbacks.fire(self);
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .field("transport", &self.inner.transport.describe())
            .field("state", &self.conn_state())
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

struct CmdListRun {
    device: Device,
    parent: Command,
    remaining: Mutex<VecDeque<String>>,
    time_limit: Option<Duration>,
}

impl CmdListRun {
    fn start_next(self: &Arc<Self>) {
        if self.parent.is_done() {
            return;
        }
        let next = self.remaining.lock().pop_front();
        let Some(cmd_str) = next else {
            finish(&self.parent, CommandState::Done, "");
            return;
        };

        let cmd = self.device.start_cmd(&cmd_str, None, self.time_limit);
        let run = self.clone();
        cmd.add_callback(move |cmd: &Command| {
            if !cmd.is_done() {
                return;
            }
            if cmd.did_fail() {
                let full = cmd.full_state();
                finish(
                    &run.parent,
                    full.state,
                    format!("{:?} {}: {}", cmd.cmd_str(), full.state, full.text_msg),
                );
            } else {
                run.start_next();
            }
        });
    }
}
