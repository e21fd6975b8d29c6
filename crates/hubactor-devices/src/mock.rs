//! In-memory transport and a simple reply handler, for tests and the console.
//!
//! [`MockTransport`] records every written line and can answer with a
//! responder function after a delay. [`EchoHandler`] understands the replies
//! produced by [`echo_reply`]:
//!
//! ```text
//! write: "<locCmdID> <cmd>"
//! read:  "<locCmdID> : <text>"      done
//!        "<locCmdID> f <text>"      failed
//!        "<locCmdID> i <keyword>"   information, command keeps running
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use hubactor_core::callbacks::{Callback, CallbackId, CallbackList};
use hubactor_core::status::{MsgCode, quote_str};
use hubactor_core::{Command, CommandState};

use crate::device::{Device, DeviceHandler, finish};
use crate::error::TransportError;
use crate::transport::{Result, Transport, TransportState};

/// Produces the lines a device sends back for one written line.
pub type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

struct MockInner {
    name: String,
    state: Mutex<TransportState>,
    connect_delay: Duration,
    disconnect_delay: Duration,
    reply_delay: Duration,
    connect_error: Mutex<Option<String>>,
    write_error: Mutex<Option<String>>,
    written: Mutex<Vec<String>>,
    responder: Option<Responder>,
    connects: AtomicUsize,
    read_callbacks: CallbackList<str>,
    state_callbacks: CallbackList<TransportState>,
}

/// Transport that talks to nothing. Clones share state, so a test can keep a
/// handle while the device owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MockInner {
                name: name.into(),
                state: Mutex::new(TransportState::Disconnected),
                connect_delay: Duration::ZERO,
                disconnect_delay: Duration::ZERO,
                reply_delay: Duration::ZERO,
                connect_error: Mutex::new(None),
                write_error: Mutex::new(None),
                written: Mutex::new(Vec::new()),
                responder: None,
                connects: AtomicUsize::new(0),
                read_callbacks: CallbackList::new(),
                state_callbacks: CallbackList::new(),
            }),
        }
    }

    /// A transport that answers through [`echo_reply`].
    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name).with_responder(echo_reply)
    }

    // Builder methods must run before the transport is cloned.
    fn configure(mut self, apply: impl FnOnce(&mut MockInner)) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => apply(inner),
            None => warn!(transport = %self.inner.name, "mock transport already shared, setting ignored"),
        }
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.configure(|inner| inner.connect_delay = delay)
    }

    pub fn with_disconnect_delay(self, delay: Duration) -> Self {
        self.configure(|inner| inner.disconnect_delay = delay)
    }

    /// Delay between a write and its replies.
    pub fn with_reply_delay(self, delay: Duration) -> Self {
        self.configure(|inner| inner.reply_delay = delay)
    }

    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        let responder: Responder = Arc::new(responder);
        self.configure(|inner| inner.responder = Some(responder))
    }

    /// Make the next connects fail with `msg` (`None` to succeed again).
    pub fn set_connect_error(&self, msg: Option<&str>) {
        *self.inner.connect_error.lock() = msg.map(str::to_string);
    }

    /// Make writes fail with `msg` (`None` to succeed again).
    pub fn set_write_error(&self, msg: Option<&str>) {
        *self.inner.write_error.lock() = msg.map(str::to_string);
    }

    /// Every line written so far.
    pub fn written(&self) -> Vec<String> {
        self.inner.written.lock().clone()
    }

    pub fn clear_written(&self) {
        self.inner.written.lock().clear();
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Deliver a line as if the device had sent it.
    pub fn inject_line(&self, line: &str) {
        self.inner.read_callbacks.fire(line);
    }

    /// Simulate the link dropping.
    pub fn drop_connection(&self) {
        self.set_state(TransportState::Disconnected);
    }

    fn set_state(&self, state: TransportState) {
        {
            let mut current = self.inner.state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        self.inner.state_callbacks.fire(&state);
    }

    fn schedule_replies(&self, replies: Vec<String>) {
        let delay = self.inner.reply_delay;
        let transport = self.clone();
        // replies always arrive after the write returns
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for reply in replies {
                transport.inject_line(&reply);
            }
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn describe(&self) -> String {
        format!("mock:{}", self.inner.name)
    }

    fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    async fn connect(&self) -> Result<()> {
        self.set_state(TransportState::Connecting);
        if !self.inner.connect_delay.is_zero() {
            tokio::time::sleep(self.inner.connect_delay).await;
        }
        let error = self.inner.connect_error.lock().clone();
        if let Some(msg) = error {
            self.set_state(TransportState::Failed);
            return Err(TransportError::ConnectFailed(msg));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.set_state(TransportState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.state() == TransportState::Disconnected {
            return Ok(());
        }
        self.set_state(TransportState::Disconnecting);
        if !self.inner.disconnect_delay.is_zero() {
            tokio::time::sleep(self.inner.disconnect_delay).await;
        }
        self.set_state(TransportState::Disconnected);
        Ok(())
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(msg) = self.inner.write_error.lock().clone() {
            return Err(TransportError::WriteFailed(msg));
        }
        self.inner.written.lock().push(line.to_string());
        if let Some(responder) = &self.inner.responder {
            let replies = responder(line);
            if !replies.is_empty() && tokio::runtime::Handle::try_current().is_ok() {
                self.schedule_replies(replies);
            }
        }
        Ok(())
    }

    fn add_read_callback(&self, callback: Callback<str>) -> CallbackId {
        self.inner.read_callbacks.add_shared(callback)
    }

    fn remove_read_callback(&self, id: CallbackId) -> bool {
        self.inner.read_callbacks.remove(id)
    }

    fn add_state_callback(&self, callback: Callback<TransportState>) -> CallbackId {
        self.inner.state_callbacks.add_shared(callback)
    }

    fn remove_state_callback(&self, id: CallbackId) -> bool {
        self.inner.state_callbacks.remove(id)
    }
}

/// Reply to `<locCmdID> <cmd>` the way a well-behaved device would.
///
/// `fail ...` fails, `wait ...` never answers, `info ...` sends an
/// information line before finishing. Everything else succeeds.
pub fn echo_reply(line: &str) -> Vec<String> {
    let Some((id, cmd)) = line.split_once(' ') else {
        return Vec::new();
    };
    if id.parse::<u64>().is_err() {
        return Vec::new();
    }
    let (verb, args) = cmd.split_once(' ').unwrap_or((cmd, ""));
    match verb {
        "wait" => Vec::new(),
        "fail" => vec![format!("{id} f {}", if args.is_empty() { "failed" } else { args })],
        "info" => vec![format!("{id} i {args}"), format!("{id} :")],
        _ => vec![format!("{id} :")],
    }
}

/// Handler for devices that answer like [`echo_reply`].
#[derive(Debug, Clone, Default)]
pub struct EchoHandler {
    init_cmd: Option<String>,
}

impl EchoHandler {
    /// Handler whose init finishes at once.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `cmd_str` to the device as the init (and deinit) command.
    pub fn with_init_cmd(mut self, cmd_str: impl Into<String>) -> Self {
        self.init_cmd = Some(cmd_str.into());
        self
    }
}

impl DeviceHandler for EchoHandler {
    fn handle_reply(&self, device: &Device, reply: &str) {
        let mut parts = reply.splitn(3, ' ');
        let id = parts.next().and_then(|id| id.parse::<u64>().ok());
        let code = parts.next();
        let text = parts.next().unwrap_or("").trim();

        let (Some(id), Some(code)) = (id, code) else {
            device.report(
                MsgCode::Warning,
                &format!("UnparsedReply={}", quote_str(reply)),
                None,
            );
            return;
        };
        let Some(cmd) = device.pending_cmd(id) else {
            debug!(device = %device.name(), reply, "reply for no pending command");
            return;
        };
        match code {
            ":" => finish(&cmd, CommandState::Done, text),
            "f" => finish(&cmd, CommandState::Failed, text),
            "i" | "w" => {
                let code = if code == "i" { MsgCode::Info } else { MsgCode::Warning };
                device.report(code, text, Some(&cmd));
            }
            _ => device.report(
                MsgCode::Warning,
                &format!("UnparsedReply={}", quote_str(reply)),
                Some(&cmd),
            ),
        }
    }

    fn init(&self, device: &Device, cmd: &Command) {
        match &self.init_cmd {
            Some(init_cmd) => {
                let dev_cmd = device.start_cmd(init_cmd, None, None);
                if let Err(err) = cmd.track(&dev_cmd) {
                    finish(cmd, CommandState::Failed, err.to_string());
                }
            }
            None => finish(cmd, CommandState::Done, ""),
        }
    }
}
