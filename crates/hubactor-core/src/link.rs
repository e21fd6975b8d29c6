//! Linking: one main command gated on a fixed set of sub-commands.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error};

use crate::command::{Command, CommandState};

struct Link {
    main: Command,
    subs: Vec<Command>,
    fired: AtomicBool,
}

impl Link {
    fn evaluate(&self) {
        if self.main.is_done() || !self.subs.iter().all(Command::is_done) {
            return;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }

        let failed: Vec<String> = self
            .subs
            .iter()
            .filter(|sub| sub.did_fail())
            .map(|sub| {
                let full = sub.full_state();
                format!("{:?} {}: {}", sub.cmd_str(), full.state, full.text_msg)
            })
            .collect();

        let result = if failed.is_empty() {
            debug!(main = %self.main, subs = self.subs.len(), "linked commands done");
            self.main.set_state(CommandState::Done, "")
        } else {
            debug!(main = %self.main, failed = failed.len(), "linked commands failed");
            self.main.set_state(
                CommandState::Failed,
                format!("Sub-command(s) failed: {}", failed.join(", ")),
            )
        };
        if let Err(err) = result {
            error!(main = %self.main, error = %err, "could not finish linked command");
        }
    }
}

/// Make `main` finish when every command in `subs` is done.
///
/// `main` ends Failed, naming each failed sub-command, if any sub-command
/// was cancelled or failed; otherwise Done. An empty `subs`, or subs that
/// are all finished already, finish `main` right away. A `main` that
/// finishes on its own first is left alone.
pub fn link_commands(main: &Command, subs: impl IntoIterator<Item = Command>) {
    let link = Arc::new(Link {
        main: main.clone(),
        subs: subs.into_iter().collect(),
        fired: AtomicBool::new(false),
    });

    for sub in &link.subs {
        if sub.is_done() {
            continue;
        }
        // each sub keeps the link alive until it finishes and drops its callbacks
        let link_cb = link.clone();
        sub.add_callback(move |_: &Command| link_cb.evaluate());
    }
    link.evaluate();
}
