//! Console actor: stdin lines in, status lines out.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use hubactor_actor::{Actor, CONN_STATE_KEYWORD};
use hubactor_core::config::defaults;
use hubactor_core::{
    ActorConfig, ChannelSink, Command, StatusReport, StatusSink, link_commands,
};
use hubactor_devices::{Device, DeviceSet, EchoHandler, MockTransport};

/// User id given to every console line.
const CONSOLE_USER_ID: u32 = 1;

/// Human-readable summary of a configuration.
pub fn describe_config(config: &ActorConfig) -> Result<String> {
    let policy = config.queue_policy()?;
    let mut out = String::new();
    writeln!(out, "actor: {}", config.actor.name)?;

    writeln!(out, "priorities:")?;
    for (verb, priority) in policy.priorities() {
        writeln!(out, "  {verb:<16} {priority}")?;
    }
    match policy.default_priority() {
        Some(priority) => writeln!(out, "default priority: {priority}")?,
        None => writeln!(out, "default priority: none (unlisted verbs run at once)")?,
    }

    writeln!(out, "rules:")?;
    for rule in policy.rules() {
        writeln!(
            out,
            "  {:<14} new={} queued={}",
            rule.action.as_str(),
            rule.new_verb,
            rule.queued_verb
        )?;
    }

    writeln!(out, "slots:")?;
    for slot in &config.devices.slots {
        match slot.device_name() {
            Some(name) if slot.verbs.is_empty() => writeln!(out, "  {:<8} {name}", slot.slot)?,
            Some(name) => writeln!(
                out,
                "  {:<8} {name} verbs: {}",
                slot.slot,
                slot.verbs.join(", ")
            )?,
            None => writeln!(out, "  {:<8} (empty)", slot.slot)?,
        }
    }
    Ok(out)
}

/// Build an actor whose slots hold in-memory echo devices.
pub fn build_actor(config: &ActorConfig, sink: Arc<dyn StatusSink>) -> Result<Actor> {
    let time_limit = config.device_time_limit();
    let mut slots = Vec::with_capacity(config.devices.slots.len());
    let mut devices = Vec::with_capacity(config.devices.slots.len());
    for slot in &config.devices.slots {
        slots.push(slot.slot.clone());
        devices.push(
            slot.device_name()
                .map(|name| echo_device(name, &sink, time_limit)),
        );
    }
    let devices = DeviceSet::new(slots, devices, CONN_STATE_KEYWORD, sink.clone(), time_limit)?;
    let actor = Actor::builder(config.actor.name.clone())
        .with_sink(sink)
        .with_devices(devices)
        .with_config(config)?
        .build()?;
    Ok(actor)
}

fn echo_device(name: &str, sink: &Arc<dyn StatusSink>, time_limit: Option<Duration>) -> Device {
    let mut builder = Device::builder(
        name,
        Arc::new(MockTransport::echo(name)),
        Arc::new(EchoHandler::new()),
    )
    .with_sink(sink.clone());
    if let Some(limit) = time_limit {
        builder = builder.with_default_time_limit(limit);
    }
    builder.build()
}

/// Connect every device, run stdin lines until EOF, then wait for the
/// commands still active and shut down.
pub async fn run(config: ActorConfig, json: bool) -> Result<()> {
    let (sink, mut reports) = ChannelSink::new();
    let actor = build_actor(&config, Arc::new(sink))?;
    let wait_limit = config
        .device_time_limit()
        .unwrap_or(Duration::from_secs(defaults::DEVICE_TIME_LIMIT_SECS))
        + Duration::from_secs(1);
    info!(actor = %actor.name(), slots = actor.devices().len(), "console started");

    let connect = actor.devices().connect(None, None, None)?;
    wait_done(&connect, wait_limit, &mut reports, json).await?;

    let mut issued = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Some(cmd) = actor.handle_line(CONSOLE_USER_ID, &line) {
                        issued.push(cmd);
                    }
                }
                None => break,
            },
            Some(report) = reports.recv() => print_report(&report, json)?,
        }
    }

    let input = Command::new("console input");
    link_commands(&input, issued.into_iter().filter(|cmd| !cmd.is_done()));
    wait_done(&input, wait_limit, &mut reports, json).await?;

    let shutdown = actor.shutdown()?;
    wait_done(&shutdown, wait_limit, &mut reports, json).await?;
    while let Ok(report) = reports.try_recv() {
        print_report(&report, json)?;
    }
    info!(actor = %actor.name(), "console stopped");
    Ok(())
}

/// Print reports until `cmd` is done or `limit` passes.
async fn wait_done(
    cmd: &Command,
    limit: Duration,
    reports: &mut mpsc::UnboundedReceiver<StatusReport>,
    json: bool,
) -> Result<()> {
    let (tx, mut done) = mpsc::unbounded_channel();
    cmd.add_callback(move |cmd: &Command| {
        if cmd.is_done() {
            let _ = tx.send(());
        }
    });

    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = done.recv() => return Ok(()),
            Some(report) = reports.recv() => print_report(&report, json)?,
            _ = &mut deadline => {
                warn!(cmd = %cmd, "gave up waiting for command");
                return Ok(());
            }
        }
    }
}

fn print_report(report: &StatusReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
    } else {
        println!("{}", report.to_line());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use hubactor_core::RecordingSink;

    const CONFIG: &str = r#"
[actor]
name = "tcc"

[priorities]
move = 2
abort = "immediate"

[[rules]]
action = "kill_running"
new = ["abort"]
queued = ["all"]

[[devices.slots]]
slot = "rot"
name = "rotator"
verbs = ["home"]

[[devices.slots]]
slot = "spare"
empty = true
"#;

    #[test]
    fn test_describe_config() {
        let config = ActorConfig::from_toml_str(CONFIG).unwrap();
        let text = describe_config(&config).unwrap();
        assert!(text.starts_with("actor: tcc\n"), "{text}");
        assert!(text.contains("  abort            immediate\n"), "{text}");
        assert!(text.contains("  move             2\n"), "{text}");
        assert!(text.contains("default priority: none"), "{text}");
        assert!(text.contains("kill_running   new=abort queued=all"), "{text}");
        assert!(text.contains("  rot      rotator verbs: home\n"), "{text}");
        assert!(text.contains("  spare    (empty)\n"), "{text}");
    }

    #[tokio::test]
    async fn test_build_actor_from_config() {
        let config = ActorConfig::from_toml_str(CONFIG).unwrap();
        let actor = build_actor(&config, Arc::new(RecordingSink::new())).unwrap();
        assert_eq!(actor.name(), "tcc");
        assert!(actor.table().contains("home"));
        assert_eq!(actor.devices().filled_slots(), vec!["rot"]);
        assert_eq!(actor.devices().get("rot").unwrap().name(), "rotator");
    }
}
