//! Actor dispatch tests: built-in verbs, local handlers, device forwarding
//! and queueing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hubactor_actor::{Actor, ActorBuilder, ActorError, KILLED_BY_QUEUE_MSG, Outcome};
use hubactor_core::{
    ActorConfig, Command, CommandState, MsgCode, Priority, QueuePolicy, RecordingSink, RuleAction,
};
use hubactor_devices::{Device, DeviceSet, EchoHandler, MockTransport, Transport};

struct Fixture {
    actor: Actor,
    mock: MockTransport,
    sink: RecordingSink,
}

/// Slot `rot` holds device `rotator`; slot `spare` is empty.
fn builder(sink: &RecordingSink, mock: &MockTransport) -> ActorBuilder {
    let device = Device::builder("rotator", Arc::new(mock.clone()), Arc::new(EchoHandler::new()))
        .with_sink(Arc::new(sink.clone()))
        .build();
    let devices = DeviceSet::new(
        vec!["rot".into(), "spare".into()],
        vec![Some(device), None],
        "ConnState",
        Arc::new(sink.clone()),
        None,
    )
    .unwrap();
    Actor::builder("tcc")
        .with_sink(Arc::new(sink.clone()))
        .with_devices(devices)
}

fn fixture_with(configure: impl FnOnce(ActorBuilder) -> ActorBuilder) -> Fixture {
    let sink = RecordingSink::new();
    let mock = MockTransport::echo("rotator");
    let actor = configure(builder(&sink, &mock)).build().unwrap();
    Fixture { actor, mock, sink }
}

fn fixture() -> Fixture {
    fixture_with(|builder| builder)
}

async fn connected_fixture_with(configure: impl FnOnce(ActorBuilder) -> ActorBuilder) -> Fixture {
    let fixture = fixture_with(configure);
    fixture.actor.devices().connect(None, None, None).unwrap();
    settle().await;
    assert!(fixture.mock.is_connected());
    fixture.sink.clear();
    fixture
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Handler that leaves its command running and hands it to the test.
fn background(
    store: &Arc<Mutex<Vec<Command>>>,
) -> impl Fn(&Actor, &Command) -> hubactor_actor::Result<Outcome> + Send + Sync + 'static {
    let store = store.clone();
    move |_actor: &Actor, cmd: &Command| {
        store.lock().unwrap().push(cmd.clone());
        Ok(Outcome::Background)
    }
}

#[tokio::test(start_paused = true)]
async fn test_ping() {
    let fixture = fixture();
    let cmd = fixture.actor.handle_line(1, "5 ping").unwrap();
    assert_eq!(cmd.state(), CommandState::Done);
    assert_eq!(fixture.sink.lines(), vec!["1 5 : Text=\"alive\"".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_ping_rejects_arguments() {
    let fixture = fixture();
    let cmd = fixture.actor.handle_line(2, "ping now").unwrap();
    assert_eq!(cmd.state(), CommandState::Failed);
    assert_eq!(
        fixture.sink.lines(),
        vec!["2 0 f Text=\"ping takes no arguments\"".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_verb() {
    let fixture = fixture();
    let cmd = fixture.actor.handle_line(1, "3 bogus 1 2").unwrap();
    assert_eq!(cmd.state(), CommandState::Failed);
    assert_eq!(fixture.sink.lines(), vec!["1 3 f UnknownCommand=bogus".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_empty_command_is_done() {
    let fixture = fixture();
    let cmd = fixture.actor.handle_line(1, "7 ").unwrap();
    assert_eq!(cmd.state(), CommandState::Done);
    let report = fixture.sink.reports().pop().unwrap();
    assert_eq!((report.code, report.cmd_id), (MsgCode::Done, 7));
    assert!(report.msg.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_line_is_reported() {
    let fixture = fixture();
    assert!(fixture.actor.handle_line(4, "7 ?x").is_none());
    let report = fixture.sink.reports().pop().unwrap();
    assert_eq!((report.code, report.user_id, report.cmd_id), (MsgCode::Failed, 4, 0));
    assert!(report.msg.starts_with("Text="), "{}", report.msg);
}

#[test]
fn test_duplicate_verb_rejected_at_build() {
    let sink = RecordingSink::new();
    let mock = MockTransport::echo("rotator");
    let err = builder(&sink, &mock)
        .with_handler("ping", "again", |_: &Actor, _: &Command| Ok(Outcome::Finished))
        .build()
        .unwrap_err();
    assert!(matches!(err, ActorError::DuplicateVerb(ref verb) if verb == "ping"));
}

#[test]
fn test_device_name_clashing_with_verb_rejected() {
    let sink = RecordingSink::new();
    let mock = MockTransport::echo("rotator");
    let err = builder(&sink, &mock)
        .with_handler("rotator", "spin", |_: &Actor, _: &Command| Ok(Outcome::Finished))
        .build()
        .unwrap_err();
    assert!(matches!(err, ActorError::DuplicateVerb(ref name) if name == "rotator"));
}

#[test]
fn test_forward_to_unknown_slot_rejected() {
    let sink = RecordingSink::new();
    let mock = MockTransport::echo("rotator");
    let err = builder(&sink, &mock)
        .with_device_verb("focus", "focuser", "focus", "")
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        ActorError::UnknownSlot { ref verb, ref slot } if verb == "focus" && slot == "focuser"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_local_handler_outcomes() {
    let store = Arc::new(Mutex::new(Vec::new()));
    let fixture = fixture_with(|builder| {
        builder
            .with_handler("calib", "run a calibration", background(&store))
            .with_handler("reset", "reset state", |_: &Actor, _: &Command| Ok(Outcome::Finished))
            .with_handler("jam", "always fails", |_: &Actor, _: &Command| {
                Err(ActorError::Failed("mechanism jammed".into()))
            })
    });

    let reset = fixture.actor.handle_line(1, "1 reset").unwrap();
    assert_eq!(reset.state(), CommandState::Done);

    let jam = fixture.actor.handle_line(1, "2 jam").unwrap();
    assert_eq!(jam.state(), CommandState::Failed);
    assert_eq!(jam.text_msg(), "mechanism jammed");

    let calib = fixture.actor.handle_line(1, "3 calib").unwrap();
    assert_eq!(calib.state(), CommandState::Running);
    assert!(store.lock().unwrap()[0].ptr_eq(&calib));
    calib.set_state(CommandState::Done, "calibrated").unwrap();

    assert_eq!(
        fixture.sink.lines(),
        vec![
            "1 1 : ".to_string(),
            "1 2 f Text=\"mechanism jammed\"".to_string(),
            "1 3 : Text=\"calibrated\"".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_forwarded_device_verb() {
    let fixture =
        connected_fixture_with(|builder| builder.with_device_verb("home", "rot", "home", "")).await;
    let cmd = fixture.actor.handle_line(1, "4 home 1").unwrap();
    settle().await;

    assert_eq!(fixture.mock.written(), vec!["1 home 1".to_string()]);
    assert_eq!(cmd.state(), CommandState::Done);
    assert_eq!(fixture.sink.lines().last().unwrap(), "1 4 : ");
}

#[tokio::test(start_paused = true)]
async fn test_forwarded_device_failure_fails_user_command() {
    let fixture =
        connected_fixture_with(|builder| builder.with_device_verb("stop", "rot", "fail", "")).await;
    let cmd = fixture.actor.handle_line(1, "stop limit").unwrap();
    settle().await;
    assert_eq!(fixture.mock.written(), vec!["1 fail limit".to_string()]);
    assert_eq!(cmd.state(), CommandState::Failed);
    assert_eq!(cmd.text_msg(), "limit");
}

#[tokio::test(start_paused = true)]
async fn test_forward_to_empty_slot_fails() {
    let fixture = fixture_with(|builder| builder.with_device_verb("spin", "spare", "spin", ""));
    let cmd = fixture.actor.handle_line(1, "spin").unwrap();
    assert_eq!(cmd.state(), CommandState::Failed);
    assert_eq!(cmd.text_msg(), "no device in slot spare");
}

#[tokio::test(start_paused = true)]
async fn test_direct_device_access() {
    let fixture = connected_fixture_with(|builder| builder).await;
    let cmd = fixture.actor.handle_line(1, "9 Rotator status x").unwrap();
    settle().await;
    assert_eq!(fixture.mock.written(), vec!["1 status x".to_string()]);
    assert_eq!(cmd.state(), CommandState::Done);

    let empty = fixture.actor.handle_line(1, "rotator").unwrap();
    assert_eq!(empty.state(), CommandState::Failed);
    assert_eq!(empty.text_msg(), "no command given for the device");
}

#[tokio::test(start_paused = true)]
async fn test_device_command_fails_when_not_connected() {
    let fixture = fixture();
    let cmd = fixture.actor.handle_line(1, "rotator status").unwrap();
    settle().await;
    assert_eq!(cmd.state(), CommandState::Failed);
    assert!(fixture.mock.written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_queued_command_killed_by_rule() {
    let store = Arc::new(Mutex::new(Vec::new()));
    let policy = QueuePolicy::new()
        .with_priority("move", Priority::Level(1))
        .with_rule(RuleAction::KillRunning, &["move"], &["move"])
        .unwrap();
    let fixture = fixture_with(|builder| {
        builder
            .with_policy(policy)
            .with_handler("move", "move somewhere", background(&store))
    });

    let first = fixture.actor.handle_line(1, "1 move 1").unwrap();
    assert_eq!(first.state(), CommandState::Ready);
    settle().await;
    assert_eq!(first.state(), CommandState::Running);

    let second = fixture.actor.handle_line(1, "2 move 2").unwrap();
    assert_eq!(first.state(), CommandState::Cancelled);
    assert_eq!(first.text_msg(), KILLED_BY_QUEUE_MSG);
    settle().await;
    assert_eq!(second.state(), CommandState::Running);
    assert_eq!(store.lock().unwrap().len(), 2);
    assert_eq!(
        fixture.sink.lines(),
        vec!["1 1 f Text=\"killed by queue\"".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_custom_kill_fn() {
    let store = Arc::new(Mutex::new(Vec::new()));
    let policy = QueuePolicy::new()
        .with_priority("expose", Priority::Level(1))
        .with_priority("abort", Priority::Immediate);
    let fixture = fixture_with(|builder| {
        builder
            .with_policy(policy)
            .with_kill_fn(|killed: &Command, killer: &Command| {
                let msg = format!("superseded by {}", killer.verb());
                killed.set_state(CommandState::Failed, msg).unwrap();
            })
            .with_handler("expose", "take an exposure", background(&store))
            .with_handler("abort", "stop everything", |_: &Actor, _: &Command| {
                Ok(Outcome::Finished)
            })
    });

    let expose = fixture.actor.handle_line(1, "expose 30").unwrap();
    settle().await;
    let abort = fixture.actor.handle_line(1, "abort").unwrap();
    assert_eq!(expose.state(), CommandState::Failed);
    assert_eq!(expose.text_msg(), "superseded by abort");
    settle().await;
    assert_eq!(abort.state(), CommandState::Done);
}

#[tokio::test(start_paused = true)]
async fn test_builtin_verbs_bypass_the_queue() {
    let store = Arc::new(Mutex::new(Vec::new()));
    let policy = QueuePolicy::new().with_default_priority(Priority::Level(0));
    let fixture = fixture_with(|builder| {
        builder
            .with_policy(policy)
            .with_handler("track", "follow a target", background(&store))
    });

    let track = fixture.actor.handle_line(1, "track").unwrap();
    settle().await;
    assert_eq!(track.state(), CommandState::Running);

    let ping = fixture.actor.handle_line(1, "ping").unwrap();
    assert_eq!(ping.state(), CommandState::Done);
    assert_eq!(fixture.actor.queue().running().unwrap().verb(), "track");
}

#[tokio::test(start_paused = true)]
async fn test_conndev_and_disconndev() {
    let fixture = fixture();
    let conn = fixture.actor.handle_line(1, "2 conndev").unwrap();
    assert_eq!(conn.state(), CommandState::Running);
    settle().await;

    assert_eq!(conn.state(), CommandState::Done);
    assert!(fixture.mock.is_connected());
    let lines = fixture.sink.lines();
    let position = |line: &str| lines.iter().position(|l| l == line);
    let conn_state = position("1 2 i ConnState=Ready, NotAvailable");
    let done = position("1 2 : ");
    assert!(conn_state.is_some() && done.is_some(), "{lines:?}");
    assert!(conn_state < done, "{lines:?}");

    let disconn = fixture.actor.handle_line(1, "3 disconndev rotator").unwrap();
    settle().await;
    assert_eq!(disconn.state(), CommandState::Done);
    assert!(!fixture.mock.is_connected());
    let lines = fixture.sink.lines();
    let position = |line: &str| lines.iter().position(|l| l == line);
    let conn_state = position("1 3 w ConnState=NotConnected, NotAvailable");
    let done = position("1 3 : ");
    assert!(conn_state.is_some() && done.is_some(), "{lines:?}");
    assert!(conn_state < done, "{lines:?}");
}

#[tokio::test(start_paused = true)]
async fn test_conndev_unknown_slot_fails() {
    let fixture = fixture();
    let cmd = fixture.actor.handle_line(1, "conndev focuser").unwrap();
    assert_eq!(cmd.state(), CommandState::Failed);
    assert!(!fixture.mock.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_help_lists_verbs_and_devices() {
    let fixture = fixture_with(|builder| builder.with_device_verb("home", "rot", "home", ""));
    let cmd = fixture.actor.handle_line(1, "help").unwrap();
    assert_eq!(cmd.state(), CommandState::Done);

    let infos = fixture.sink.messages_with(MsgCode::Info);
    for expected in [
        "Text=\"ping: verify that actor is alive\"",
        "Text=\"home: send home to the rot device\"",
        "Text=\"conndev [slot ...]: connect devices (all if none given)\"",
        "Text=\"Direct device access commands:\"",
        "Text=\"rotator <text>: send <text> to device rotator\"",
    ] {
        assert!(infos.contains(&expected.to_string()), "{expected} missing from {infos:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_status_shows_queue_and_devices() {
    let fixture = fixture();
    let cmd = fixture.actor.handle_line(1, "6 status").unwrap();
    assert_eq!(cmd.state(), CommandState::Done);
    let lines = fixture.sink.lines();
    assert_eq!(lines[0], "1 6 i Actor=\"tcc\"; QueueLen=0; Running=\"\"");
    assert_eq!(lines[1], "1 6 w ConnState=NotConnected, NotAvailable");
    assert_eq!(lines[2], "1 6 : ");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_commands_and_disconnects() {
    let store = Arc::new(Mutex::new(Vec::new()));
    let policy = QueuePolicy::new().with_priority("slew", Priority::Level(1));
    let fixture = connected_fixture_with(|builder| {
        builder
            .with_policy(policy)
            .with_handler("slew", "slew the telescope", background(&store))
    })
    .await;

    let slew = fixture.actor.handle_line(1, "slew").unwrap();
    settle().await;
    assert_eq!(slew.state(), CommandState::Running);

    let done = fixture.actor.shutdown().unwrap();
    assert_eq!(slew.state(), CommandState::Failed);
    assert_eq!(slew.text_msg(), "disconnected");
    settle().await;
    assert_eq!(done.state(), CommandState::Done);
    assert!(!fixture.mock.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_builder_from_config() {
    let config = ActorConfig::from_toml_str(
        r#"
[actor]
name = "rotactor"

[priorities]
home = 1

[[devices.slots]]
slot = "rot"
name = "rotator"
verbs = ["home"]
"#,
    )
    .unwrap();
    let sink = RecordingSink::new();
    let mock = MockTransport::echo("rotator");
    let actor = builder(&sink, &mock)
        .with_config(&config)
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(actor.name(), "rotactor");
    assert!(actor.table().contains("home"));
    assert_eq!(
        actor.queue().policy().priority_of("home"),
        Some(Priority::Level(1))
    );
}
