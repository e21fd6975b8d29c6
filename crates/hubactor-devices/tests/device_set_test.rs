//! Device set fan-out, connection and replacement tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use indexmap::IndexMap;

use hubactor_core::{Command, CommandState, MsgCode, RecordingSink};
use hubactor_devices::{
    ConnState, Device, DeviceError, DeviceSet, EchoHandler, MockTransport, SlotCmd, Transport,
};

struct Fixture {
    set: DeviceSet,
    mocks: Vec<Option<MockTransport>>,
    sink: RecordingSink,
}

fn make_device(name: &str, mock: &MockTransport, sink: &RecordingSink) -> Device {
    Device::builder(name, Arc::new(mock.clone()), Arc::new(EchoHandler::new()))
        .with_sink(Arc::new(sink.clone()))
        .build()
}

/// One slot per entry; `false` leaves the slot empty.
fn make_fixture(filled: &[bool]) -> Fixture {
    let sink = RecordingSink::new();
    let mut slots = Vec::new();
    let mut devices = Vec::new();
    let mut mocks = Vec::new();
    for (i, filled) in filled.iter().enumerate() {
        slots.push(format!("s{i}"));
        if *filled {
            let mock = MockTransport::echo(format!("dev{i}"));
            devices.push(Some(make_device(&format!("dev{i}"), &mock, &sink)));
            mocks.push(Some(mock));
        } else {
            devices.push(None);
            mocks.push(None);
        }
    }
    let set = DeviceSet::new(slots, devices, "ConnState", Arc::new(sink.clone()), None).unwrap();
    Fixture { set, mocks, sink }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn connected_fixture(filled: &[bool]) -> Fixture {
    let fixture = make_fixture(filled);
    let cmd = fixture.set.connect(None, None, None).unwrap();
    settle().await;
    assert_eq!(cmd.state(), CommandState::Done);
    fixture.sink.clear();
    fixture
}

fn mock(fixture: &Fixture, index: usize) -> &MockTransport {
    fixture.mocks[index].as_ref().unwrap()
}

fn dict(entries: &[(&str, &str)]) -> IndexMap<String, SlotCmd> {
    entries
        .iter()
        .map(|(slot, cmd)| (slot.to_string(), SlotCmd::from(*cmd)))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_connect_all_filled_slots() {
    let fixture = make_fixture(&[true, false, true]);
    let parent = Command::builder("conndev").with_ids(1, 4).build();
    fixture.set.connect(None, Some(parent.clone()), None).unwrap();
    assert_eq!(parent.state(), CommandState::Running);
    settle().await;

    assert_eq!(parent.state(), CommandState::Done);
    for index in [0, 2] {
        assert!(mock(&fixture, index).is_connected());
    }
    let last = fixture.sink.reports().pop().unwrap();
    assert_eq!(last.code, MsgCode::Info);
    assert_eq!(last.msg, "ConnState=Ready, NotAvailable, Ready");
    assert_eq!((last.user_id, last.cmd_id), (1, 4));
}

#[tokio::test(start_paused = true)]
async fn test_conn_state_reported_before_parent_finishes() {
    for connect in [true, false] {
        let fixture = if connect {
            make_fixture(&[true])
        } else {
            connected_fixture(&[true]).await
        };
        let parent = Command::builder("conndev").with_ids(1, 7).build();
        let seen_at_done = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen_at_done.clone();
        let sink = fixture.sink.clone();
        parent.add_callback(move |parent: &Command| {
            if parent.is_done() {
                seen_cb.store(sink.reports().len(), Ordering::SeqCst);
            }
        });
        let parent = if connect {
            fixture.set.connect(None, Some(parent), None).unwrap()
        } else {
            fixture.set.disconnect(None, Some(parent), None).unwrap()
        };
        settle().await;

        assert_eq!(parent.state(), CommandState::Done);
        let reports = fixture.sink.reports();
        let conn_state = reports
            .iter()
            .position(|report| report.msg.starts_with("ConnState=") && report.cmd_id == 7);
        assert!(
            conn_state.is_some_and(|index| index < seen_at_done.load(Ordering::SeqCst)),
            "{reports:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_reports_failed_device() {
    let fixture = make_fixture(&[true, true]);
    mock(&fixture, 1).set_connect_error(Some("refused"));
    let parent = fixture.set.connect(None, None, None).unwrap();
    settle().await;

    assert_eq!(parent.state(), CommandState::Failed);
    assert!(parent.text_msg().contains("refused"), "{}", parent.text_msg());
    let last = fixture.sink.reports().pop().unwrap();
    assert_eq!(last.code, MsgCode::Warning);
    assert_eq!(last.msg, "ConnState=Ready, NotConnected");
}

#[tokio::test(start_paused = true)]
async fn test_connect_empty_slot_by_name_is_error() {
    let fixture = make_fixture(&[true, false]);
    let err = fixture
        .set
        .connect(Some(vec!["s1".into()]), None, None)
        .unwrap_err();
    assert_eq!(err, DeviceError::EmptySlots(vec!["s1".into()]));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_subset() {
    let fixture = connected_fixture(&[true, true]).await;
    let parent = fixture
        .set
        .disconnect(Some(vec!["s1".into()]), None, None)
        .unwrap();
    settle().await;
    assert_eq!(parent.state(), CommandState::Done);
    assert!(mock(&fixture, 0).is_connected());
    assert!(!mock(&fixture, 1).is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_start_cmd_skips_empty_slots() {
    let fixture = connected_fixture(&[true, false, true]).await;
    let run = fixture.set.start_cmd("home", None, None, None).unwrap();
    settle().await;

    assert_eq!(run.parent().state(), CommandState::Done);
    assert_eq!(run.dev_cmds().keys().collect::<Vec<_>>(), vec!["s0", "s2"]);
    assert_eq!(mock(&fixture, 0).written(), vec!["1 home".to_string()]);
    assert_eq!(mock(&fixture, 2).written(), vec!["1 home".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_cmd_dict_failure_message() {
    let fixture = connected_fixture(&[true, true, true]).await;
    let parent = Command::new("move");
    let run = fixture
        .set
        .start_cmd_dict(
            dict(&[("s0", "move 1"), ("s1", "fail jammed"), ("s2", "")]),
            Some(parent.clone()),
            None,
        )
        .unwrap();
    settle().await;

    assert_eq!(parent.state(), CommandState::Failed);
    assert_eq!(parent.text_msg(), "\"move\" failed for s1: jammed");
    assert_eq!(run.failed_slots(), vec!["s1"]);
    assert!(mock(&fixture, 2).written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_identical_errors_are_shown_once() {
    let fixture = connected_fixture(&[true, true]).await;
    let parent = Command::new("move");
    fixture
        .set
        .start_cmd("fail jammed", None, Some(parent.clone()), None)
        .unwrap();
    settle().await;
    assert_eq!(parent.text_msg(), "\"move\" failed for s0, s1: jammed");
}

#[tokio::test(start_paused = true)]
async fn test_different_errors_are_joined() {
    let fixture = connected_fixture(&[true, true]).await;
    let parent = Command::new("move");
    fixture
        .set
        .start_cmd_dict(
            dict(&[("s0", "fail jammed"), ("s1", "fail limit")]),
            Some(parent.clone()),
            None,
        )
        .unwrap();
    settle().await;
    assert_eq!(parent.text_msg(), "\"move\" failed for s0, s1: jammed; limit");
}

#[tokio::test(start_paused = true)]
async fn test_command_list_per_slot() {
    let fixture = connected_fixture(&[true]).await;
    let mut cmds = IndexMap::new();
    cmds.insert(
        "s0".to_string(),
        SlotCmd::from(vec!["home".to_string(), "move 2".to_string()]),
    );
    let run = fixture.set.start_cmd_dict(cmds, None, None).unwrap();
    settle().await;
    assert_eq!(run.parent().state(), CommandState::Done);
    assert_eq!(
        mock(&fixture, 0).written(),
        vec!["1 home".to_string(), "2 move 2".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_call_func_chains_once_per_slot() {
    let fixture = connected_fixture(&[true, true]).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_cb = calls.clone();
    let run = fixture
        .set
        .start_cmd_dict_with(
            dict(&[("s0", "fail jammed"), ("s1", "move 1")]),
            move |info| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
                assert!(info.dev_cmd.is_done());
                info.dev_cmd
                    .did_fail()
                    .then(|| info.device.start_cmd("home", None, None))
            },
            None,
            None,
        )
        .unwrap();
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(run.dev_cmds()["s0"].cmd_str(), "home");
    assert_eq!(run.dev_cmds()["s0"].state(), CommandState::Done);
    assert_eq!(
        mock(&fixture, 0).written(),
        vec!["1 fail jammed".to_string(), "2 home".to_string()]
    );
    assert_eq!(run.parent().state(), CommandState::Failed);
    assert_eq!(run.failed_slots(), vec!["s0"]);
}

#[tokio::test(start_paused = true)]
async fn test_parent_waits_for_chained_command() {
    let fixture = connected_fixture(&[true]).await;
    let run = fixture
        .set
        .start_cmd_dict_with(
            dict(&[("s0", "move 1")]),
            |info| Some(info.device.start_cmd("wait", None, None)),
            None,
            None,
        )
        .unwrap();
    settle().await;
    assert!(run.parent().is_active());

    let chained = run.dev_cmds()["s0"].clone();
    chained.set_state(CommandState::Done, "").unwrap();
    assert_eq!(run.parent().state(), CommandState::Done);
}

#[tokio::test(start_paused = true)]
async fn test_replace_dev_swaps_and_disconnects_old() {
    let fixture = connected_fixture(&[true]).await;
    let old = fixture.set.get("s0").unwrap();
    let new_mock = MockTransport::echo("new");
    let new_dev = make_device("new", &new_mock, &fixture.sink);

    let parent = fixture
        .set
        .replace_dev("s0", Some(new_dev.clone()), None, None)
        .unwrap();
    settle().await;

    assert_eq!(parent.state(), CommandState::Done);
    assert!(fixture.set.get("s0").unwrap().ptr_eq(&new_dev));
    assert!(new_dev.is_ready());
    assert_eq!(old.conn_state(), ConnState::NotConnected);
    assert!(!mock(&fixture, 0).is_connected());
    assert_eq!(fixture.set.slot_from_dev_name("new").as_deref(), Some("s0"));
    assert_eq!(fixture.set.slot_from_dev_name("dev0"), None);
}

#[tokio::test(start_paused = true)]
async fn test_replace_dev_with_failed_connect_still_swaps() {
    let fixture = connected_fixture(&[true]).await;
    let new_mock = MockTransport::echo("new");
    new_mock.set_connect_error(Some("refused"));
    let new_dev = make_device("new", &new_mock, &fixture.sink);

    let parent = fixture
        .set
        .replace_dev("s0", Some(new_dev.clone()), None, None)
        .unwrap();
    settle().await;

    assert_eq!(parent.state(), CommandState::Done);
    assert!(fixture.set.get("s0").unwrap().ptr_eq(&new_dev));
    let warnings = fixture.sink.messages_with(MsgCode::Warning);
    assert!(
        warnings.contains(
            &"Text=\"Failed to initialize new s0 device new: connection failed: refused\""
                .to_string()
        ),
        "{warnings:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_replace_dev_with_none_empties_slot() {
    let fixture = connected_fixture(&[true, true]).await;
    let parent = fixture.set.replace_dev("s1", None, None, None).unwrap();
    assert_eq!(parent.state(), CommandState::Done);
    assert!(!fixture.set.dev_exists("s1"));
    assert_eq!(fixture.set.filled_slots(), vec!["s0"]);
    settle().await;
    assert!(!mock(&fixture, 1).is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_replace_dev_unknown_slot() {
    let fixture = make_fixture(&[true]);
    let err = fixture.set.replace_dev("nope", None, None, None).unwrap_err();
    assert_eq!(err, DeviceError::UnknownSlots(vec!["nope".into()]));
}

#[tokio::test(start_paused = true)]
async fn test_device_state_changes_are_shown() {
    let fixture = connected_fixture(&[true]).await;
    mock(&fixture, 0).drop_connection();
    let warnings = fixture.sink.messages_with(MsgCode::Warning);
    assert!(
        warnings.contains(&"ConnState=NotConnected".to_string()),
        "{warnings:?}"
    );
}
