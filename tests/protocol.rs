use nix::unistd::Pid;

use runbox::executor::{HandshakeState, Message};
use runbox::{ProcessStatus, RunBoxError};

mod common;

#[test]
fn handshake_walks_through_all_states() {
  common::setup();
  let status = ProcessStatus {
    raw: 0,
    utime: 0.25,
    stime: 0.5,
    maxrss: 2048,
  };
  let messages = vec![
    Message::UserMappingDone,
    Message::GrandchildPid(Pid::from_raw(4242)),
    Message::ParentReady,
    Message::ToolResult(status),
    Message::PostRunDone,
  ];
  let mut state = HandshakeState::MappingPending;
  for message in messages.iter() {
    assert!(!state.is_done());
    state = state.transition(message).unwrap();
  }
  assert_eq!(state, HandshakeState::Done);
}

#[test]
fn out_of_order_messages_are_rejected() {
  common::setup();
  assert!(HandshakeState::MappingPending
    .transition(&Message::ParentReady)
    .is_err());
  assert!(HandshakeState::WaitingForGrandchildPid
    .transition(&Message::ToolResult(ProcessStatus::default()))
    .is_err());
  assert!(HandshakeState::Done.transition(&Message::PostRunDone).is_err());
}

#[test]
fn setup_failure_ends_the_handshake() {
  common::setup();
  for state in [
    HandshakeState::WaitingForGrandchildPid,
    HandshakeState::WaitingForResult,
  ] {
    match state.transition(&Message::SetupFailed("mount failed".to_string())) {
      Err(RunBoxError::Container(msg)) => assert_eq!(msg, "mount failed"),
      other => panic!("Unexpected transition result {:?}", other.map(|_| ())),
    }
  }
}

#[test]
fn forwarded_failures_are_not_wrapped_twice() {
  common::setup();
  let failure = RunBoxError::exec("Cannot start process missing-tool: No such file or directory");
  assert_eq!(
    failure.message(),
    "Cannot start process missing-tool: No such file or directory"
  );

  let message = Message::decode(&Message::SetupFailed(failure.message()).encode()).unwrap();
  let err = HandshakeState::WaitingForGrandchildPid
    .transition(&message)
    .map(|_| ())
    .unwrap_err();
  assert_eq!(
    err.to_string(),
    "RunBox Container Error: Cannot start process missing-tool: No such file or directory"
  );
  assert_eq!(err.to_string().matches("Error:").count(), 1);
}

#[test]
fn downstream_markers_are_single_bytes() {
  common::setup();
  for message in [Message::UserMappingDone, Message::ParentReady, Message::PostRunDone] {
    assert!(message.is_downstream());
    let bytes = message.encode();
    assert_eq!(bytes.len(), 1);
    assert_eq!(Message::decode_marker(bytes[0]).unwrap(), message);
  }
  assert!(Message::decode_marker(b'Z').is_err());
}

#[test]
fn upstream_messages_are_lines() {
  common::setup();
  let status = ProcessStatus {
    raw: 9,
    utime: 1.5,
    stime: 0.125,
    maxrss: 1000,
  };
  let message = Message::ToolResult(status);
  assert!(!message.is_downstream());
  let bytes = message.encode();
  assert_eq!(bytes.last(), Some(&b'\n'));
  assert_eq!(Message::decode(&bytes).unwrap(), message);

  assert_eq!(
    Message::decode(b"P1234\n").unwrap(),
    Message::GrandchildPid(Pid::from_raw(1234))
  );
  assert_eq!(
    Message::decode(&Message::SetupFailed("line one\nline two".to_string()).encode()).unwrap(),
    Message::SetupFailed("line one line two".to_string())
  );
}

#[test]
fn malformed_messages_are_errors() {
  common::setup();
  assert!(Message::decode(b"").is_err());
  assert!(Message::decode(b"P\n").is_err());
  assert!(Message::decode(b"P-5\n").is_err());
  assert!(Message::decode(b"R1 2\n").is_err());
  assert!(Message::decode(b"Xhello\n").is_err());
}
