//! Messages exchanged between the three processes of a container run.
//!
//! Downstream (parent to child and grandchild) carries single byte markers,
//! upstream (grandchild and child to parent) carries one line per message.

use std::fmt::Display;

use nix::unistd::Pid;

use crate::context::ProcessStatus;
use crate::RunBoxError;

const MARKER_USER_MAPPING_DONE: u8 = b'A';
const MARKER_PARENT_READY: u8 = b'B';
const MARKER_POST_RUN_DONE: u8 = b'C';

const TAG_GRANDCHILD_PID: u8 = b'P';
const TAG_TOOL_RESULT: u8 = b'R';
const TAG_SETUP_FAILED: u8 = b'E';

/// Progress of the parent through the startup handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
  /// The uid / gid map of the child is not written yet
  MappingPending,
  WaitingForGrandchildPid,
  /// The grandchild is in its cgroup, measurement is running
  MeasuringStarted,
  WaitingForResult,
  CopyingFiles,
  Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
  /// parent to child: filesystem writes are now safe
  UserMappingDone,
  /// grandchild to parent: its pid in the outer namespace
  GrandchildPid(Pid),
  /// parent to grandchild: measurement started, exec the tool
  ParentReady,
  /// child to parent: the grandchild terminated
  ToolResult(ProcessStatus),
  /// parent to child: result files are copied, the container may go away
  PostRunDone,
  /// child or grandchild to parent: container setup failed
  SetupFailed(String),
}

impl Message {
  pub fn is_downstream(&self) -> bool {
    matches!(
      self,
      Message::UserMappingDone | Message::ParentReady | Message::PostRunDone
    )
  }

  pub fn encode(&self) -> Vec<u8> {
    match self {
      Message::UserMappingDone => vec![MARKER_USER_MAPPING_DONE],
      Message::ParentReady => vec![MARKER_PARENT_READY],
      Message::PostRunDone => vec![MARKER_POST_RUN_DONE],
      Message::GrandchildPid(pid) => format!("{}{}\n", TAG_GRANDCHILD_PID as char, pid).into_bytes(),
      Message::ToolResult(status) => format!(
        "{}{} {} {} {}\n",
        TAG_TOOL_RESULT as char, status.raw, status.utime, status.stime, status.maxrss
      )
      .into_bytes(),
      Message::SetupFailed(reason) => {
        format!("{}{}\n", TAG_SETUP_FAILED as char, reason.replace('\n', " ")).into_bytes()
      }
    }
  }

  /// Decode a downstream marker
  pub fn decode_marker(byte: u8) -> Result<Message, RunBoxError> {
    match byte {
      MARKER_USER_MAPPING_DONE => Ok(Message::UserMappingDone),
      MARKER_PARENT_READY => Ok(Message::ParentReady),
      MARKER_POST_RUN_DONE => Ok(Message::PostRunDone),
      other => Err(RunBoxError::container(format!("Unexpected marker {:?} from parent", other as char))),
    }
  }

  /// Decode one upstream message
  pub fn decode(bytes: &[u8]) -> Result<Message, RunBoxError> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end_matches('\n');
    let wrong = || RunBoxError::container(format!("Malformed message {:?} from container", text));
    let mut chars = text.chars();
    let tag = chars.next().ok_or_else(wrong)?;
    let body = chars.as_str();
    match tag as u8 {
      TAG_GRANDCHILD_PID => {
        let pid = body.parse::<i32>().map_err(|_| wrong())?;
        if pid <= 0 {
          return Err(wrong());
        }
        Ok(Message::GrandchildPid(Pid::from_raw(pid)))
      }
      TAG_TOOL_RESULT => {
        let parts = body.split(' ').collect::<Vec<&str>>();
        if parts.len() != 4 {
          return Err(wrong());
        }
        Ok(Message::ToolResult(ProcessStatus {
          raw: parts[0].parse().map_err(|_| wrong())?,
          utime: parts[1].parse().map_err(|_| wrong())?,
          stime: parts[2].parse().map_err(|_| wrong())?,
          maxrss: parts[3].parse().map_err(|_| wrong())?,
        }))
      }
      TAG_SETUP_FAILED => Ok(Message::SetupFailed(body.to_string())),
      _ => Err(wrong()),
    }
  }
}

impl Display for Message {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Message::UserMappingDone => f.write_str("user-mapping-done"),
      Message::GrandchildPid(pid) => write!(f, "grandchild-pid({})", pid),
      Message::ParentReady => f.write_str("parent-ready"),
      Message::ToolResult(status) => write!(f, "tool-result({})", status.exit_code()),
      Message::PostRunDone => f.write_str("post-run-done"),
      Message::SetupFailed(reason) => write!(f, "setup-failed({})", reason),
    }
  }
}

impl HandshakeState {
  /// The state after `message` was sent or received in this state
  pub fn transition(self, message: &Message) -> Result<HandshakeState, RunBoxError> {
    use HandshakeState::*;
    match (self, message) {
      (_, Message::SetupFailed(reason)) => Err(RunBoxError::container(reason.clone())),
      (MappingPending, Message::UserMappingDone) => Ok(WaitingForGrandchildPid),
      (WaitingForGrandchildPid, Message::GrandchildPid(_)) => Ok(MeasuringStarted),
      (MeasuringStarted, Message::ParentReady) => Ok(WaitingForResult),
      (WaitingForResult, Message::ToolResult(_)) => Ok(CopyingFiles),
      (CopyingFiles, Message::PostRunDone) => Ok(Done),
      (state, message) => Err(RunBoxError::container(format!(
        "Unexpected message {} in handshake state {:?}",
        message, state
      ))),
    }
  }

  pub fn is_done(&self) -> bool {
    *self == HandshakeState::Done
  }
}
