use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDOUT_FILENO, unistd::isatty};

pub enum RunBoxError {
  Fork(String),
  Cgroup(String),
  Exec(String),
  Nix(Errno),
  Fs(String),
  Cli(String),
  Logger(FlexiLoggerError),
  /// Requested limit can not be enforced on this machine
  Config(String),
  /// Namespace / mount / capability setup failed, message carries a hint
  Container(String),
  /// The container startup handshake stalled, the whole run may be retried
  Handshake(String),
}

pub enum RunBoxExit {
  Ok,
  /// Exit with the return value (or signal number) of the executed tool
  Code(u8),
  Err(RunBoxError),
}

impl RunBoxError {
  pub fn fork<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Fork(msg.into())
  }

  pub fn cgroup<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Cgroup(msg.into())
  }

  pub fn exec<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Exec(msg.into())
  }

  pub fn fs<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Fs(msg.into())
  }

  pub fn cli<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Cli(msg.into())
  }

  pub fn config<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Config(msg.into())
  }

  pub fn container<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Container(msg.into())
  }

  pub fn handshake<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Handshake(msg.into())
  }

  /// The message without the error family, for passing it on to another process
  pub fn message(&self) -> String {
    match &self {
      RunBoxError::Fork(msg)
      | RunBoxError::Cgroup(msg)
      | RunBoxError::Exec(msg)
      | RunBoxError::Fs(msg)
      | RunBoxError::Cli(msg)
      | RunBoxError::Config(msg)
      | RunBoxError::Container(msg)
      | RunBoxError::Handshake(msg) => msg.clone(),
      RunBoxError::Nix(errno) => errno.to_string(),
      RunBoxError::Logger(err) => err.to_string(),
    }
  }

  /// Only handshake stalls are worth starting the run again
  pub fn is_retryable(&self) -> bool {
    matches!(self, RunBoxError::Handshake(_))
  }
}

impl Debug for RunBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for RunBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      RunBoxError::Fork(msg) => f.write_fmt(format_args!("RunBox Fork Error: {}", msg)),
      RunBoxError::Cgroup(msg) => f.write_fmt(format_args!("RunBox Cgroup Error: {}", msg)),
      RunBoxError::Exec(msg) => f.write_fmt(format_args!("RunBox Exec Error: {}", msg)),
      RunBoxError::Nix(errno) => f.write_fmt(format_args!("RunBox Nix Error: {}", errno)),
      RunBoxError::Fs(msg) => f.write_fmt(format_args!("RunBox File System Error: {}", msg)),
      RunBoxError::Cli(msg) => f.write_fmt(format_args!("RunBox CLI Error: {}", msg)),
      RunBoxError::Logger(err) => f.write_fmt(format_args!("RunBox Logger Error: {}", err)),
      RunBoxError::Config(msg) => f.write_fmt(format_args!("RunBox Config Error: {}", msg)),
      RunBoxError::Container(msg) => f.write_fmt(format_args!("RunBox Container Error: {}", msg)),
      RunBoxError::Handshake(msg) => f.write_fmt(format_args!("RunBox Handshake Error: {}", msg)),
    }
  }
}

impl From<Errno> for RunBoxError {
  fn from(errno: Errno) -> Self {
    RunBoxError::Nix(errno)
  }
}

impl From<std::io::Error> for RunBoxError {
  fn from(err: std::io::Error) -> Self {
    RunBoxError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for RunBoxError {
  fn from(err: FlexiLoggerError) -> Self {
    RunBoxError::Logger(err)
  }
}

impl Error for RunBoxError {}

impl Termination for RunBoxExit {
  fn report(self) -> ExitCode {
    match self {
      RunBoxExit::Ok => ExitCode::SUCCESS.report(),
      RunBoxExit::Code(code) => ExitCode::from(code).report(),
      RunBoxExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              format!(
                "{{\n  \"ok\": false,\n  \"type\": \"{}\",\n  \"message\": \"{}\"\n}}",
                prefix,
                message.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
              )
            }
          }
          None => {
            format!("{}", err)
          }
        };
        eprintln!("{}", text);
        ExitCode::FAILURE.report()
      }
    }
  }
}
