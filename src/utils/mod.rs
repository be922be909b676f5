use std::env;
use std::fs;
use std::io;
use std::path::Path;

use flexi_logger::DeferredNow;
use log::{debug, error, info, warn, Record};
use nix::errno::Errno;
use nix::libc::{self, gid_t, uid_t};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

pub use pipe::{RunBoxPipe, RunBoxReadPipe, RunBoxWritePipe};

use crate::context::ProcessStatus;
use crate::RunBoxError;

pub mod output;
pub mod pipe;

pub type UidType = uid_t;

pub type GidType = gid_t;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Task successfully read from conf.json```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub fn parse_env(text: String) -> Result<(String, String), RunBoxError> {
  match text.split_once('=') {
    Some((key, _)) if key.is_empty() => {
      error!("Wrong environment variable string ({}) format", &text);
      Err(RunBoxError::cli("Wrong environment variable string format"))
    }
    Some((key, value)) => Ok((key.to_string(), value.to_string())),
    None => {
      let value = env::var(&text).unwrap_or_default();
      info!("Read environment variable {} = {}", &text, value);
      Ok((text, value))
    }
  }
}

/// Parse a list of numbers like `0-3,5,7-8`.
pub fn parse_int_list(text: &str) -> Result<Vec<usize>, RunBoxError> {
  let mut result = vec![];
  for part in text.split(',').map(|p| p.trim()).filter(|p| !p.is_empty()) {
    let wrong = || RunBoxError::cli(format!("Invalid number list '{}'", text));
    match part.split_once('-') {
      Some((start, end)) => {
        let start = start.trim().parse::<usize>().map_err(|_| wrong())?;
        let end = end.trim().parse::<usize>().map_err(|_| wrong())?;
        if start > end {
          return Err(wrong());
        }
        result.extend(start..=end);
      }
      None => result.push(part.parse::<usize>().map_err(|_| wrong())?),
    }
  }
  Ok(result)
}

/// Parse a memory amount in bytes, with an optional unit (`B`, `kB`, `MB`, `GB`, `TB`).
pub fn parse_memory_value(text: &str) -> Result<u64, RunBoxError> {
  let text = text.trim();
  let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
  let (number, unit) = text.split_at(split);
  let number = number
    .parse::<u64>()
    .map_err(|_| RunBoxError::cli(format!("Invalid memory value '{}'", text)))?;
  let factor: u64 = match unit.trim() {
    "" | "B" => 1,
    "kB" | "KB" | "K" | "k" => 1000,
    "MB" | "M" => 1000 * 1000,
    "GB" | "G" => 1000 * 1000 * 1000,
    "TB" | "T" => 1000 * 1000 * 1000 * 1000,
    "KiB" => 1 << 10,
    "MiB" => 1 << 20,
    "GiB" => 1 << 30,
    "TiB" => 1 << 40,
    other => return Err(RunBoxError::cli(format!("Unknown memory unit '{}'", other))),
  };
  number
    .checked_mul(factor)
    .ok_or_else(|| RunBoxError::cli(format!("Memory value '{}' is too large", text)))
}

/// Parse a time span in seconds, with an optional unit (`s`, `min`, `h`, `d`).
pub fn parse_timespan_value(text: &str) -> Result<f64, RunBoxError> {
  let text = text.trim();
  let split = text
    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
    .unwrap_or(text.len());
  let (number, unit) = text.split_at(split);
  let number = number
    .parse::<f64>()
    .map_err(|_| RunBoxError::cli(format!("Invalid time value '{}'", text)))?;
  let factor = match unit.trim() {
    "" | "s" => 1.0,
    "min" => 60.0,
    "h" => 60.0 * 60.0,
    "d" => 24.0 * 60.0 * 60.0,
    other => return Err(RunBoxError::cli(format!("Unknown time unit '{}'", other))),
  };
  Ok(number * factor)
}

/// Quote a string for use in a shell command line if necessary.
pub fn escape_string_shell(value: &str) -> String {
  let safe = !value.is_empty()
    && value
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
  if safe {
    value.to_string()
  } else {
    format!("'{}'", value.replace('\'', "'\"'\"'"))
  }
}

/// Whether `path` is `target` or lies somewhere below it.
pub fn path_is_below(path: &Path, target: &Path) -> bool {
  path.starts_with(target)
}

/// Read a whole (usually one-line) kernel file without its trailing newline.
pub fn read_file<P: AsRef<Path>>(path: P) -> io::Result<String> {
  let content = fs::read_to_string(path)?;
  Ok(content.trim_end_matches('\n').to_string())
}

pub fn write_file<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> io::Result<()> {
  fs::write(path, content)
}

/// Send a signal, tolerating processes that are already gone.
pub fn kill_process(pid: Pid, signal: Signal) {
  match kill(pid, signal) {
    Ok(_) => {}
    Err(Errno::ESRCH) => {
      debug!("Process #{}. is already gone, cannot send {}", pid, signal);
    }
    Err(err) => {
      warn!("Failed to send {} to process #{}.: {}", signal, pid, err);
    }
  }
}

fn timeval_seconds(tv: &libc::timeval) -> f64 {
  tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

fn wait4(target: libc::pid_t, options: libc::c_int) -> Result<Option<(Pid, ProcessStatus)>, RunBoxError> {
  let mut status: libc::c_int = 0;
  let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
  let result = unsafe { libc::wait4(target, &mut status, options, &mut usage) };
  if result < 0 {
    return Err(RunBoxError::Nix(Errno::last()));
  }
  if result == 0 {
    return Ok(None);
  }
  let status = ProcessStatus {
    raw: status,
    utime: timeval_seconds(&usage.ru_utime),
    stime: timeval_seconds(&usage.ru_stime),
    maxrss: usage.ru_maxrss.max(0) as u64,
  };
  Ok(Some((Pid::from_raw(result), status)))
}

/// Wait for `pid` (or any child) with `wait4`, collecting its resource usage.
/// Retries on EINTR. With `nohang`, `Ok(None)` means no child has terminated yet.
pub fn wait_any(pid: Option<Pid>, nohang: bool) -> Result<Option<(Pid, ProcessStatus)>, RunBoxError> {
  let target = pid.map(|p| p.as_raw()).unwrap_or(-1);
  let options = if nohang { libc::WNOHANG } else { 0 };
  loop {
    match wait4(target, options) {
      Err(RunBoxError::Nix(Errno::EINTR)) => continue,
      other => return other,
    }
  }
}

/// Block until `pid` terminated, a single `wait4` call that may fail with EINTR
pub fn wait_once(pid: Pid) -> Result<ProcessStatus, RunBoxError> {
  match wait4(pid.as_raw(), 0)? {
    Some((_, status)) => Ok(status),
    None => Err(RunBoxError::fork(format!("Process #{}. did not terminate", pid))),
  }
}
