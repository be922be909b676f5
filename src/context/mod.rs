use std::fmt::Display;
use std::path::PathBuf;
use std::slice::Iter;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::executor::RunExecutor;
use crate::RunBoxError;

pub use builder::{RunBoxBuilder, RunBoxOptionBuilder};

mod builder;

/// Default interval of the file hierarchy monitor
pub const DEFAULT_FILES_MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Added to the hard cpu time limit to get the default wall time limit
pub const WALLTIME_LIMIT_OVERHEAD: f64 = 30.0;

/// RunBox top structure, one executor and the commands it runs one after another
pub struct RunBox {
  executor: RunExecutor,
  options: Vec<RunBoxOption>,
  results: Vec<RunBoxResult>,
}

impl RunBox {
  /// Run all the commands
  pub fn start(&mut self) -> Result<(), RunBoxError> {
    for option in self.options.iter() {
      let result = self.executor.execute(option)?;
      self.results.push(result);
    }
    Ok(())
  }

  /// List all the commands
  pub fn commands(&self) -> Iter<RunBoxOption> {
    self.options.iter()
  }

  /// Return the only command when there is just one command
  pub fn single(&self) -> Option<&RunBoxOption> {
    if self.options.len() == 1 {
      self.options.first()
    } else {
      None
    }
  }

  pub fn executor(&self) -> &RunExecutor {
    &self.executor
  }

  pub fn results(&self) -> &[RunBoxResult] {
    &self.results
  }

  /// Print `key=value` lines of every result
  pub fn report(&self) {
    for result in self.results.iter() {
      result.report();
    }
  }
}

/// Limits of one run, all optional
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
  /// Seconds of cpu time after which the tool gets SIGTERM
  pub soft_cputime: Option<f64>,
  /// Seconds of cpu time after which the tool is killed
  pub hard_cputime: Option<f64>,
  pub walltime: Option<f64>,
  /// Bytes
  pub memory: Option<u64>,
  pub cores: Option<Vec<usize>>,
  pub memory_nodes: Option<Vec<usize>>,
  pub files_count: Option<u64>,
  /// Bytes
  pub files_size: Option<u64>,
}

impl ResourceLimits {
  /// Fill in the limits that follow from the given ones
  pub fn normalized(&self) -> Self {
    let mut limits = self.clone();
    match (limits.soft_cputime, limits.hard_cputime) {
      (Some(soft), None) => limits.hard_cputime = Some(soft),
      (None, Some(hard)) => limits.soft_cputime = Some(hard),
      _ => {}
    }
    if limits.walltime.is_none() {
      limits.walltime = limits.hard_cputime.map(|hard| hard + WALLTIME_LIMIT_OVERHEAD);
    }
    limits
  }
}

/// Options of a single run
#[derive(Debug, Clone)]
pub struct RunBoxOption {
  pub(crate) args: Vec<String>,
  pub(crate) output: PathBuf,
  pub(crate) stdin: Option<PathBuf>,
  pub(crate) env: Vec<(String, String)>,
  pub(crate) cwd: Option<PathBuf>,
  pub(crate) limits: ResourceLimits,
  pub(crate) max_output_size: Option<u64>,
  pub(crate) output_dir: Option<PathBuf>,
  pub(crate) result_files: Vec<String>,
  pub(crate) files_monitor_interval: Duration,
}

impl RunBoxOption {
  pub fn new<S: Into<String>>(args: Vec<S>) -> Self {
    RunBoxOption {
      args: args.into_iter().map(|a| a.into()).collect(),
      output: PathBuf::from("output.log"),
      stdin: None,
      env: vec![],
      cwd: None,
      limits: ResourceLimits::default(),
      max_output_size: None,
      output_dir: None,
      result_files: vec![],
      files_monitor_interval: DEFAULT_FILES_MONITOR_INTERVAL,
    }
  }

  pub fn args(&self) -> &[String] {
    &self.args
  }

  pub fn program(&self) -> &str {
    self.args.first().map(|a| a.as_str()).unwrap_or("")
  }

  pub fn output(&self) -> &PathBuf {
    &self.output
  }

  pub fn stdin(&self) -> Option<&PathBuf> {
    self.stdin.as_ref()
  }

  pub fn env(&self) -> &[(String, String)] {
    &self.env
  }

  pub fn cwd(&self) -> Option<&PathBuf> {
    self.cwd.as_ref()
  }

  pub fn limits(&self) -> &ResourceLimits {
    &self.limits
  }

  pub fn max_output_size(&self) -> Option<u64> {
    self.max_output_size
  }

  pub fn output_dir(&self) -> Option<&PathBuf> {
    self.output_dir.as_ref()
  }

  pub fn result_files(&self) -> &[String] {
    &self.result_files
  }

  pub fn files_monitor_interval(&self) -> Duration {
    self.files_monitor_interval
  }
}

/// Why a run was terminated early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
  /// Soft cpu time limit, the tool got SIGTERM and may still finish
  CputimeSoft,
  Cputime,
  Walltime,
  Memory,
  FilesCount,
  FilesSize,
  /// Stopped from outside
  Killed,
  /// The tool could not be started
  Failed,
}

impl TerminationReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      TerminationReason::CputimeSoft => "cputime-soft",
      TerminationReason::Cputime => "cputime",
      TerminationReason::Walltime => "walltime",
      TerminationReason::Memory => "memory",
      TerminationReason::FilesCount => "files-count",
      TerminationReason::FilesSize => "files-size",
      TerminationReason::Killed => "killed",
      TerminationReason::Failed => "failed",
    }
  }
}

impl Display for TerminationReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Raw wait status of a process together with its resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessStatus {
  pub raw: i32,
  /// Seconds
  pub utime: f64,
  /// Seconds
  pub stime: f64,
  /// Kilobytes
  pub maxrss: u64,
}

impl ProcessStatus {
  pub fn exit_code(&self) -> ProcessExitCode {
    ProcessExitCode::from_raw(self.raw)
  }

  pub fn cputime(&self) -> f64 {
    self.utime + self.stime
  }
}

/// Decoded wait status: either a return value or a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExitCode {
  raw: i32,
  value: Option<i32>,
  signal: Option<i32>,
}

impl ProcessExitCode {
  pub fn from_raw(raw: i32) -> Self {
    let signal = raw & 0x7f;
    if signal == 0 {
      ProcessExitCode {
        raw,
        value: Some((raw >> 8) & 0xff),
        signal: None,
      }
    } else {
      ProcessExitCode {
        raw,
        value: None,
        signal: Some(signal),
      }
    }
  }

  pub fn raw(&self) -> i32 {
    self.raw
  }

  pub fn value(&self) -> Option<i32> {
    self.value
  }

  pub fn signal(&self) -> Option<i32> {
    self.signal
  }

  /// Exit code of the whole program: the signal number or the return value
  pub fn as_exit_code(&self) -> u8 {
    self.signal.or(self.value).unwrap_or(0) as u8
  }

  pub fn is_success(&self) -> bool {
    self.value == Some(0)
  }
}

impl Display for ProcessExitCode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match (self.value, self.signal) {
      (_, Some(signal)) => write!(f, "signal {}", signal),
      (Some(value), _) => write!(f, "return value {}", value),
      _ => write!(f, "exit code {}", self.raw),
    }
  }
}

/// Measurements of one run, produced once at its end
#[derive(Debug, Clone, Default)]
pub struct RunBoxResult {
  pub(crate) starttime: Option<DateTime<Local>>,
  pub(crate) walltime: f64,
  pub(crate) cputime: Option<f64>,
  pub(crate) cputime_per_cpu: Vec<(usize, f64)>,
  pub(crate) memory: Option<u64>,
  pub(crate) blkio: Option<(u64, u64)>,
  pub(crate) pressure: Vec<(String, f64)>,
  pub(crate) energy: Vec<(String, f64)>,
  pub(crate) exitcode: Option<ProcessExitCode>,
  pub(crate) termination_reason: Option<TerminationReason>,
}

impl RunBoxResult {
  pub fn starttime(&self) -> Option<&DateTime<Local>> {
    self.starttime.as_ref()
  }

  /// Seconds
  pub fn walltime(&self) -> f64 {
    self.walltime
  }

  /// Seconds
  pub fn cputime(&self) -> Option<f64> {
    self.cputime
  }

  pub fn cputime_per_cpu(&self) -> &[(usize, f64)] {
    &self.cputime_per_cpu
  }

  /// Peak memory in bytes
  pub fn memory(&self) -> Option<u64> {
    self.memory
  }

  /// Bytes read and written
  pub fn blkio(&self) -> Option<(u64, u64)> {
    self.blkio
  }

  pub fn pressure(&self) -> &[(String, f64)] {
    &self.pressure
  }

  /// Joules per energy domain, `cpu` is the total
  pub fn energy(&self) -> &[(String, f64)] {
    &self.energy
  }

  pub fn exitcode(&self) -> Option<&ProcessExitCode> {
    self.exitcode.as_ref()
  }

  pub fn termination_reason(&self) -> Option<TerminationReason> {
    self.termination_reason
  }

  /// Exit code of the program run by the binary
  pub fn as_exit_code(&self) -> u8 {
    self.exitcode.map(|code| code.as_exit_code()).unwrap_or(1)
  }

  /// All measurements as ordered `(key, value-with-unit)` pairs
  pub fn entries(&self) -> Vec<(String, String)> {
    let mut entries = vec![];
    if let Some(starttime) = &self.starttime {
      entries.push(("starttime".to_string(), starttime.to_rfc3339()));
    }
    if let Some(reason) = &self.termination_reason {
      entries.push(("terminationreason".to_string(), reason.to_string()));
    }
    if let Some(exitcode) = &self.exitcode {
      entries.push(("exitcode".to_string(), exitcode.raw().to_string()));
      if let Some(value) = exitcode.value() {
        entries.push(("returnvalue".to_string(), value.to_string()));
      }
      if let Some(signal) = exitcode.signal() {
        entries.push(("exitsignal".to_string(), signal.to_string()));
      }
    }
    entries.push(("walltime".to_string(), format!("{}s", self.walltime)));
    if let Some(cputime) = self.cputime {
      entries.push(("cputime".to_string(), format!("{}s", cputime)));
    }
    for (cpu, time) in self.cputime_per_cpu.iter() {
      entries.push((format!("cputime-cpu{}", cpu), format!("{}s", time)));
    }
    if let Some(memory) = self.memory {
      entries.push(("memory".to_string(), format!("{}B", memory)));
    }
    if let Some((read, write)) = self.blkio {
      entries.push(("blkio-read".to_string(), format!("{}B", read)));
      entries.push(("blkio-write".to_string(), format!("{}B", write)));
    }
    for (resource, time) in self.pressure.iter() {
      entries.push((format!("pressure-{}-some", resource), format!("{}s", time)));
    }
    for (domain, joules) in self.energy.iter() {
      let key = if domain == "cpu" {
        "cpuenergy".to_string()
      } else {
        format!("cpuenergy-{}", domain)
      };
      entries.push((key, format!("{}J", joules)));
    }
    entries
  }

  pub fn report(&self) {
    for (key, value) in self.entries() {
      println!("{}={}", key, value);
    }
  }
}
