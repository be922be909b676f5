use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::info;
use nix::unistd::Pid;
use tempfile::tempdir;

use runbox::cgroup::{CgroupV1, CgroupV2, Cgroups, CPU, MEMORY};
use runbox::executor::{
  BaseExecutor, ExecutionHooks, ProcessRequest, ProcessStarter, StartedProcess, MAX_START_ATTEMPTS,
};
use runbox::{CancelToken, ProcessStatus, RunBoxBuilder, RunBoxError, RunBoxOption, RunExecutor, TerminationReason};

mod common;

/// Starts nothing, fails the first `failures` attempts with `failure`,
/// and otherwise fills the cgroup with the given control files
struct FakeStarter {
  attempts: Arc<AtomicUsize>,
  failures: usize,
  failure: fn() -> RunBoxError,
  status: ProcessStatus,
  control_files: Vec<(&'static str, &'static str)>,
}

impl FakeStarter {
  fn new(status: ProcessStatus) -> Self {
    FakeStarter {
      attempts: Arc::new(AtomicUsize::new(0)),
      failures: 0,
      failure: || RunBoxError::handshake("Grandchild did not report its pid in time"),
      status,
      control_files: vec![],
    }
  }

  fn failing(mut self, failures: usize, failure: fn() -> RunBoxError) -> Self {
    self.failures = failures;
    self.failure = failure;
    self
  }

  fn control_file(mut self, name: &'static str, content: &'static str) -> Self {
    self.control_files.push((name, content));
    self
  }
}

impl ProcessStarter for FakeStarter {
  fn name(&self) -> &'static str {
    "fake"
  }

  fn prepare_environment(&self, _temp_dir: &Path, _env: &mut Vec<(String, String)>) -> Result<(), RunBoxError> {
    Ok(())
  }

  fn supports_result_files(&self) -> bool {
    false
  }

  fn run(&self, request: &ProcessRequest, hooks: &mut dyn ExecutionHooks) -> Result<ProcessStatus, RunBoxError> {
    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt <= self.failures {
      return Err((self.failure)());
    }
    // Written as if the kernel accounted the tool
    if let Some(path) = request.cgroups.path(MEMORY).or_else(|| request.cgroups.path(CPU)) {
      for (name, content) in self.control_files.iter() {
        fs::write(path.join(name), content).unwrap();
      }
    }
    hooks.started(&StartedProcess {
      // Beyond pid_max, nothing can be hit by accident
      pid: Pid::from_raw(i32::MAX),
      tool_cgroups: request.cgroups.clone(),
      files_root: request.temp_dir.to_path_buf(),
    })?;
    hooks.finished(&self.status);
    Ok(self.status)
  }
}

fn no_cgroups() -> Cgroups {
  Cgroups::from_backend(Arc::new(CgroupV1::new()), BTreeMap::new())
}

/// A unified hierarchy in a plain directory
fn fake_v2_cgroups(root: &Path) -> Cgroups {
  let mut per_subsystem = BTreeMap::new();
  per_subsystem.insert(CPU.to_string(), root.to_path_buf());
  per_subsystem.insert(MEMORY.to_string(), root.to_path_buf());
  Cgroups::from_backend(Arc::new(CgroupV2::new()), per_subsystem)
}

fn executor(starter: FakeStarter, cgroups: Cgroups) -> RunExecutor {
  RunExecutor::with_cgroups(Box::new(starter), BaseExecutor::new(CancelToken::new()), cgroups, false)
}

fn option(output: PathBuf) -> RunBoxOption {
  RunBoxBuilder::fork()
    .command("true", Vec::<String>::new())
    .output(output)
    .into_option()
}

fn exited(utime: f64, stime: f64) -> ProcessStatus {
  ProcessStatus {
    raw: 0,
    utime,
    stime,
    maxrss: 1024,
  }
}

#[test]
fn stalled_handshake_is_retried() {
  common::setup();
  let dir = tempdir().unwrap();
  let starter = FakeStarter::new(exited(0.0, 0.0)).failing(MAX_START_ATTEMPTS - 1, || {
    RunBoxError::handshake("Grandchild did not report its pid in time")
  });
  let attempts = starter.attempts.clone();

  let result = executor(starter, no_cgroups())
    .execute(&option(dir.path().join("output.log")))
    .unwrap();

  assert_eq!(attempts.load(Ordering::SeqCst), MAX_START_ATTEMPTS);
  assert!(result.exitcode().unwrap().is_success());
  assert_eq!(result.termination_reason(), None);
}

#[test]
fn handshake_retries_are_bounded() {
  common::setup();
  let dir = tempdir().unwrap();
  let starter = FakeStarter::new(exited(0.0, 0.0)).failing(usize::MAX, || {
    RunBoxError::handshake("Grandchild did not report its pid in time")
  });
  let attempts = starter.attempts.clone();

  let result = executor(starter, no_cgroups()).execute(&option(dir.path().join("output.log")));

  assert!(matches!(result, Err(RunBoxError::Handshake(_))));
  assert_eq!(attempts.load(Ordering::SeqCst), MAX_START_ATTEMPTS);
}

#[test]
fn other_start_failures_are_not_retried() {
  common::setup();
  let dir = tempdir().unwrap();
  let starter = FakeStarter::new(exited(0.0, 0.0)).failing(usize::MAX, || RunBoxError::container("Cannot mount proc"));
  let attempts = starter.attempts.clone();

  let result = executor(starter, no_cgroups()).execute(&option(dir.path().join("output.log")));

  assert!(matches!(result, Err(RunBoxError::Container(_))));
  assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn oom_kill_counter_means_memory_limit() {
  common::setup();
  let root = tempdir().unwrap();
  let dir = tempdir().unwrap();
  let killed = ProcessStatus {
    raw: 9,
    ..exited(0.2, 0.1)
  };
  let starter = FakeStarter::new(killed)
    .control_file("memory.events", "low 0\nhigh 0\nmax 12\noom 1\noom_kill 1\n")
    .control_file("memory.peak", "67108864\n");
  let option = RunBoxBuilder::fork()
    .command("tail", vec!["/dev/zero"])
    .memory_limit(64 * 1024 * 1024)
    .output(dir.path().join("output.log"))
    .into_option();

  let result = executor(starter, fake_v2_cgroups(root.path())).execute(&option).unwrap();

  info!("Result: {:?}", result.entries());
  assert_eq!(result.termination_reason(), Some(TerminationReason::Memory));
  assert_eq!(result.exitcode().unwrap().signal(), Some(9));
  assert_eq!(result.memory(), Some(67108864));
}

#[test]
fn no_oom_kill_means_no_memory_limit() {
  common::setup();
  let root = tempdir().unwrap();
  let dir = tempdir().unwrap();
  let starter = FakeStarter::new(exited(0.2, 0.1))
    .control_file("memory.events", "low 0\nhigh 0\nmax 0\noom 0\noom_kill 0\n")
    .control_file("memory.peak", "1048576\n");
  let option = RunBoxBuilder::fork()
    .command("true", Vec::<String>::new())
    .memory_limit(64 * 1024 * 1024)
    .output(dir.path().join("output.log"))
    .into_option();

  let result = executor(starter, fake_v2_cgroups(root.path())).execute(&option).unwrap();

  assert_eq!(result.termination_reason(), None);
  assert_eq!(result.memory(), Some(1048576));
}

fn measured_cputime(status: ProcessStatus, cpu_stat: &'static str) -> f64 {
  let root = tempdir().unwrap();
  let dir = tempdir().unwrap();
  let starter = FakeStarter::new(status).control_file("cpu.stat", cpu_stat);
  let result = executor(starter, fake_v2_cgroups(root.path()))
    .execute(&option(dir.path().join("output.log")))
    .unwrap();
  result.cputime().unwrap()
}

#[test]
fn cputime_of_wait_wins_when_cgroup_measured_too_little() {
  common::setup();
  // Another process moved the tool out of its cgroup
  let cputime = measured_cputime(exited(2.0, 0.5), "usage_usec 1000000\nuser_usec 800000\nsystem_usec 200000\n");
  assert!((cputime - 2.5).abs() < 1e-9);
}

#[test]
fn cputime_of_cgroup_is_used_when_it_agrees() {
  common::setup();
  let cputime = measured_cputime(exited(2.0, 0.5), "usage_usec 2400000\nuser_usec 1900000\nsystem_usec 500000\n");
  assert!((cputime - 2.4).abs() < 1e-9);

  // Short runs are too imprecise to be judged
  let cputime = measured_cputime(exited(0.2, 0.1), "usage_usec 100000\n");
  assert!((cputime - 0.1).abs() < 1e-9);
}
