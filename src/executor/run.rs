use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use path_absolutize::Absolutize;

use crate::cgroup::{
  CgroupV1, CgroupVersion, Cgroups, BLKIO, CGROUP_NAME_PREFIX, CPUSET, FREEZER, IO, MEMORY,
};
use crate::context::{ProcessExitCode, ProcessStatus, ResourceLimits, RunBoxOption, RunBoxResult, TerminationReason};
use crate::executor::{
  set_env, BaseExecutor, ExecutionHooks, ProcessRequest, ProcessStarter, StartedProcess, StopHandle,
};
use crate::monitor::{
  spawn_files_monitor, spawn_oom_monitor, spawn_time_monitor, FilesLimits, KillAction, MonitorHandle, ReasonSlot,
  TimeLimits,
};
use crate::system::{cpu_count, CpuThrottleCheck, EnergyMeasurement, SwapCheck};
use crate::utils::kill_process;
use crate::utils::output::{reduce_file_size_if_necessary, write_output_header};
use crate::RunBoxError;

/// A run whose startup handshake stalls is attempted at most this often
pub const MAX_START_ATTEMPTS: usize = 3;

/// Extra seconds of RLIMIT_CPU on top of the hard limit, the time monitor is expected to kill first
const CPU_RLIMIT_OVERHEAD: u64 = 30;

/// Below this, cpu time measured by wait is too imprecise to judge the cgroup value
const CPUTIME_CHECK_MINIMUM: f64 = 0.5;

const CPUTIME_CHECK_TOLERANCE: f64 = 0.95;

/// Runs a tool with resource limits and measures what it used
pub struct RunExecutor {
  starter: Box<dyn ProcessStarter>,
  base: BaseExecutor,
  cgroups: Cgroups,
  keep_tmp: bool,
}

impl RunExecutor {
  /// Create an executor, discovering the cgroups of the current process.
  /// Without usable cgroups the executor still works, but cannot enforce most limits.
  pub fn new(starter: Box<dyn ProcessStarter>, base: BaseExecutor, keep_tmp: bool) -> Self {
    let cgroups = init_cgroups();
    Self::with_cgroups(starter, base, cgroups, keep_tmp)
  }

  pub fn with_cgroups(starter: Box<dyn ProcessStarter>, base: BaseExecutor, cgroups: Cgroups, keep_tmp: bool) -> Self {
    debug!("Using {} starter with cgroups {:?}", starter.name(), cgroups);
    RunExecutor {
      starter,
      base,
      cgroups,
      keep_tmp,
    }
  }

  pub fn cgroups(&self) -> &Cgroups {
    &self.cgroups
  }

  pub fn starter_name(&self) -> &'static str {
    self.starter.name()
  }

  /// Kill the current run, and refuse to start further ones
  pub fn stop(&self) {
    info!("Stopping the current run");
    self.base.stop();
  }

  pub fn stop_handle(&self) -> StopHandle {
    StopHandle::new(self.base.clone())
  }

  pub fn is_stopped(&self) -> bool {
    self.base.is_stopped()
  }

  /// Run the command of `option` once and measure it.
  /// Limit violations are part of the result, only setup problems are errors.
  pub fn execute(&self, option: &RunBoxOption) -> Result<RunBoxResult, RunBoxError> {
    let limits = option.limits().normalized();
    self.validate(option, &limits)?;

    let mut attempt = 1;
    loop {
      if self.is_stopped() {
        return Err(RunBoxError::exec("Execution was stopped before the tool was started"));
      }
      match self.execute_once(option, &limits) {
        Err(err) if err.is_retryable() && attempt < MAX_START_ATTEMPTS => {
          warn!(
            "Starting the tool failed in attempt {} of {}, trying again: {}",
            attempt, MAX_START_ATTEMPTS, err
          );
          attempt += 1;
        }
        other => return other,
      }
    }
  }

  fn validate(&self, option: &RunBoxOption, limits: &ResourceLimits) -> Result<(), RunBoxError> {
    if option.args().is_empty() {
      return Err(RunBoxError::cli("No command given"));
    }

    for (name, value) in [
      ("Soft time limit", limits.soft_cputime),
      ("Time limit", limits.hard_cputime),
      ("Wall time limit", limits.walltime),
    ] {
      if matches!(value, Some(value) if value <= 0.0) {
        return Err(RunBoxError::config(format!("{} must be positive", name)));
      }
    }
    if let (Some(soft), Some(hard)) = (limits.soft_cputime, limits.hard_cputime) {
      if soft > hard {
        return Err(RunBoxError::config(
          "Soft time limit cannot be larger than the hard time limit.",
        ));
      }
    }
    if limits.hard_cputime.is_some() && !self.cgroups.has_cputime() {
      warn!("Time limit can only be enforced by RLIMIT_CPU without a cpu accounting cgroup");
    }

    if let Some(cores) = &limits.cores {
      self.cgroups.handle_errors(&[CPUSET])?;
      if !self.cgroups.contains(CPUSET) {
        return Err(RunBoxError::config(
          "Cannot limit the CPU cores without cpuset cgroup.",
        ));
      }
      if cores.is_empty() {
        return Err(RunBoxError::config("Cannot execute run without any CPU core."));
      }
      let allowed = self.cgroups.read_allowed_cpus()?;
      let invalid = cores.iter().filter(|core| !allowed.contains(core)).collect::<Vec<_>>();
      if !invalid.is_empty() {
        return Err(RunBoxError::config(format!(
          "Cores {:?} are not allowed to be used",
          invalid
        )));
      }
    }

    if let Some(nodes) = &limits.memory_nodes {
      self.cgroups.handle_errors(&[CPUSET])?;
      if !self.cgroups.contains(CPUSET) {
        return Err(RunBoxError::config(
          "Cannot restrict memory nodes without cpuset cgroup.",
        ));
      }
      if nodes.is_empty() {
        return Err(RunBoxError::config("Cannot execute run without any memory node."));
      }
      let allowed = self.cgroups.read_allowed_memory_nodes()?;
      let invalid = nodes.iter().filter(|node| !allowed.contains(node)).collect::<Vec<_>>();
      if !invalid.is_empty() {
        return Err(RunBoxError::config(format!(
          "Memory nodes {:?} are not allowed to be used",
          invalid
        )));
      }
    }

    if let Some(memory) = limits.memory {
      self.cgroups.handle_errors(&[MEMORY])?;
      if !self.cgroups.contains(MEMORY) {
        return Err(RunBoxError::config(
          "Memory limit specified, but cannot be implemented without cgroup support.",
        ));
      }
      if memory == 0 {
        return Err(RunBoxError::config("Memory limit must be positive"));
      }
    }

    if matches!(limits.files_count, Some(0)) || matches!(limits.files_size, Some(0)) {
      return Err(RunBoxError::config("Limits for written files must be positive"));
    }

    if !option.result_files().is_empty() && !self.starter.supports_result_files() {
      return Err(RunBoxError::config(
        "Result files can only be retrieved in container mode.",
      ));
    }

    if let Some(cwd) = option.cwd() {
      if !cwd.is_dir() {
        return Err(RunBoxError::config(format!(
          "Working directory {} does not exist",
          cwd.display()
        )));
      }
    }
    if let Some(stdin) = option.stdin() {
      if !stdin.exists() {
        return Err(RunBoxError::config(format!("Input file {} does not exist", stdin.display())));
      }
    }
    Ok(())
  }

  fn execute_once(&self, option: &RunBoxOption, limits: &ResourceLimits) -> Result<RunBoxResult, RunBoxError> {
    write_output_header(option.output(), option.args())?;

    let temp_dir = tempfile::Builder::new()
      .prefix("runbox_")
      .tempdir()
      .map_err(|err| RunBoxError::fs(format!("Cannot create temp directory: {}", err)))?
      .into_path();
    debug!("Using temp directory {}", temp_dir.display());

    let subsystems = self.cgroups.subsystems().map(|s| s.as_str()).collect::<Vec<&str>>();
    let run_cgroups = match self.cgroups.create_fresh_child_cgroup(&subsystems, CGROUP_NAME_PREFIX) {
      Ok(run_cgroups) => run_cgroups,
      Err(err) => {
        self.remove_temp_dir(&temp_dir);
        return Err(err);
      }
    };
    debug!("Created cgroups {:?}", run_cgroups);

    let result = self.run_in_cgroup(option, limits, &temp_dir, &run_cgroups);

    run_cgroups.kill_all_tasks();
    run_cgroups.remove();
    self.remove_temp_dir(&temp_dir);
    result
  }

  fn remove_temp_dir(&self, temp_dir: &Path) {
    if self.keep_tmp {
      info!("Keeping temp directory {}", temp_dir.display());
      return;
    }
    if let Err(err) = remove_dir_all::remove_dir_all(temp_dir) {
      warn!("Failed to remove temp directory {}: {}", temp_dir.display(), err);
    }
  }

  fn setup_cgroup_limits(&self, run_cgroups: &Cgroups, limits: &ResourceLimits) -> Result<(), RunBoxError> {
    if let Some(cores) = &limits.cores {
      let cores = join_list(cores);
      run_cgroups.set_value(CPUSET, "cpus", &cores)?;
      debug!("Executing run with cores {}", cores);
    }
    if let Some(nodes) = &limits.memory_nodes {
      let nodes = join_list(nodes);
      run_cgroups.set_value(CPUSET, "mems", &nodes)?;
      debug!("Executing run with memory nodes {}", nodes);
    }
    if let Some(memory) = limits.memory {
      run_cgroups.set_memory_limit(memory)?;
      if !run_cgroups.backend().has_swap_accounting(run_cgroups) {
        warn!("Kernel does not support swap accounting, memory limit may be exceeded by swapping");
      }
      debug!("Effective memory limit is {:?} bytes", run_cgroups.read_memory_limit());
    }
    Ok(())
  }

  fn run_in_cgroup(
    &self,
    option: &RunBoxOption,
    limits: &ResourceLimits,
    temp_dir: &Path,
    run_cgroups: &Cgroups,
  ) -> Result<RunBoxResult, RunBoxError> {
    self.setup_cgroup_limits(run_cgroups, limits)?;

    let cwd = match option.cwd() {
      Some(cwd) => cwd.absolutize()?.to_path_buf(),
      None => std::env::current_dir()?,
    };
    let mut env = std::env::vars().collect::<Vec<(String, String)>>();
    for (key, value) in option.env() {
      set_env(&mut env, key.as_str(), value.as_str());
    }
    self.starter.prepare_environment(temp_dir, &mut env)?;

    let cpu_rlimit = limits.hard_cputime.map(|hard| {
      let hard = hard.ceil() as u64;
      if run_cgroups.has_cputime() {
        hard + CPU_RLIMIT_OVERHEAD
      } else {
        hard
      }
    });

    let output_dir = match option.output_dir() {
      Some(dir) => Some(dir.absolutize()?.to_path_buf()),
      None => None,
    };
    let request = ProcessRequest {
      args: option.args(),
      env,
      cwd,
      stdin: option.stdin().map(|p| p.as_path()),
      output: option.output().as_path(),
      cgroups: run_cgroups,
      temp_dir,
      memlimit: limits.memory,
      cpu_rlimit,
      output_dir: output_dir.as_deref(),
      result_files: option.result_files(),
    };

    let throttle_check = CpuThrottleCheck::new(limits.cores.as_deref());
    let swap_check = SwapCheck::new();

    let mut session = RunSession::new(run_cgroups, limits, option);
    info!("Starting command {}", option.args().join(" "));
    let outcome = self.starter.run(&request, &mut session);
    session.stop_monitors();
    // Processes left behind by the tool must not distort the measurements
    run_cgroups.kill_all_tasks();

    let mut result = RunBoxResult {
      starttime: session.starttime,
      walltime: session.walltime(),
      energy: session.energy_result.clone(),
      ..RunBoxResult::default()
    };
    let mut reason = session.reason.get();

    match outcome {
      Ok(status) => {
        result.exitcode = Some(status.exit_code());
        self.measure(run_cgroups, &status, &mut result);
      }
      Err(err) if self.is_stopped() => {
        debug!("Run was stopped: {}", err);
        result.exitcode = Some(ProcessExitCode::from_raw(Signal::SIGKILL as i32));
      }
      Err(RunBoxError::Exec(msg)) => {
        error!("Cannot execute {}: {}", option.program(), msg);
        reason = Some(TerminationReason::Failed);
      }
      Err(err) => return Err(err),
    }

    if reason.is_none() && self.is_stopped() {
      reason = Some(TerminationReason::Killed);
    }
    if reason.is_none() {
      reason = classify_limit_violation(run_cgroups, limits, &result);
    }
    result.termination_reason = reason;

    if let Some(max_size) = option.max_output_size() {
      if let Err(err) = reduce_file_size_if_necessary(option.output(), max_size) {
        warn!("Cannot shrink output file {}: {}", option.output().display(), err);
      }
    }

    if throttle_check.has_throttled() {
      warn!("CPU throttled itself during benchmarking due to overheating. Benchmark results are unreliable!");
    }
    if swap_check.has_swapped() {
      warn!("System has swapped during benchmarking. Benchmark results are unreliable!");
    }

    debug!(
      "Run finished with {} after {:.3}s wall time",
      result
        .termination_reason
        .map(|r| r.to_string())
        .unwrap_or_else(|| "no limit violation".to_string()),
      result.walltime
    );
    Ok(result)
  }

  fn measure(&self, run_cgroups: &Cgroups, status: &ProcessStatus, result: &mut RunBoxResult) {
    let wait_cputime = status.cputime();
    let cgroup_cputime = if run_cgroups.has_cputime() {
      run_cgroups.read_cputime()
    } else {
      None
    };
    result.cputime = Some(match cgroup_cputime {
      Some(cgroup_cputime) if wait_cputime > CPUTIME_CHECK_MINIMUM && wait_cputime * CPUTIME_CHECK_TOLERANCE > cgroup_cputime => {
        warn!(
          "Cputime measured by wait was {:.3}s, cputime measured by cgroup was only {:.3}s, perhaps measurement is flawed.",
          wait_cputime, cgroup_cputime
        );
        wait_cputime
      }
      Some(cgroup_cputime) => cgroup_cputime,
      None => wait_cputime,
    });
    result.cputime_per_cpu = run_cgroups.read_usage_per_cpu();

    result.memory = if run_cgroups.contains(MEMORY) {
      run_cgroups.read_max_mem_usage()
    } else {
      None
    };
    if result.memory.is_none() {
      debug!("Using maxrss of wait as memory measurement");
      result.memory = Some(status.maxrss * 1024).filter(|&memory| memory > 0);
    }

    result.blkio = run_cgroups.read_io_stat();
    result.pressure = run_cgroups.read_pressure();
  }
}

/// Reasons for a limit violation noticed only from the final measurements
fn classify_limit_violation(
  run_cgroups: &Cgroups,
  limits: &ResourceLimits,
  result: &RunBoxResult,
) -> Option<TerminationReason> {
  if let Some(limit) = limits.memory {
    let exhausted = match run_cgroups.version() {
      CgroupVersion::V1 => matches!(result.memory, Some(memory) if memory >= limit),
      CgroupVersion::V2 => matches!(run_cgroups.read_oom_kill_count(), Some(count) if count > 0),
    };
    if exhausted {
      return Some(TerminationReason::Memory);
    }
  }
  if let Some(limit) = limits.hard_cputime {
    // Killed by RLIMIT_CPU instead of the time monitor
    let signal = result.exitcode.and_then(|code| code.signal());
    let exceeded = matches!(result.cputime, Some(cputime) if cputime >= limit);
    if signal == Some(Signal::SIGXCPU as i32) || (signal == Some(Signal::SIGKILL as i32) && exceeded) {
      return Some(TerminationReason::Cputime);
    }
  }
  None
}

fn join_list(values: &[usize]) -> String {
  values.iter().map(|v| v.to_string()).collect::<Vec<String>>().join(",")
}

/// Measurement state of one run, fed by the starter through [`ExecutionHooks`]
struct RunSession<'a> {
  run_cgroups: &'a Cgroups,
  limits: &'a ResourceLimits,
  option: &'a RunBoxOption,
  reason: ReasonSlot,
  monitors: Vec<MonitorHandle>,
  start: Option<Instant>,
  starttime: Option<DateTime<Local>>,
  end: Option<Instant>,
  energy: Option<EnergyMeasurement>,
  energy_result: Vec<(String, f64)>,
}

impl<'a> RunSession<'a> {
  fn new(run_cgroups: &'a Cgroups, limits: &'a ResourceLimits, option: &'a RunBoxOption) -> Self {
    RunSession {
      run_cgroups,
      limits,
      option,
      reason: ReasonSlot::new(),
      monitors: vec![],
      start: None,
      starttime: None,
      end: None,
      energy: None,
      energy_result: vec![],
    }
  }

  fn walltime(&self) -> f64 {
    match (self.start, self.end) {
      (Some(start), Some(end)) => (end - start).as_secs_f64(),
      (Some(start), None) => start.elapsed().as_secs_f64(),
      _ => 0.0,
    }
  }

  fn stop_monitors(&mut self) {
    for monitor in self.monitors.drain(..) {
      debug!("Stopping {} monitor", monitor.name());
      monitor.cancel_and_join();
    }
    if let Some(energy) = self.energy.take() {
      self.energy_result = energy.stop();
    }
  }

  fn start_monitors(&mut self, process: &StartedProcess) -> Result<(), RunBoxError> {
    let tool_cgroups = process.tool_cgroups.clone();
    let pid = process.pid;
    let kill: KillAction = Arc::new(move || {
      tool_cgroups.kill_all_tasks();
      kill_process(pid, Signal::SIGKILL);
    });

    let limits = self.limits;
    if limits.soft_cputime.is_some() || limits.hard_cputime.is_some() || limits.walltime.is_some() {
      let tool_cgroups = process.tool_cgroups.clone();
      let cputime_subsystem = tool_cgroups.backend().cputime_subsystem();
      let terminate: KillAction = Arc::new(move || {
        let mut tasks = tool_cgroups.get_all_tasks(cputime_subsystem);
        if tasks.is_empty() {
          tasks.push(pid);
        }
        for task in tasks {
          kill_process(task, Signal::SIGTERM);
        }
      });
      let run_cgroups = self.run_cgroups.clone();
      let read_cputime = Arc::new(move || {
        if run_cgroups.has_cputime() {
          run_cgroups.read_cputime_now()
        } else {
          None
        }
      });
      let cpus = limits.cores.as_ref().map(|cores| cores.len()).unwrap_or_else(cpu_count);
      let time_limits = TimeLimits {
        soft_cputime: limits.soft_cputime,
        hard_cputime: limits.hard_cputime,
        walltime: limits.walltime,
      };
      self.monitors.push(spawn_time_monitor(
        time_limits,
        cpus,
        read_cputime,
        terminate,
        kill.clone(),
        self.reason.clone(),
      )?);
    }

    if limits.memory.is_some() && self.run_cgroups.version() == CgroupVersion::V1 {
      let tool_cgroups = process.tool_cgroups.clone();
      let signal: KillAction = Arc::new(move || {
        tool_cgroups.signal_all_tasks();
        kill_process(pid, Signal::SIGKILL);
      });
      match spawn_oom_monitor(self.run_cgroups, signal, kill.clone(), self.reason.clone()) {
        Ok(monitor) => self.monitors.push(monitor),
        Err(err) => warn!("Cannot monitor for out-of-memory events: {}", err),
      }
    }

    let files_limits = FilesLimits {
      count: limits.files_count,
      size: limits.files_size,
    };
    if !files_limits.is_empty() {
      self.monitors.push(spawn_files_monitor(
        process.files_root.clone(),
        files_limits,
        self.option.files_monitor_interval(),
        kill,
        self.reason.clone(),
      )?);
    }
    Ok(())
  }
}

impl ExecutionHooks for RunSession<'_> {
  fn started(&mut self, process: &StartedProcess) -> Result<(), RunBoxError> {
    self.starttime = Some(Local::now());
    self.energy = EnergyMeasurement::start();
    self.start = Some(Instant::now());
    debug!("Tool #{}. is running, files are below {}", process.pid, process.files_root.display());
    self.start_monitors(process)
  }

  fn finished(&mut self, status: &ProcessStatus) {
    self.end = Some(Instant::now());
    debug!("Tool finished with {} after {:.3}s", status.exit_code(), self.walltime());
    self.stop_monitors();
  }
}

impl Drop for RunSession<'_> {
  fn drop(&mut self) {
    self.stop_monitors();
  }
}

/// Discover the cgroups and check every subsystem a run may need.
/// Missing subsystems only fail the runs whose limits need them.
fn init_cgroups() -> Cgroups {
  let mut cgroups = match Cgroups::discover() {
    Ok(cgroups) => cgroups,
    Err(err) => {
      warn!("Cannot use cgroups, measurements and limits are restricted: {}", err);
      return Cgroups::from_backend(Arc::new(CgroupV1::new()), BTreeMap::new());
    }
  };

  let mut required = vec![cgroups.backend().cputime_subsystem(), MEMORY, CPUSET];
  match cgroups.version() {
    CgroupVersion::V1 => required.extend([FREEZER, BLKIO]),
    CgroupVersion::V2 => required.push(IO),
  }
  for subsystem in required.iter() {
    cgroups.require_subsystem(subsystem);
  }
  // Every run creates a child for all remaining subsystems, so they have to work as well
  let others = cgroups
    .subsystems()
    .filter(|subsystem| !required.contains(&subsystem.as_str()))
    .cloned()
    .collect::<Vec<String>>();
  for subsystem in others {
    cgroups.require_subsystem(&subsystem);
  }
  if !cgroups.has_cputime() {
    warn!("Cannot measure cpu time of the tool without cgroups, using the values reported by wait");
  }
  cgroups
}
