use std::collections::BTreeSet;
use std::ffi::CString;
use std::fs::{self, File};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::container::reset_signal_mask;
use crate::context::ProcessStatus;
use crate::executor::{
  set_env, CancelToken, ExecutionHooks, ProcessRequest, ProcessStarter, StartedProcess, TEMP_DIR_VARIABLES,
};
use crate::utils::output::open_output_file;
use crate::utils::{kill_process, wait_once};
use crate::RunBoxError;

/// Registry of the processes this executor started, shared with whoever may stop them
#[derive(Clone)]
pub struct BaseExecutor {
  cancel: CancelToken,
  pids: Arc<Mutex<BTreeSet<Pid>>>,
}

impl BaseExecutor {
  pub fn new(cancel: CancelToken) -> Self {
    BaseExecutor {
      cancel,
      pids: Arc::new(Mutex::new(BTreeSet::new())),
    }
  }

  pub fn is_stopped(&self) -> bool {
    self.cancel.is_cancelled()
  }

  pub fn register(&self, pid: Pid) {
    match self.pids.lock() {
      Ok(mut pids) => {
        pids.insert(pid);
      }
      Err(poisoned) => {
        poisoned.into_inner().insert(pid);
      }
    }
  }

  pub fn unregister(&self, pid: Pid) {
    match self.pids.lock() {
      Ok(mut pids) => {
        pids.remove(&pid);
      }
      Err(poisoned) => {
        poisoned.into_inner().remove(&pid);
      }
    }
  }

  pub fn live_pids(&self) -> Vec<Pid> {
    match self.pids.lock() {
      Ok(pids) => pids.iter().copied().collect(),
      Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
    }
  }

  /// Wait for `pid`. An interruption caused by [`BaseExecutor::stop`] is retried once.
  pub fn wait(&self, pid: Pid) -> Result<ProcessStatus, RunBoxError> {
    let result = match wait_once(pid) {
      Err(RunBoxError::Nix(Errno::EINTR)) if self.is_stopped() => {
        debug!("Waiting for process #{}. was interrupted by stop, waiting again", pid);
        wait_once(pid)
      }
      other => other,
    };
    self.unregister(pid);
    result
  }

  /// Set the kill switch and kill every tracked process
  pub fn stop(&self) {
    self.cancel.cancel();
    for pid in self.live_pids() {
      debug!("Killing process #{}. because of stop request", pid);
      kill_process(pid, Signal::SIGKILL);
    }
  }
}

/// Stops the executor from another thread
#[derive(Clone)]
pub struct StopHandle(BaseExecutor);

impl StopHandle {
  pub(crate) fn new(base: BaseExecutor) -> Self {
    StopHandle(base)
  }

  pub fn stop(&self) {
    self.0.stop()
  }

  pub fn is_stopped(&self) -> bool {
    self.0.is_stopped()
  }
}

pub(crate) fn open_stdin(path: Option<&Path>) -> Result<File, RunBoxError> {
  let path = path.unwrap_or(Path::new("/dev/null"));
  File::open(path).map_err(|err| RunBoxError::fs(format!("Cannot open input file {}: {}", path.display(), err)))
}

fn task_file_c_strings(request: &ProcessRequest) -> Result<Vec<CString>, RunBoxError> {
  request
    .cgroups
    .task_files()
    .iter()
    .map(|path| {
      CString::new(path.as_os_str().as_bytes())
        .map_err(|_| RunBoxError::cgroup(format!("Invalid cgroup path {}", path.display())))
    })
    .collect()
}

/// Write "0" (the calling process) into a task file, usable between fork and exec
fn join_cgroup(task_file: &CString) -> std::io::Result<()> {
  let fd = unsafe { libc::open(task_file.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
  if fd < 0 {
    return Err(std::io::Error::last_os_error());
  }
  let written = unsafe { libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1) };
  let result = if written < 0 {
    Err(std::io::Error::last_os_error())
  } else {
    Ok(())
  };
  unsafe { libc::close(fd) };
  result
}

/// Starts the tool as a plain child process of ours
pub struct ForkStarter {
  base: BaseExecutor,
}

impl ForkStarter {
  pub fn new(base: BaseExecutor) -> Self {
    ForkStarter { base }
  }
}

impl ProcessStarter for ForkStarter {
  fn name(&self) -> &'static str {
    "fork"
  }

  fn prepare_environment(&self, temp_dir: &Path, env: &mut Vec<(String, String)>) -> Result<(), RunBoxError> {
    let home = temp_dir.join("home");
    let tmp = temp_dir.join("tmp");
    fs::create_dir_all(&home)?;
    fs::create_dir_all(&tmp)?;
    set_env(env, "HOME", home.to_string_lossy());
    for key in TEMP_DIR_VARIABLES {
      set_env(env, key, tmp.to_string_lossy());
    }
    Ok(())
  }

  fn supports_result_files(&self) -> bool {
    false
  }

  fn run(&self, request: &ProcessRequest, hooks: &mut dyn ExecutionHooks) -> Result<ProcessStatus, RunBoxError> {
    let program = request
      .args
      .first()
      .ok_or_else(|| RunBoxError::exec("No command given"))?;
    let stdin = open_stdin(request.stdin)?;
    let output = open_output_file(request.output)?;
    let stderr = output.try_clone()?;
    let task_files = task_file_c_strings(request)?;
    let cpu_rlimit = request.cpu_rlimit;

    let mut command = Command::new(program);
    command
      .args(&request.args[1..])
      .env_clear()
      .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
      .current_dir(&request.cwd)
      .stdin(Stdio::from(stdin))
      .stdout(Stdio::from(output))
      .stderr(Stdio::from(stderr));
    unsafe {
      command.pre_exec(move || {
        // Joining the cgroup before exec, so accounting covers the whole tool
        for task_file in task_files.iter() {
          join_cgroup(task_file)?;
        }
        if let Some(limit) = cpu_rlimit {
          setrlimit(Resource::RLIMIT_CPU, limit, limit)?;
        }
        reset_signal_mask().map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
        Ok(())
      });
    }

    let child = command
      .spawn()
      .map_err(|err| RunBoxError::exec(format!("Cannot start process {}: {}", program, err)))?;
    let pid = Pid::from_raw(child.id() as i32);
    self.base.register(pid);
    info!("Started process #{}. executing {}", pid, program);
    if self.base.is_stopped() {
      // stop() ran before the pid was registered
      kill_process(pid, Signal::SIGKILL);
    }

    // The tool joined its cgroup before exec, nothing it did is missed by starting the clock now
    if let Err(err) = hooks.started(&StartedProcess {
      pid,
      tool_cgroups: request.cgroups.clone(),
      files_root: request.temp_dir.to_path_buf(),
    }) {
      kill_process(pid, Signal::SIGKILL);
      let _ = self.base.wait(pid);
      return Err(err);
    }

    let status = self.base.wait(pid);
    match &status {
      Ok(status) => {
        debug!("Process #{}. terminated with {}", pid, status.exit_code());
        hooks.finished(status);
      }
      Err(err) => warn!("Waiting for process #{}. failed: {}", pid, err),
    }
    status
  }
}
