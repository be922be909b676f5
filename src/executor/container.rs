use std::fs::{self, File};
use std::os::unix::prelude::RawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use log::{debug, error, info, warn};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::Signal;
use nix::unistd::{chdir, getgid, getuid, Pid};
use walkdir::WalkDir;

use crate::container::{
  activate_network_interface, block_all_signals, build_mount_view, clone_into_namespaces, close_open_fds,
  drop_capabilities, forward_signals_as_init, get_my_pid_from_procfs, install_seccomp_filter,
  is_container_system_config_file, map_user, mount_proc, pivot_into, reset_signal_mask, set_hostname, DirMode,
  DirectoryPolicy, MountLayout, MountOptions, CONTAINER_GID, CONTAINER_HOME, CONTAINER_HOSTNAME, CONTAINER_UID,
  DENIED_SYSCALLS, RESULT_FILES_DIR,
};
use crate::context::ProcessStatus;
use crate::executor::base::open_stdin;
use crate::executor::{
  set_env, BaseExecutor, ExecutionHooks, HandshakeState, Message, ProcessRequest, ProcessStarter, StartedProcess,
  TEMP_DIR_VARIABLES,
};
use crate::utils::output::open_output_file;
use crate::utils::pipe::{RunBoxPipe, RunBoxReadPipe, RunBoxWritePipe};
use crate::utils::{kill_process, GidType, UidType};
use crate::RunBoxError;

/// How long the parent waits for the grandchild to report its pid
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upstream messages are short lines
const MAX_MESSAGE_SIZE: usize = 1024;

/// Only this many moved result files are logged one by one
const MAX_LOGGED_TRANSFERS: usize = 100;

/// Options of the container that stay the same for every run
#[derive(Debug, Clone)]
pub struct ContainerSettings {
  pub policy: DirectoryPolicy,
  pub network_access: bool,
  /// Replace the host identity by the synthetic `/etc` files
  pub system_config: bool,
  /// Identity of the tool inside the container
  pub uid: UidType,
  pub gid: GidType,
}

impl ContainerSettings {
  pub fn new(policy: DirectoryPolicy, network_access: bool, system_config: bool) -> Self {
    let (uid, gid) = if system_config {
      (CONTAINER_UID, CONTAINER_GID)
    } else {
      (getuid().as_raw(), getgid().as_raw())
    };
    ContainerSettings {
      policy,
      network_access,
      system_config,
      uid,
      gid,
    }
  }
}

/// Starts the tool as grandchild inside fresh namespaces
pub struct ContainerStarter {
  base: BaseExecutor,
  settings: ContainerSettings,
}

/// What the child needs after clone, all borrowed from the parent's memory copy
struct ChildContext<'a> {
  settings: &'a ContainerSettings,
  layout: &'a MountLayout,
  mount_options: MountOptions,
  args: &'a [String],
  env: &'a [(String, String)],
  cwd: &'a Path,
  stdin: &'a File,
  output: &'a File,
  downstream: RawFd,
  upstream: RawFd,
  cpu_rlimit: Option<u64>,
}

impl ContainerStarter {
  pub fn new(base: BaseExecutor, settings: ContainerSettings) -> Self {
    ContainerStarter { base, settings }
  }

  pub fn settings(&self) -> &ContainerSettings {
    &self.settings
  }

  fn exposes_result_files(&self, request: &ProcessRequest) -> bool {
    request.output_dir.is_some()
      && !request.result_files.is_empty()
      && self.settings.policy.mode_for(Path::new("/")) == DirMode::Overlay
  }

  /// The parent side of the handshake, from the user mapping to the post run marker
  fn drive(
    &self,
    child_pid: Pid,
    downstream: &RunBoxWritePipe,
    upstream: &RunBoxReadPipe,
    request: &ProcessRequest,
    hooks: &mut dyn ExecutionHooks,
    layout: &MountLayout,
    expose_results: bool,
  ) -> Result<ProcessStatus, RunBoxError> {
    let mut state = HandshakeState::MappingPending;

    map_user(
      child_pid,
      self.settings.uid,
      self.settings.gid,
      getuid().as_raw(),
      getgid().as_raw(),
    );
    state = send(downstream, state, Message::UserMappingDone)?;

    let message = match upstream.read_timeout(MAX_MESSAGE_SIZE, HANDSHAKE_TIMEOUT)? {
      None => {
        return Err(RunBoxError::handshake(format!(
          "Child process #{}. did not report the grandchild within {}s",
          child_pid,
          HANDSHAKE_TIMEOUT.as_secs()
        )))
      }
      Some(bytes) if bytes.is_empty() => {
        return Err(RunBoxError::container(
          "Child process of the container terminated before starting the tool",
        ))
      }
      Some(bytes) => Message::decode(&bytes)?,
    };
    state = state.transition(&message)?;
    let grandchild_pid = match message {
      Message::GrandchildPid(pid) => pid,
      other => return Err(RunBoxError::container(format!("Expected grandchild pid, got {}", other))),
    };
    debug!(
      "Executing {} in grandchild #{}. via child #{}.",
      request.args.first().map(|a| a.as_str()).unwrap_or(""),
      grandchild_pid,
      child_pid
    );

    // The tool group becomes the root of the cgroup namespace of the tool
    request.cgroups.enable_for_children()?;
    let init_cgroups = request.cgroups.create_named_child("init")?;
    init_cgroups.add_task(child_pid)?;
    let tool_cgroups = request.cgroups.create_named_child("tool")?;
    tool_cgroups.add_task(grandchild_pid)?;

    // From now on stop() kills the tool and the child still reports its result
    self.base.register(grandchild_pid);
    self.base.unregister(child_pid);
    if self.base.is_stopped() {
      kill_process(grandchild_pid, Signal::SIGKILL);
    }

    let files_root = if expose_results {
      PathBuf::from(format!("/proc/{}/root", child_pid)).join(RESULT_FILES_DIR.trim_start_matches('/'))
    } else {
      layout.temp_base.clone()
    };
    hooks.started(&StartedProcess {
      pid: grandchild_pid,
      tool_cgroups,
      files_root: files_root.clone(),
    })?;
    state = send(downstream, state, Message::ParentReady)?;

    let bytes = upstream.read_to_end(MAX_MESSAGE_SIZE)?;
    self.base.unregister(grandchild_pid);
    if bytes.is_empty() {
      return Err(RunBoxError::container(
        "Child process of the container terminated without reporting the result of the tool",
      ));
    }
    let message = Message::decode(&bytes)?;
    let status = match (state.transition(&message), message) {
      (Ok(next), Message::ToolResult(status)) => {
        state = next;
        status
      }
      // The tool was told to run, so this is a failing exec
      (_, Message::SetupFailed(reason)) => return Err(RunBoxError::exec(reason)),
      (Err(err), _) => return Err(err),
      (Ok(_), other) => return Err(RunBoxError::container(format!("Expected tool result, got {}", other))),
    };
    debug!("Tool in grandchild #{}. terminated with {}", grandchild_pid, status.exit_code());
    hooks.finished(&status);

    // The mount namespace lives until the post run marker, so files are read before sending it
    let transferred = match request.output_dir {
      Some(output_dir) if !request.result_files.is_empty() => transfer_output_files(
        &files_root,
        request.cwd.as_path(),
        output_dir,
        request.result_files,
        self.settings.system_config,
      ),
      _ => Ok(0),
    };

    state = send(downstream, state, Message::PostRunDone)?;
    debug!("Container handshake reached {:?}", state);
    transferred?;
    Ok(status)
  }
}

fn send(pipe: &RunBoxWritePipe, state: HandshakeState, message: Message) -> Result<HandshakeState, RunBoxError> {
  let next = state.transition(&message)?;
  pipe.write(&message.encode())?;
  Ok(next)
}

/// Block until the parent sent the marker `expected`
fn expect_marker(pipe: &RunBoxReadPipe, expected: Message) -> Result<(), RunBoxError> {
  match pipe.read_byte()? {
    Some(byte) => {
      let message = Message::decode_marker(byte)?;
      if message != expected {
        return Err(RunBoxError::container(format!(
          "Expected {} from parent, got {}",
          expected, message
        )));
      }
      Ok(())
    }
    None => Err(RunBoxError::container(format!(
      "Parent closed the pipe instead of sending {}",
      expected
    ))),
  }
}

fn io_error(err: RunBoxError) -> std::io::Error {
  match err {
    RunBoxError::Nix(errno) => std::io::Error::from(errno),
    other => std::io::Error::new(std::io::ErrorKind::Other, other.message()),
  }
}

/// Runs in the grandchild between fork and exec
fn grandchild_setup(
  downstream: RawFd,
  upstream: RawFd,
  system_config: bool,
  cpu_rlimit: Option<u64>,
) -> Result<(), RunBoxError> {
  let downstream = RunBoxReadPipe::from_raw(downstream);
  let upstream = RunBoxWritePipe::from_raw(upstream);

  // The host /proc is still mounted here and shows our pid in the outer namespace
  let outer_pid = get_my_pid_from_procfs()?;
  mount_proc(system_config)?;

  upstream.write(&Message::GrandchildPid(outer_pid).encode())?;
  expect_marker(&downstream, Message::ParentReady)?;

  if let Err(err) = unshare(CloneFlags::CLONE_NEWCGROUP) {
    debug!("Cannot create cgroup namespace: {}", err);
  }
  install_seccomp_filter(DENIED_SYSCALLS);
  drop_capabilities(&[])?;
  reset_signal_mask()?;
  if let Some(limit) = cpu_rlimit {
    setrlimit(Resource::RLIMIT_CPU, limit, limit)?;
  }
  Ok(())
}

/// Runs as pid 1 of the new namespaces
/// `upstream` is taken and closed once the result is sent, the parent reads until EOF.
fn child_main(
  context: &ChildContext,
  downstream: &RunBoxReadPipe,
  upstream: &mut Option<RunBoxWritePipe>,
) -> Result<(), RunBoxError> {
  // Nothing may be written before our uid is mapped
  expect_marker(downstream, Message::UserMappingDone)?;
  debug!("Child: started with pid {} inside the container", std::process::id());

  close_open_fds(&[0, 1, 2])?;

  if !context.settings.network_access {
    activate_network_interface("lo")?;
  }
  if context.settings.system_config {
    set_hostname(CONTAINER_HOSTNAME)?;
  }

  build_mount_view(context.layout, &context.settings.policy, &context.mount_options)?;
  pivot_into(&context.layout.mount_base)?;
  chdir(context.cwd).map_err(|err| {
    RunBoxError::container(format!(
      "Cannot change into working directory {} inside container: {}",
      context.cwd.display(),
      err
    ))
  })?;

  let program = context
    .args
    .first()
    .ok_or_else(|| RunBoxError::exec("No command given"))?;
  let mut command = Command::new(program);
  command
    .args(&context.args[1..])
    .env_clear()
    .envs(context.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    .current_dir(context.cwd)
    .stdin(Stdio::from(context.stdin.try_clone()?))
    .stdout(Stdio::from(context.output.try_clone()?))
    .stderr(Stdio::from(context.output.try_clone()?));
  let (down_fd, up_fd) = (context.downstream, context.upstream);
  let (system_config, cpu_rlimit) = (context.settings.system_config, context.cpu_rlimit);
  unsafe {
    command.pre_exec(move || grandchild_setup(down_fd, up_fd, system_config, cpu_rlimit).map_err(io_error));
  }

  // SIGCHLD of a fast tool must not get lost before we wait for it
  block_all_signals()?;
  let grandchild = command
    .spawn()
    .map_err(|err| RunBoxError::exec(format!("Cannot start process {}: {}", program, err)))?;
  let grandchild_pid = Pid::from_raw(grandchild.id() as i32);

  drop_capabilities(&[])?;
  let status = forward_signals_as_init(grandchild_pid)?;
  debug!("Child: tool terminated with {}", status.exit_code());

  if let Some(pipe) = upstream.take() {
    pipe.write(&Message::ToolResult(status).encode())?;
  }

  expect_marker(downstream, Message::PostRunDone)?;
  Ok(())
}

impl ProcessStarter for ContainerStarter {
  fn name(&self) -> &'static str {
    "container"
  }

  fn prepare_environment(&self, _temp_dir: &Path, env: &mut Vec<(String, String)>) -> Result<(), RunBoxError> {
    if self.settings.system_config {
      set_env(env, "HOME", CONTAINER_HOME);
    }
    for key in TEMP_DIR_VARIABLES {
      set_env(env, key, "/tmp");
    }
    Ok(())
  }

  fn supports_result_files(&self) -> bool {
    true
  }

  fn run(&self, request: &ProcessRequest, hooks: &mut dyn ExecutionHooks) -> Result<ProcessStatus, RunBoxError> {
    let layout = MountLayout::new(request.temp_dir);
    layout.create()?;
    let expose_results = self.exposes_result_files(request);

    let stdin = open_stdin(request.stdin)?;
    let output = open_output_file(request.output)?;
    let downstream = RunBoxPipe::new()?;
    let upstream = RunBoxPipe::new()?;

    let context = ChildContext {
      settings: &self.settings,
      layout: &layout,
      mount_options: MountOptions {
        system_config: self.settings.system_config,
        memlimit: request.memlimit,
        expose_results,
      },
      args: request.args,
      env: &request.env,
      cwd: request.cwd.as_path(),
      stdin: &stdin,
      output: &output,
      downstream: downstream.fds().0,
      upstream: upstream.fds().1,
      cpu_rlimit: request.cpu_rlimit,
    };
    let child_pid = clone_into_namespaces(
      Box::new(|| {
        let downstream = RunBoxReadPipe::from_raw(context.downstream);
        let mut upstream = Some(RunBoxWritePipe::from_raw(context.upstream));
        match child_main(&context, &downstream, &mut upstream) {
          Ok(_) => 0,
          Err(err) => {
            error!("Child: {}", err);
            if let Some(pipe) = upstream {
              // The parent knows from the handshake state which kind of failure this is
              let _ = pipe.write(&Message::SetupFailed(err.message()).encode());
            }
            1
          }
        }
      }),
      !self.settings.network_access,
    )?;
    self.base.register(child_pid);
    info!("Started container with child #{}.", child_pid);
    if self.base.is_stopped() {
      kill_process(child_pid, Signal::SIGKILL);
    }

    // Our copies of the far ends must be closed, otherwise reads never see EOF
    let downstream = downstream.write()?;
    let upstream = upstream.read()?;

    let result = self.drive(child_pid, &downstream, &upstream, request, hooks, &layout, expose_results);
    if let Err(err) = &result {
      debug!("Container run failed, killing child #{}.: {}", child_pid, err);
      kill_process(child_pid, Signal::SIGKILL);
    }
    drop(downstream);
    drop(upstream);

    match self.base.wait(child_pid) {
      Ok(status) if !status.exit_code().is_success() && result.is_ok() => {
        warn!("Child process of the container terminated with {}", status.exit_code());
      }
      Ok(_) => {}
      Err(err) => warn!("Cannot wait for child #{}.: {}", child_pid, err),
    }
    result
  }
}

/// Compile result file patterns to globs relative to the root of the container
fn compile_patterns(cwd: &Path, patterns: &[String]) -> Result<GlobSet, RunBoxError> {
  let cwd = cwd.strip_prefix("/").unwrap_or(cwd);
  let mut builder = GlobSetBuilder::new();
  for pattern in patterns {
    let full = if let Some(absolute) = pattern.strip_prefix('/') {
      absolute.to_string()
    } else {
      cwd.join(pattern).to_string_lossy().to_string()
    };
    let full = full.trim_start_matches("./").trim_end_matches('/').to_string();
    let glob = GlobBuilder::new(&full)
      .literal_separator(true)
      .build()
      .map_err(|err| RunBoxError::cli(format!("Invalid result file pattern '{}': {}", pattern, err)))?;
    builder.add(glob);
  }
  builder
    .build()
    .map_err(|err| RunBoxError::cli(format!("Invalid result file patterns: {}", err)))
}

fn move_file(source: &Path, target: &Path) -> Result<(), RunBoxError> {
  if let Some(parent) = target.parent() {
    fs::create_dir_all(parent)?;
  }
  if fs::rename(source, target).is_err() {
    // Different file systems
    fs::copy(source, target)?;
    fs::remove_file(source)?;
  }
  Ok(())
}

/// Move every regular file below `files_root` matching one of `patterns` into `output_dir`.
/// Relative patterns are relative to `cwd` inside the container, a matching directory
/// matches everything below it. Returns the number of moved files.
pub fn transfer_output_files(
  files_root: &Path,
  cwd: &Path,
  output_dir: &Path,
  patterns: &[String],
  skip_system_config: bool,
) -> Result<usize, RunBoxError> {
  if !files_root.is_dir() {
    debug!("No result files, {} does not exist", files_root.display());
    return Ok(0);
  }
  let globs = compile_patterns(cwd, patterns)?;
  let cwd_relative = cwd.strip_prefix("/").unwrap_or(cwd);
  let results_dir = Path::new(RESULT_FILES_DIR.trim_start_matches('/'));

  let mut count = 0;
  for entry in WalkDir::new(files_root)
    .follow_links(false)
    .into_iter()
    .filter_map(|e| e.ok())
  {
    if !entry.file_type().is_file() {
      continue;
    }
    let relative = match entry.path().strip_prefix(files_root) {
      Ok(relative) => relative,
      Err(_) => continue,
    };
    if relative.starts_with(results_dir) {
      continue;
    }
    if skip_system_config && is_container_system_config_file(&Path::new("/").join(relative)) {
      continue;
    }
    if !relative.ancestors().any(|path| !path.as_os_str().is_empty() && globs.is_match(path)) {
      continue;
    }

    let target = output_dir.join(relative.strip_prefix(cwd_relative).unwrap_or(relative));
    if count < MAX_LOGGED_TRANSFERS {
      debug!("Transferring output file {} to {}", relative.display(), target.display());
    }
    move_file(entry.path(), &target)?;
    count += 1;
  }

  if count > MAX_LOGGED_TRANSFERS {
    debug!("Transferred {} more files", count - MAX_LOGGED_TRANSFERS);
  }
  if count > 0 {
    info!("Transferred {} result files to {}", count, output_dir.display());
  }
  Ok(count)
}
