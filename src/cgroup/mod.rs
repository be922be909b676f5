use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Display};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::{access, AccessFlags, Gid, Group, Pid, Uid, User};
use walkdir::WalkDir;

pub use v1::CgroupV1;
pub use v2::{CgroupV2, KILL};

use crate::utils::{escape_string_shell, kill_process, read_file, write_file};
use crate::RunBoxError;

mod v1;
mod v2;

pub use v1::{parse_blkio_service_bytes, parse_usage_percpu};
pub use v2::{parse_cpu_stat_usage, parse_io_stat, parse_key_value_lines, parse_pressure_total};

pub const BLKIO: &str = "blkio";
pub const CPU: &str = "cpu";
pub const CPUACCT: &str = "cpuacct";
pub const CPUSET: &str = "cpuset";
pub const FREEZER: &str = "freezer";
pub const IO: &str = "io";
pub const MEMORY: &str = "memory";
pub const PIDS: &str = "pids";

/// Prefix of every cgroup created for a single run
pub const CGROUP_NAME_PREFIX: &str = "benchmark_";

const STABLE_READ_ATTEMPTS: usize = 10;

/// Rounds of SIGKILL, SIGINT and SIGTERM before a process that does not die is left behind
const MAX_KILL_ROUNDS: u64 = 4;

const KILL_ROUND_DELAY_MS: u64 = 200;

const CGRULESENGD_SOCKET: &str = "/var/run/cgred.socket";

const CGRULESENGD_SUCCESS: &[u8] = b"SUCCESS_STORE_PID";

/// libcgroup flag asking the daemon to also leave children of the process alone
const CGROUP_DAEMON_UNCHANGE_CHILDREN: i32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
  V1,
  V2,
}

/// Why a subsystem could not be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemFailure {
  PermissionDenied,
  NotMounted,
  Unusable,
}

/// Version specific behaviour of a cgroup hierarchy.
/// Paths are managed by [`Cgroups`], the backend knows file names and formats.
pub trait CgroupBackend: Send + Sync {
  fn version(&self) -> CgroupVersion;

  /// Directory of the current process for every usable subsystem
  fn find_own_cgroups(&self) -> Result<BTreeMap<String, PathBuf>, RunBoxError>;

  /// Name of the file that lists (and accepts) member processes
  fn task_file(&self) -> &'static str;

  /// Subsystem whose files contain cpu time accounting
  fn cputime_subsystem(&self) -> &'static str;

  /// Whether new child groups need `cpuset.cpus` and `cpuset.mems` copied from their parent
  fn copies_cpuset(&self) -> bool;

  /// Name of the file (below the cpuset subsystem) listing the usable cpus / memory nodes
  fn allowed_cpuset_option(&self, option: &str) -> String;

  fn can_freeze(&self, cgroups: &Cgroups) -> bool;

  fn freeze(&self, cgroups: &Cgroups, frozen: bool) -> Result<(), RunBoxError>;

  /// Kill every process in the sub-tree with a single kernel operation, if supported
  fn kill_atomically(&self, _cgroups: &Cgroups) -> bool {
    false
  }

  /// Whether a freshly created child group really got the subsystem
  fn child_supports(&self, _child: &Cgroups, _subsystem: &str) -> bool {
    true
  }

  /// Make all subsystems of this group available to groups created below it
  fn enable_for_children(&self, _cgroups: &Cgroups) -> Result<(), RunBoxError> {
    Ok(())
  }

  /// Cumulative cpu time in seconds, read once
  fn read_cputime_now(&self, cgroups: &Cgroups) -> Option<f64>;

  fn read_cputime(&self, cgroups: &Cgroups) -> Option<f64>;

  fn read_usage_per_cpu(&self, cgroups: &Cgroups) -> Vec<(usize, f64)>;

  fn read_max_mem_usage(&self, cgroups: &Cgroups) -> Option<u64>;

  fn read_oom_kill_count(&self, cgroups: &Cgroups) -> Option<u64>;

  /// Bytes read and written by block devices
  fn read_io_stat(&self, cgroups: &Cgroups) -> Option<(u64, u64)>;

  /// Total stall time in seconds per resource
  fn read_pressure(&self, cgroups: &Cgroups) -> Vec<(String, f64)>;

  fn set_memory_limit(&self, cgroups: &Cgroups, limit: u64) -> Result<(), RunBoxError>;

  fn read_memory_limit(&self, cgroups: &Cgroups) -> Option<u64>;

  fn has_swap_accounting(&self, cgroups: &Cgroups) -> bool;
}

/// A set of cgroup directories, one per subsystem, all belonging to the same logical group
#[derive(Clone)]
pub struct Cgroups {
  backend: Arc<dyn CgroupBackend>,
  per_subsystem: BTreeMap<String, PathBuf>,
  paths: BTreeSet<PathBuf>,
  unusable: BTreeMap<String, (SubsystemFailure, Option<PathBuf>)>,
}

impl Cgroups {
  /// Find the cgroups of the current process and select the matching backend
  pub fn discover() -> Result<Self, RunBoxError> {
    debug!("Analyzing /proc/mounts and /proc/self/cgroup for determining cgroups");
    let backend: Arc<dyn CgroupBackend> = if cgroups_rs::hierarchies::is_cgroup2_unified_mode() {
      Arc::new(CgroupV2::new())
    } else {
      Arc::new(CgroupV1::new())
    };
    let per_subsystem = backend.find_own_cgroups()?;
    info!(
      "Discovered cgroup {:?} hierarchy with subsystems {}",
      backend.version(),
      per_subsystem.keys().cloned().collect::<Vec<String>>().join(",")
    );
    Ok(Self::from_backend(backend, per_subsystem))
  }

  pub fn from_backend(backend: Arc<dyn CgroupBackend>, per_subsystem: BTreeMap<String, PathBuf>) -> Self {
    let paths = per_subsystem.values().cloned().collect();
    Cgroups {
      backend,
      per_subsystem,
      paths,
      unusable: BTreeMap::new(),
    }
  }

  fn with_paths(&self, per_subsystem: BTreeMap<String, PathBuf>) -> Self {
    Self::from_backend(self.backend.clone(), per_subsystem)
  }

  pub fn version(&self) -> CgroupVersion {
    self.backend.version()
  }

  pub fn backend(&self) -> &dyn CgroupBackend {
    self.backend.as_ref()
  }

  pub fn contains(&self, subsystem: &str) -> bool {
    self.per_subsystem.contains_key(subsystem)
  }

  pub fn path(&self, subsystem: &str) -> Option<&Path> {
    self.per_subsystem.get(subsystem).map(|p| p.as_path())
  }

  pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
    self.paths.iter()
  }

  pub fn subsystems(&self) -> impl Iterator<Item = &String> {
    self.per_subsystem.keys()
  }

  pub fn is_empty(&self) -> bool {
    self.per_subsystem.is_empty()
  }

  /// Check whether a subsystem exists and new child groups can be created for it.
  /// Unusable subsystems are dropped and remembered for [`Cgroups::handle_errors`].
  pub fn require_subsystem(&mut self, subsystem: &str) -> bool {
    let path = match self.per_subsystem.get(subsystem) {
      Some(path) => path.clone(),
      None => {
        warn!(
          "Cgroup subsystem {} is not available, please make sure it is supported by your kernel and available",
          subsystem
        );
        self
          .unusable
          .entry(subsystem.to_string())
          .or_insert((SubsystemFailure::NotMounted, None));
        return false;
      }
    };

    let test_cgroup = self.create_fresh_child_cgroup(&[subsystem], "runbox_test_");
    let test_cgroup = test_cgroup.and_then(|child| {
      let supported = self.backend.child_supports(&child, subsystem);
      child.remove();
      if supported {
        Ok(())
      } else {
        Err(RunBoxError::cgroup(format!(
          "Subsystem {} is not enabled for child groups of {}",
          subsystem,
          path.display()
        )))
      }
    });
    match test_cgroup {
      Ok(_) => true,
      Err(err) => {
        warn!(
          "Cannot use cgroup {} for subsystem {}, reason: {}",
          path.display(),
          subsystem,
          err
        );
        let failure = if is_permission_error(&err) {
          SubsystemFailure::PermissionDenied
        } else {
          SubsystemFailure::Unusable
        };
        self.unusable.insert(subsystem.to_string(), (failure, Some(path)));
        self.per_subsystem.remove(subsystem);
        self.paths = self.per_subsystem.values().cloned().collect();
        false
      }
    }
  }

  /// Abort with an explanation if one of the `critical` subsystems turned out to be unusable
  pub fn handle_errors(&self, critical: &[&str]) -> Result<(), RunBoxError> {
    let failed = critical
      .iter()
      .filter(|subsystem| !self.contains(subsystem))
      .map(|subsystem| subsystem.to_string())
      .collect::<Vec<String>>();
    if failed.is_empty() {
      return Ok(());
    }

    let denied = failed
      .iter()
      .filter_map(|subsystem| match self.unusable.get(subsystem) {
        Some((SubsystemFailure::PermissionDenied, Some(path))) => Some(path.clone()),
        _ => None,
      })
      .collect::<BTreeSet<PathBuf>>();

    if !denied.is_empty() {
      let paths = denied
        .iter()
        .map(|p| escape_string_shell(&p.to_string_lossy()))
        .collect::<Vec<String>>()
        .join(" ");
      return Err(RunBoxError::cgroup(format!(
        "Required cgroups are not available because of missing permissions.{}\n\nAs a temporary workaround, you can also run\n\"sudo chmod o+wt {}\"\nNote that this will grant permissions to more users than typically desired and it will only last until the next reboot.",
        permission_hint(&denied),
        paths
      )));
    }

    if self.version() == CgroupVersion::V2 {
      let base = self
        .paths
        .iter()
        .next()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/sys/fs/cgroup".to_string());
      return Err(RunBoxError::cgroup(format!(
        "Required cgroup controllers {} are not available. This system uses cgroup v2 exclusively and these controllers are not delegated to {}.\nEnable them in the cgroup.subtree_control of the parent, or start this program with \"systemd-run --user --scope -p Delegate=yes\".",
        failed.join(", "),
        base
      )));
    }

    Err(RunBoxError::cgroup(format!(
      "Required cgroups {} are not available.\nIf you are running this program within a container, please make \"/sys/fs/cgroup\" available.",
      failed.join(", ")
    )))
  }

  /// Create a new uniquely named child group for the given subsystems.
  /// Subsystems sharing a directory share the new child as well.
  pub fn create_fresh_child_cgroup(&self, subsystems: &[&str], prefix: &str) -> Result<Cgroups, RunBoxError> {
    let mut per_subsystem = BTreeMap::new();
    let mut per_parent: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();

    for subsystem in subsystems {
      let parent = self
        .per_subsystem
        .get(*subsystem)
        .ok_or_else(|| RunBoxError::cgroup(format!("Cgroup subsystem {} is not available", subsystem)))?;
      if let Some(created) = per_parent.get(parent) {
        per_subsystem.insert(subsystem.to_string(), created.clone());
        continue;
      }

      let created = tempfile::Builder::new()
        .prefix(prefix)
        .rand_bytes(8)
        .tempdir_in(parent)
        .map_err(|err| cgroup_io_error(parent, err))?
        .into_path();
      debug!("Created cgroup {}", created.display());
      self.init_child(parent, &created);

      per_subsystem.insert(subsystem.to_string(), created.clone());
      per_parent.insert(parent.clone(), created);
    }

    Ok(self.with_paths(per_subsystem))
  }

  /// Create (or reuse) a child group with a fixed name in every directory of this group
  pub fn create_named_child(&self, name: &str) -> Result<Cgroups, RunBoxError> {
    let mut per_subsystem = BTreeMap::new();
    let mut created_paths = BTreeSet::new();
    for (subsystem, parent) in self.per_subsystem.iter() {
      let created = parent.join(name);
      if created_paths.insert(created.clone()) {
        match fs::create_dir(&created) {
          Ok(_) => self.init_child(parent, &created),
          Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
          Err(err) => return Err(cgroup_io_error(&created, err)),
        }
      }
      per_subsystem.insert(subsystem.clone(), created);
    }
    Ok(self.with_paths(per_subsystem))
  }

  fn init_child(&self, parent: &Path, child: &Path) {
    if !self.backend.copies_cpuset() {
      return;
    }
    // Tasks can not be added before the cpuset of the new group is filled
    for name in ["cpuset.cpus", "cpuset.mems"] {
      if let Ok(value) = fs::read(parent.join(name)) {
        if let Err(err) = fs::write(child.join(name), value) {
          debug!("Cannot copy {} into {}: {}", name, child.display(), err);
        }
      }
    }
  }

  /// Allow sub-groups of this group to use its subsystems.
  /// Afterwards no process may be added to this group itself.
  pub fn enable_for_children(&self) -> Result<(), RunBoxError> {
    self.backend.enable_for_children(self)
  }

  /// Move a process into every directory of this group
  pub fn add_task(&self, pid: Pid) -> Result<(), RunBoxError> {
    for path in self.paths.iter() {
      let task_file = path.join(self.backend.task_file());
      write_file(&task_file, pid.to_string()).map_err(|err| cgroup_io_error(&task_file, err))?;
    }
    register_with_cgrulesengd(pid);
    Ok(())
  }

  /// The task files of this group, for code that joins the group from a forked process
  pub fn task_files(&self) -> Vec<PathBuf> {
    self
      .paths
      .iter()
      .map(|path| path.join(self.backend.task_file()))
      .collect()
  }

  pub fn get_all_tasks(&self, subsystem: &str) -> Vec<Pid> {
    match self.path(subsystem) {
      Some(path) => read_tasks(&path.join(self.backend.task_file())),
      None => vec![],
    }
  }

  /// Kill all processes in this group and its sub-groups, and remove the sub-groups.
  pub fn kill_all_tasks(&self) {
    let task_file = self.backend.task_file();

    if self.backend.kill_atomically(self) {
      for path in self.paths.iter() {
        kill_all_tasks_recursively(path, task_file, true);
      }
      return;
    }

    // Freezing first prevents fork bombs and new sub-groups while we are killing
    if self.backend.can_freeze(self) {
      match self.backend.freeze(self, true) {
        Ok(_) => {
          if let Some(path) = self.path(FREEZER) {
            signal_tasks_recursively(path, task_file);
          }
          if let Err(err) = self.backend.freeze(self, false) {
            warn!("Cannot thaw cgroup: {}", err);
          }
        }
        Err(err) => {
          warn!("Cannot freeze cgroup before killing its processes: {}", err);
        }
      }
    }

    for path in self.paths.iter() {
      kill_all_tasks_recursively(path, task_file, true);
    }
  }

  /// Send SIGKILL to every process of this group and its sub-groups, without waiting for them
  pub fn signal_all_tasks(&self) {
    for path in self.paths.iter() {
      signal_tasks_recursively(path, self.backend.task_file());
    }
  }

  /// Remove the directories of this group. Removing twice is harmless.
  pub fn remove(&self) {
    for path in self.paths.iter().rev() {
      remove_cgroup(path, self.backend.task_file());
    }
  }

  pub fn has_value(&self, subsystem: &str, option: &str) -> bool {
    match self.path(subsystem) {
      Some(path) => path.join(format!("{}.{}", subsystem, option)).is_file(),
      None => false,
    }
  }

  pub fn get_value(&self, subsystem: &str, option: &str) -> Result<String, RunBoxError> {
    let path = self.option_path(subsystem, option)?;
    read_file(&path).map_err(|err| cgroup_io_error(&path, err))
  }

  /// Read a value until two consecutive reads agree
  pub fn read_stable_value(&self, subsystem: &str, option: &str) -> Option<String> {
    let mut previous = self.get_value(subsystem, option).ok()?;
    for _ in 0..STABLE_READ_ATTEMPTS {
      let current = self.get_value(subsystem, option).ok()?;
      if current == previous {
        return Some(current);
      }
      previous = current;
      sleep(Duration::from_millis(100));
    }
    debug!("Value of {}.{} did not stabilize, using {}", subsystem, option, previous);
    Some(previous)
  }

  pub fn set_value<V: Display>(&self, subsystem: &str, option: &str, value: V) -> Result<(), RunBoxError> {
    let path = self.option_path(subsystem, option)?;
    write_file(&path, value.to_string()).map_err(|err| cgroup_io_error(&path, err))
  }

  /// Lines `key value` of a flat-keyed control file
  pub fn get_key_value_pairs(&self, subsystem: &str, option: &str) -> Vec<(String, String)> {
    self
      .get_value(subsystem, option)
      .map(|content| parse_key_value_lines(&content))
      .unwrap_or_default()
  }

  fn option_path(&self, subsystem: &str, option: &str) -> Result<PathBuf, RunBoxError> {
    let path = self
      .path(subsystem)
      .ok_or_else(|| RunBoxError::cgroup(format!("Cgroup subsystem {} is not available", subsystem)))?;
    Ok(path.join(format!("{}.{}", subsystem, option)))
  }

  pub fn read_cputime(&self) -> Option<f64> {
    self.backend.read_cputime(self)
  }

  pub fn read_cputime_now(&self) -> Option<f64> {
    self.backend.read_cputime_now(self)
  }

  pub fn read_usage_per_cpu(&self) -> Vec<(usize, f64)> {
    self.backend.read_usage_per_cpu(self)
  }

  pub fn read_max_mem_usage(&self) -> Option<u64> {
    self.backend.read_max_mem_usage(self)
  }

  pub fn read_oom_kill_count(&self) -> Option<u64> {
    self.backend.read_oom_kill_count(self)
  }

  pub fn read_io_stat(&self) -> Option<(u64, u64)> {
    self.backend.read_io_stat(self)
  }

  pub fn read_pressure(&self) -> Vec<(String, f64)> {
    self.backend.read_pressure(self)
  }

  pub fn set_memory_limit(&self, limit: u64) -> Result<(), RunBoxError> {
    self.backend.set_memory_limit(self, limit)
  }

  pub fn read_memory_limit(&self) -> Option<u64> {
    self.backend.read_memory_limit(self)
  }

  pub fn has_cputime(&self) -> bool {
    self.contains(self.backend.cputime_subsystem())
  }

  /// Cores that processes in this group may use
  pub fn read_allowed_cpus(&self) -> Result<Vec<usize>, RunBoxError> {
    let option = self.backend.allowed_cpuset_option("cpus");
    crate::utils::parse_int_list(&self.get_value(CPUSET, &option)?)
  }

  /// Memory nodes that processes in this group may use
  pub fn read_allowed_memory_nodes(&self) -> Result<Vec<usize>, RunBoxError> {
    let option = self.backend.allowed_cpuset_option("mems");
    crate::utils::parse_int_list(&self.get_value(CPUSET, &option)?)
  }
}

impl Debug for Cgroups {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Cgroups")
      .field("version", &self.version())
      .field("per_subsystem", &self.per_subsystem)
      .finish()
  }
}

fn is_permission_error(err: &RunBoxError) -> bool {
  match err {
    RunBoxError::Nix(Errno::EACCES) | RunBoxError::Nix(Errno::EPERM) => true,
    RunBoxError::Cgroup(msg) => msg.contains("Permission denied") || msg.contains("Operation not permitted"),
    _ => false,
  }
}

pub(crate) fn cgroup_io_error(path: &Path, err: std::io::Error) -> RunBoxError {
  RunBoxError::cgroup(format!("{} ({})", err, path.display()))
}

fn permission_hint(paths: &BTreeSet<PathBuf>) -> String {
  // Group write permission means that joining the group is enough
  let groups = paths
    .iter()
    .filter_map(|path| fs::metadata(path).ok())
    .filter(|meta| meta.permissions().mode() & 0o020 != 0)
    .map(|meta| meta.gid())
    .collect::<BTreeSet<u32>>();
  let all_group_writable = !groups.is_empty()
    && paths
      .iter()
      .all(|path| fs::metadata(path).map(|m| m.permissions().mode() & 0o020 != 0).unwrap_or(false));

  if all_group_writable && !groups.contains(&0) {
    let names = groups
      .iter()
      .map(|gid| match Group::from_gid(Gid::from_raw(*gid)) {
        Ok(Some(group)) => escape_string_shell(&group.name),
        _ => gid.to_string(),
      })
      .collect::<Vec<String>>()
      .join(" ");
    let user = match User::from_uid(Uid::current()) {
      Ok(Some(user)) => user.name,
      _ => Uid::current().to_string(),
    };
    format!(
      "\nYou need to add your account ({}) to the following groups: {}\nRemember to logout and login again afterwards to make group changes effective.",
      user, names
    )
  } else if Path::new("/run/systemd/system").exists() {
    "\nThe recommended way to fix this is to let systemd delegate a cgroup to your user, e.g. by starting this program with \"systemd-run --user --scope -p Delegate=yes\", or to install a system service that owns a cgroup at system.slice/runbox-cgroup.service which your account may write to.".to_string()
  } else {
    "\nPlease configure your system in a way that allows your user to create cgroups.".to_string()
  }
}

fn read_tasks(task_file: &Path) -> Vec<Pid> {
  match fs::read_to_string(task_file) {
    Ok(content) => content
      .lines()
      .filter_map(|line| line.trim().parse::<i32>().ok())
      .map(Pid::from_raw)
      .collect(),
    Err(err) => {
      debug!("Cannot read {}: {}", task_file.display(), err);
      vec![]
    }
  }
}

/// Sub-groups of `cgroup`, deepest first
fn child_cgroups_bottom_up(cgroup: &Path) -> Vec<PathBuf> {
  WalkDir::new(cgroup)
    .min_depth(1)
    .contents_first(true)
    .follow_links(false)
    .into_iter()
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().is_dir())
    .map(|entry| entry.into_path())
    .collect()
}

/// One round of signals while the group is frozen, we can not wait for emptiness here
fn signal_tasks_recursively(cgroup: &Path, task_file: &str) {
  let mut cgroups = child_cgroups_bottom_up(cgroup);
  cgroups.push(cgroup.to_path_buf());
  for cgroup in cgroups {
    for signal in [Signal::SIGKILL, Signal::SIGINT, Signal::SIGTERM] {
      for task in read_tasks(&cgroup.join(task_file)) {
        kill_process(task, signal);
      }
    }
  }
}

fn kill_all_tasks_recursively(cgroup: &Path, task_file: &str, delete: bool) {
  for child in child_cgroups_bottom_up(cgroup) {
    kill_all_tasks_in_cgroup(&child, task_file);
    if delete {
      remove_cgroup(&child, task_file);
    }
  }
  kill_all_tasks_in_cgroup(cgroup, task_file);
}

fn kill_all_tasks_in_cgroup(cgroup: &Path, task_file: &str) {
  let task_file = cgroup.join(task_file);
  for round in 1..=MAX_KILL_ROUNDS {
    for signal in [Signal::SIGKILL, Signal::SIGINT, Signal::SIGTERM] {
      let tasks = read_tasks(&task_file);
      if tasks.is_empty() {
        return;
      }
      for task in tasks {
        if round > 1 {
          warn!(
            "Run has left-over process with pid {} in cgroup {}, sending signal {} (try {})",
            task,
            cgroup.display(),
            signal,
            round
          );
        }
        kill_process(task, signal);
      }
      // Give the processes some time to exit
      sleep(Duration::from_millis(KILL_ROUND_DELAY_MS * round));
    }
  }
  let tasks = read_tasks(&task_file);
  if !tasks.is_empty() {
    warn!(
      "Giving up killing processes {:?} in cgroup {} after {} tries",
      tasks,
      cgroup.display(),
      MAX_KILL_ROUNDS
    );
  }
}

fn remove_cgroup(cgroup: &Path, task_file: &str) {
  if !cgroup.exists() {
    debug!("Cgroup {} does not exist anymore", cgroup.display());
    return;
  }
  let tasks = read_tasks(&cgroup.join(task_file));
  if !tasks.is_empty() {
    warn!(
      "Cgroup {} still contains processes {:?} while removing it",
      cgroup.display(),
      tasks
    );
  }
  if let Err(err) = fs::remove_dir(cgroup) {
    // The kernel sometimes still considers the group busy
    debug!("Removing cgroup {} failed once: {}", cgroup.display(), err);
    sleep(Duration::from_millis(100));
    match fs::remove_dir(cgroup) {
      Ok(_) => {}
      Err(err) if err.kind() == ErrorKind::NotFound => {}
      Err(err) => warn!("Failed to remove cgroup {}: {}", cgroup.display(), err),
    }
  }
}

/// Ask cgrulesengd (if it is running) to leave this process where we put it
fn register_with_cgrulesengd(pid: Pid) {
  let mut stream = match UnixStream::connect(CGRULESENGD_SOCKET) {
    Ok(stream) => stream,
    Err(_) => return,
  };
  let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
  let mut message = pid.as_raw().to_ne_bytes().to_vec();
  message.extend(CGROUP_DAEMON_UNCHANGE_CHILDREN.to_ne_bytes());
  if stream.write_all(&message).is_err() {
    return;
  }
  let mut reply = vec![0u8; CGRULESENGD_SUCCESS.len()];
  match stream.read_exact(&mut reply) {
    Ok(_) if reply == CGRULESENGD_SUCCESS => debug!("Registered process #{}. with cgrulesengd", pid),
    _ => debug!("Could not register process #{}. with cgrulesengd", pid),
  }
}

/// Whether we may create entries in this directory
pub(crate) fn is_writable(path: &Path) -> bool {
  access(path, AccessFlags::W_OK).is_ok()
}

/// Parse `/proc/self/cgroup` into `(controllers, path)` pairs, paths are relative to the mount point
pub fn parse_proc_self_cgroup(content: &str) -> Vec<(Vec<String>, PathBuf)> {
  content
    .lines()
    .filter_map(|line| {
      let mut parts = line.splitn(3, ':');
      let _id = parts.next()?;
      let controllers = parts.next()?;
      let path = parts.next()?;
      let controllers = controllers
        .split(',')
        .filter(|c| !c.is_empty())
        .map(|c| c.trim_start_matches("name=").to_string())
        .collect();
      Some((controllers, PathBuf::from(path.trim_start_matches('/'))))
    })
    .collect()
}

/// One line of `/proc/mounts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
  pub source: String,
  pub mountpoint: PathBuf,
  pub fstype: String,
  pub options: Vec<String>,
}

/// Parse `/proc/mounts` style content, decoding the octal escapes of the kernel
pub fn parse_proc_mounts(content: &str) -> Vec<MountEntry> {
  content
    .lines()
    .filter_map(|line| {
      let mut parts = line.split_whitespace();
      let source = decode_mount_path(parts.next()?);
      let mountpoint = decode_mount_path(parts.next()?);
      let fstype = parts.next()?.to_string();
      let options = parts.next()?.split(',').map(|o| o.to_string()).collect();
      Some(MountEntry {
        source,
        mountpoint: PathBuf::from(mountpoint),
        fstype,
        options,
      })
    })
    .collect()
}

pub fn decode_mount_path(text: &str) -> String {
  text
    .replace("\\011", "\t")
    .replace("\\040", " ")
    .replace("\\012", "\n")
    .replace("\\134", "\\")
}
