use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use log::{debug, info, warn};
use nix::unistd::getpid;

use super::{
  cgroup_io_error, is_writable, parse_proc_mounts, parse_proc_self_cgroup, CgroupBackend, CgroupVersion, Cgroups,
  CPU, FREEZER, IO, MEMORY,
};
use crate::utils::{read_file, write_file};
use crate::RunBoxError;

/// Pseudo subsystem for `cgroup.kill`
pub const KILL: &str = "kill";

/// Group that a system service may prepare for users without own cgroup permissions
const FALLBACK_CGROUP: &str = "system.slice/runbox-cgroup.service/runbox_root";

const FREEZE_POLL_ATTEMPTS: usize = 100;

/// Unified hierarchy, every subsystem lives in the same directory
pub struct CgroupV2;

impl CgroupV2 {
  pub fn new() -> Self {
    CgroupV2
  }
}

impl Default for CgroupV2 {
  fn default() -> Self {
    Self::new()
  }
}

fn find_mount() -> Result<PathBuf, RunBoxError> {
  let mounts = fs::read_to_string("/proc/mounts")?;
  parse_proc_mounts(&mounts)
    .into_iter()
    .find(|entry| entry.fstype == "cgroup2")
    .map(|entry| entry.mountpoint)
    .ok_or_else(|| RunBoxError::cgroup("No cgroup2 file system is mounted"))
}

fn read_controllers(path: &Path, file: &str) -> Vec<String> {
  read_file(path.join(file))
    .map(|content| content.split_whitespace().map(|c| c.to_string()).collect())
    .unwrap_or_default()
}

/// Our own group contains processes, so no controller can be enabled for children.
/// If we are alone in it, move into a leaf and enable all controllers for children.
fn delegate_own_cgroup(cgroup: &Path) -> Result<PathBuf, RunBoxError> {
  let available = read_controllers(cgroup, "cgroup.controllers");
  let enabled = read_controllers(cgroup, "cgroup.subtree_control");
  let missing = available
    .iter()
    .filter(|c| !enabled.contains(c))
    .cloned()
    .collect::<Vec<String>>();
  if missing.is_empty() {
    return Ok(cgroup.to_path_buf());
  }

  let procs = read_file(cgroup.join("cgroup.procs")).map_err(|err| cgroup_io_error(cgroup, err))?;
  let pid = getpid();
  let others = procs
    .lines()
    .filter(|line| line.trim() != pid.to_string())
    .count();
  if others > 0 {
    debug!(
      "Cgroup {} contains other processes, cannot enable controllers {}",
      cgroup.display(),
      missing.join(" ")
    );
    return Ok(cgroup.to_path_buf());
  }

  let leaf = cgroup.join(format!("runbox_process_{}", pid));
  fs::create_dir_all(&leaf).map_err(|err| cgroup_io_error(&leaf, err))?;
  write_file(leaf.join("cgroup.procs"), pid.to_string()).map_err(|err| cgroup_io_error(&leaf, err))?;
  for controller in missing.iter() {
    if let Err(err) = write_file(cgroup.join("cgroup.subtree_control"), format!("+{}", controller)) {
      debug!("Cannot enable controller {} in {}: {}", controller, cgroup.display(), err);
    }
  }
  info!(
    "Moved process #{}. into {} and enabled controllers for child groups",
    pid,
    leaf.display()
  );
  Ok(cgroup.to_path_buf())
}

impl CgroupBackend for CgroupV2 {
  fn version(&self) -> CgroupVersion {
    CgroupVersion::V2
  }

  fn find_own_cgroups(&self) -> Result<BTreeMap<String, PathBuf>, RunBoxError> {
    let mount = find_mount()?;
    let own = fs::read_to_string("/proc/self/cgroup")?;
    let relative = parse_proc_self_cgroup(&own)
      .into_iter()
      .find(|(controllers, _)| controllers.is_empty())
      .map(|(_, path)| path)
      .ok_or_else(|| RunBoxError::cgroup("Cannot find own cgroup in /proc/self/cgroup"))?;

    let mut cgroup = mount.join(relative);
    let fallback = mount.join(FALLBACK_CGROUP);
    if !is_writable(&cgroup) && fallback.is_dir() {
      debug!("Using fallback cgroup {}", fallback.display());
      cgroup = fallback;
    }
    if is_writable(&cgroup) {
      cgroup = delegate_own_cgroup(&cgroup)?;
    }

    let mut result = BTreeMap::new();
    for controller in read_controllers(&cgroup, "cgroup.controllers") {
      result.insert(controller, cgroup.clone());
    }
    // cpu.stat and freezing are part of the core on v2
    result.insert(CPU.to_string(), cgroup.clone());
    result.insert(FREEZER.to_string(), cgroup.clone());
    if cgroup.join("cgroup.kill").is_file() {
      result.insert(KILL.to_string(), cgroup.clone());
    }
    Ok(result)
  }

  fn task_file(&self) -> &'static str {
    "cgroup.procs"
  }

  fn cputime_subsystem(&self) -> &'static str {
    CPU
  }

  fn copies_cpuset(&self) -> bool {
    false
  }

  fn allowed_cpuset_option(&self, option: &str) -> String {
    format!("{}.effective", option)
  }

  fn can_freeze(&self, cgroups: &Cgroups) -> bool {
    cgroups
      .path(FREEZER)
      .map(|path| path.join("cgroup.freeze").is_file())
      .unwrap_or(false)
  }

  fn freeze(&self, cgroups: &Cgroups, frozen: bool) -> Result<(), RunBoxError> {
    let path = cgroups
      .path(FREEZER)
      .ok_or_else(|| RunBoxError::cgroup("Cgroup cannot be frozen"))?;
    let freeze = path.join("cgroup.freeze");
    write_file(&freeze, if frozen { "1" } else { "0" }).map_err(|err| cgroup_io_error(&freeze, err))?;
    let expected = if frozen { "frozen 1" } else { "frozen 0" };
    for _ in 0..FREEZE_POLL_ATTEMPTS {
      let events = read_file(path.join("cgroup.events")).map_err(|err| cgroup_io_error(path, err))?;
      if events.lines().any(|line| line.trim() == expected) {
        return Ok(());
      }
      sleep(Duration::from_millis(1));
    }
    Err(RunBoxError::cgroup("Cgroup did not reach the requested freezer state in time"))
  }

  fn kill_atomically(&self, cgroups: &Cgroups) -> bool {
    let path = match cgroups.path(KILL) {
      Some(path) => path.join("cgroup.kill"),
      None => return false,
    };
    match write_file(&path, "1") {
      Ok(_) => true,
      Err(err) => {
        warn!("Cannot kill processes via {}: {}", path.display(), err);
        false
      }
    }
  }

  fn child_supports(&self, child: &Cgroups, subsystem: &str) -> bool {
    let path = match child.path(subsystem) {
      Some(path) => path,
      None => return false,
    };
    match subsystem {
      CPU | FREEZER => true,
      KILL => path.join("cgroup.kill").is_file(),
      _ => read_controllers(path, "cgroup.controllers").iter().any(|c| c == subsystem),
    }
  }

  fn enable_for_children(&self, cgroups: &Cgroups) -> Result<(), RunBoxError> {
    for path in cgroups.paths() {
      let subtree = path.join("cgroup.subtree_control");
      for controller in read_controllers(path, "cgroup.controllers") {
        write_file(&subtree, format!("+{}", controller)).map_err(|err| cgroup_io_error(&subtree, err))?;
      }
    }
    Ok(())
  }

  fn read_cputime_now(&self, cgroups: &Cgroups) -> Option<f64> {
    parse_cpu_stat_usage(&cgroups.get_value(CPU, "stat").ok()?)
  }

  fn read_cputime(&self, cgroups: &Cgroups) -> Option<f64> {
    parse_cpu_stat_usage(&cgroups.read_stable_value(CPU, "stat")?)
  }

  fn read_usage_per_cpu(&self, _cgroups: &Cgroups) -> Vec<(usize, f64)> {
    vec![]
  }

  fn read_max_mem_usage(&self, cgroups: &Cgroups) -> Option<u64> {
    // memory.peak only exists on newer kernels
    let option = if cgroups.has_value(MEMORY, "peak") { "peak" } else { "current" };
    cgroups.get_value(MEMORY, option).ok()?.trim().parse::<u64>().ok()
  }

  fn read_oom_kill_count(&self, cgroups: &Cgroups) -> Option<u64> {
    cgroups
      .get_key_value_pairs(MEMORY, "events")
      .into_iter()
      .find(|(key, _)| key == "oom_kill")
      .and_then(|(_, value)| value.parse::<u64>().ok())
  }

  fn read_io_stat(&self, cgroups: &Cgroups) -> Option<(u64, u64)> {
    if !cgroups.has_value(IO, "stat") {
      return None;
    }
    Some(parse_io_stat(&cgroups.get_value(IO, "stat").ok()?))
  }

  fn read_pressure(&self, cgroups: &Cgroups) -> Vec<(String, f64)> {
    [CPU, MEMORY, IO]
      .iter()
      .filter(|subsystem| cgroups.has_value(subsystem, "pressure"))
      .filter_map(|subsystem| {
        let content = cgroups.get_value(subsystem, "pressure").ok()?;
        parse_pressure_total(&content).map(|total| (subsystem.to_string(), total))
      })
      .collect()
  }

  fn set_memory_limit(&self, cgroups: &Cgroups, limit: u64) -> Result<(), RunBoxError> {
    cgroups.set_value(MEMORY, "max", limit)?;
    if cgroups.has_value(MEMORY, "swap.max") {
      cgroups.set_value(MEMORY, "swap.max", 0)?;
    }
    Ok(())
  }

  fn read_memory_limit(&self, cgroups: &Cgroups) -> Option<u64> {
    let value = cgroups.get_value(MEMORY, "max").ok()?;
    match value.trim() {
      "max" => Some(u64::MAX),
      value => value.parse::<u64>().ok(),
    }
  }

  fn has_swap_accounting(&self, cgroups: &Cgroups) -> bool {
    cgroups.has_value(MEMORY, "swap.max")
  }
}

/// Lines of the form `key value`
pub fn parse_key_value_lines(content: &str) -> Vec<(String, String)> {
  content
    .lines()
    .filter_map(|line| {
      let (key, value) = line.trim().split_once(' ')?;
      Some((key.to_string(), value.trim().to_string()))
    })
    .collect()
}

/// `usage_usec` of `cpu.stat` in seconds
pub fn parse_cpu_stat_usage(content: &str) -> Option<f64> {
  parse_key_value_lines(content)
    .into_iter()
    .find(|(key, _)| key == "usage_usec")
    .and_then(|(_, value)| value.parse::<u64>().ok())
    .map(|us| us as f64 / 1e6)
}

/// Sum of `rbytes` and `wbytes` over all devices in `io.stat`
pub fn parse_io_stat(content: &str) -> (u64, u64) {
  let mut read = 0;
  let mut write = 0;
  for line in content.lines() {
    for field in line.split_whitespace().skip(1) {
      match field.split_once('=') {
        Some(("rbytes", value)) => read += value.parse::<u64>().unwrap_or(0),
        Some(("wbytes", value)) => write += value.parse::<u64>().unwrap_or(0),
        _ => {}
      }
    }
  }
  (read, write)
}

/// `total` of the `some` line of a pressure file, in seconds
pub fn parse_pressure_total(content: &str) -> Option<f64> {
  content
    .lines()
    .find(|line| line.starts_with("some "))?
    .split_whitespace()
    .find_map(|field| field.strip_prefix("total="))
    .and_then(|value| value.parse::<u64>().ok())
    .map(|us| us as f64 / 1e6)
}
