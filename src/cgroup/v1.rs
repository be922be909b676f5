use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use log::{debug, warn};

use super::{
  is_writable, parse_key_value_lines, parse_proc_mounts, parse_proc_self_cgroup, CgroupBackend, CgroupVersion,
  Cgroups, BLKIO, CPU, CPUACCT, CPUSET, FREEZER, MEMORY, PIDS,
};
use crate::RunBoxError;

const KNOWN_SUBSYSTEMS: [&str; 7] = [BLKIO, CPU, CPUACCT, CPUSET, FREEZER, MEMORY, PIDS];

/// Group that a system service may prepare for users without own cgroup permissions
const FALLBACK_CGROUP: &str = "system.slice/runbox-cgroup.service";

const FREEZE_POLL_ATTEMPTS: usize = 100;

/// Legacy hierarchy with one mount point per (group of) subsystem(s)
pub struct CgroupV1;

impl CgroupV1 {
  pub fn new() -> Self {
    CgroupV1
  }
}

impl Default for CgroupV1 {
  fn default() -> Self {
    Self::new()
  }
}

impl CgroupBackend for CgroupV1 {
  fn version(&self) -> CgroupVersion {
    CgroupVersion::V1
  }

  fn find_own_cgroups(&self) -> Result<BTreeMap<String, PathBuf>, RunBoxError> {
    let mounts = fs::read_to_string("/proc/mounts")?;
    let mut mount_points = BTreeMap::new();
    for entry in parse_proc_mounts(&mounts) {
      if entry.fstype != "cgroup" {
        continue;
      }
      for option in entry.options.iter() {
        if KNOWN_SUBSYSTEMS.contains(&option.as_str()) {
          mount_points.insert(option.clone(), entry.mountpoint.clone());
        }
      }
    }

    let own = fs::read_to_string("/proc/self/cgroup")?;
    let mut result = BTreeMap::new();
    for (controllers, path) in parse_proc_self_cgroup(&own) {
      for controller in controllers {
        let mount = match mount_points.get(&controller) {
          Some(mount) => mount,
          None => continue,
        };
        let mut cgroup = mount.join(&path);
        let fallback = mount.join(FALLBACK_CGROUP);
        if !is_writable(&cgroup) && fallback.is_dir() {
          debug!("Using fallback cgroup {} for subsystem {}", fallback.display(), controller);
          cgroup = fallback;
        }
        result.insert(controller, cgroup);
      }
    }
    Ok(result)
  }

  fn task_file(&self) -> &'static str {
    "tasks"
  }

  fn cputime_subsystem(&self) -> &'static str {
    CPUACCT
  }

  fn copies_cpuset(&self) -> bool {
    true
  }

  fn allowed_cpuset_option(&self, option: &str) -> String {
    option.to_string()
  }

  fn can_freeze(&self, cgroups: &Cgroups) -> bool {
    cgroups.contains(FREEZER)
  }

  fn freeze(&self, cgroups: &Cgroups, frozen: bool) -> Result<(), RunBoxError> {
    let state = if frozen { "FROZEN" } else { "THAWED" };
    cgroups.set_value(FREEZER, "state", state)?;
    if !frozen {
      return Ok(());
    }
    // Freezing is asynchronous, the state reads FREEZING until all tasks stopped
    for _ in 0..FREEZE_POLL_ATTEMPTS {
      if cgroups.get_value(FREEZER, "state")? == "FROZEN" {
        return Ok(());
      }
      sleep(Duration::from_millis(1));
    }
    Err(RunBoxError::cgroup("Cgroup did not become frozen in time"))
  }

  fn read_cputime_now(&self, cgroups: &Cgroups) -> Option<f64> {
    let value = cgroups.get_value(CPUACCT, "usage").ok()?;
    value.trim().parse::<u64>().ok().map(|ns| ns as f64 / 1e9)
  }

  fn read_cputime(&self, cgroups: &Cgroups) -> Option<f64> {
    let value = cgroups.read_stable_value(CPUACCT, "usage")?;
    value.trim().parse::<u64>().ok().map(|ns| ns as f64 / 1e9)
  }

  fn read_usage_per_cpu(&self, cgroups: &Cgroups) -> Vec<(usize, f64)> {
    match cgroups.read_stable_value(CPUACCT, "usage_percpu") {
      Some(value) => parse_usage_percpu(&value),
      None => vec![],
    }
  }

  fn read_max_mem_usage(&self, cgroups: &Cgroups) -> Option<u64> {
    // With swap accounting the memsw value also covers swapped out pages
    let option = if cgroups.has_value(MEMORY, "memsw.max_usage_in_bytes") {
      "memsw.max_usage_in_bytes"
    } else {
      "max_usage_in_bytes"
    };
    cgroups.get_value(MEMORY, option).ok()?.trim().parse::<u64>().ok()
  }

  fn read_oom_kill_count(&self, cgroups: &Cgroups) -> Option<u64> {
    parse_key_value_lines(&cgroups.get_value(MEMORY, "oom_control").ok()?)
      .into_iter()
      .find(|(key, _)| key == "oom_kill")
      .and_then(|(_, value)| value.parse::<u64>().ok())
  }

  fn read_io_stat(&self, cgroups: &Cgroups) -> Option<(u64, u64)> {
    if !cgroups.has_value(BLKIO, "throttle.io_service_bytes") {
      return None;
    }
    let content = cgroups.get_value(BLKIO, "throttle.io_service_bytes").ok()?;
    Some(parse_blkio_service_bytes(&content))
  }

  fn read_pressure(&self, _cgroups: &Cgroups) -> Vec<(String, f64)> {
    vec![]
  }

  fn set_memory_limit(&self, cgroups: &Cgroups, limit: u64) -> Result<(), RunBoxError> {
    cgroups.set_value(MEMORY, "limit_in_bytes", limit)?;
    if cgroups.has_value(MEMORY, "memsw.limit_in_bytes") {
      cgroups.set_value(MEMORY, "memsw.limit_in_bytes", limit)?;
    } else {
      warn!("Kernel has no swap accounting, memory limit does not include swap usage");
    }
    if cgroups.has_value(MEMORY, "swappiness") {
      if let Err(err) = cgroups.set_value(MEMORY, "swappiness", 0) {
        warn!("Could not disable swapping for benchmarked process: {}", err);
      }
    }
    Ok(())
  }

  fn read_memory_limit(&self, cgroups: &Cgroups) -> Option<u64> {
    cgroups.get_value(MEMORY, "limit_in_bytes").ok()?.trim().parse::<u64>().ok()
  }

  fn has_swap_accounting(&self, cgroups: &Cgroups) -> bool {
    cgroups.has_value(MEMORY, "memsw.max_usage_in_bytes")
  }
}

/// Parse `cpuacct.usage_percpu`, nanoseconds separated by spaces
pub fn parse_usage_percpu(content: &str) -> Vec<(usize, f64)> {
  content
    .split_whitespace()
    .enumerate()
    .filter_map(|(cpu, value)| value.parse::<u64>().ok().map(|ns| (cpu, ns as f64 / 1e9)))
    .collect()
}

/// Sum up `Read` and `Write` lines of `blkio.throttle.io_service_bytes`
pub fn parse_blkio_service_bytes(content: &str) -> (u64, u64) {
  let mut read = 0;
  let mut write = 0;
  for line in content.lines() {
    let parts = line.split_whitespace().collect::<Vec<&str>>();
    if parts.len() != 3 {
      continue;
    }
    let value = parts[2].parse::<u64>().unwrap_or(0);
    match parts[1] {
      "Read" => read += value,
      "Write" => write += value,
      _ => {}
    }
  }
  (read, write)
}
