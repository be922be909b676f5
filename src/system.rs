//! Checks of the host that affect the reliability of measurements

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::cgroup::parse_key_value_lines;
use crate::utils::read_file;

const CPU_DIR: &str = "/sys/devices/system/cpu";

const POWERCAP_DIR: &str = "/sys/class/powercap";

fn read_counter(path: &Path) -> Option<u64> {
  match read_file(path) {
    Ok(text) => text.trim().parse().ok(),
    Err(err) => {
      debug!("Cannot read {}: {}", path.display(), err);
      None
    }
  }
}

/// Whether any of the cores was thermally throttled since this was created
pub struct CpuThrottleCheck {
  counts: BTreeMap<PathBuf, u64>,
}

impl CpuThrottleCheck {
  /// Watch the given cores, or all cores
  pub fn new(cores: Option<&[usize]>) -> Self {
    let mut counts = BTreeMap::new();
    let dirs: Vec<PathBuf> = match cores {
      Some(cores) => cores
        .iter()
        .map(|core| Path::new(CPU_DIR).join(format!("cpu{}", core)))
        .collect(),
      None => fs::read_dir(CPU_DIR)
        .map(|entries| {
          entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
              let name = p.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
              name.starts_with("cpu") && name[3..].chars().all(|c| c.is_ascii_digit()) && name.len() > 3
            })
            .collect()
        })
        .unwrap_or_default(),
    };
    for dir in dirs {
      let throttle_dir = dir.join("thermal_throttle");
      let entries = match fs::read_dir(&throttle_dir) {
        Ok(entries) => entries,
        Err(_) => continue,
      };
      for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.to_string_lossy().ends_with("_throttle_count") {
          if let Some(count) = read_counter(&path) {
            counts.insert(path, count);
          }
        }
      }
    }
    CpuThrottleCheck { counts }
  }

  pub fn has_throttled(&self) -> bool {
    self
      .counts
      .iter()
      .any(|(path, old)| matches!(read_counter(path), Some(new) if new > *old))
  }
}

/// Whether the system swapped since this was created
pub struct SwapCheck {
  counts: BTreeMap<String, u64>,
}

impl SwapCheck {
  pub fn new() -> Self {
    SwapCheck {
      counts: Self::read_swap_counts(),
    }
  }

  fn read_swap_counts() -> BTreeMap<String, u64> {
    match fs::read_to_string("/proc/vmstat") {
      Ok(content) => parse_swap_counts(&content),
      Err(err) => {
        warn!("Cannot read swap count from kernel: {}", err);
        BTreeMap::new()
      }
    }
  }

  pub fn has_swapped(&self) -> bool {
    Self::read_swap_counts()
      .iter()
      .any(|(key, new)| *new > self.counts.get(key).copied().unwrap_or(0))
  }
}

impl Default for SwapCheck {
  fn default() -> Self {
    Self::new()
  }
}

/// `pswpin` and `pswpout` of `/proc/vmstat`
pub fn parse_swap_counts(content: &str) -> BTreeMap<String, u64> {
  parse_key_value_lines(content)
    .into_iter()
    .filter(|(key, _)| key == "pswpin" || key == "pswpout")
    .filter_map(|(key, value)| value.parse().ok().map(|value| (key, value)))
    .collect()
}

struct EnergyCounter {
  domain: String,
  path: PathBuf,
  start: u64,
  /// The counter wraps around at this value
  range: u64,
}

/// Energy consumption of the cpu packages from the RAPL counters of powercap
pub struct EnergyMeasurement {
  counters: Vec<EnergyCounter>,
}

impl EnergyMeasurement {
  /// Start measuring, `None` if the host has no readable RAPL counters
  pub fn start() -> Option<Self> {
    let entries = fs::read_dir(POWERCAP_DIR).ok()?;
    let mut counters = vec![];
    for entry in entries.filter_map(|e| e.ok()) {
      let dir = entry.path();
      let name = dir.file_name()?.to_string_lossy().to_string();
      // Only top level zones like intel-rapl:0 are packages
      match name.strip_prefix("intel-rapl:") {
        Some(index) if !index.contains(':') => {}
        _ => continue,
      }
      let zone = match read_file(dir.join("name")) {
        Ok(zone) => zone,
        Err(_) => continue,
      };
      let package = match zone.strip_prefix("package-") {
        Some(package) => package.to_string(),
        None => continue,
      };
      let path = dir.join("energy_uj");
      if let (Some(start), Some(range)) = (read_counter(&path), read_counter(&dir.join("max_energy_range_uj"))) {
        counters.push(EnergyCounter {
          domain: format!("pkg{}", package),
          path,
          start,
          range,
        });
      }
    }
    if counters.is_empty() {
      debug!("Energy measurement not available, no readable RAPL counters");
      return None;
    }
    counters.sort_by(|a, b| a.domain.cmp(&b.domain));
    Some(EnergyMeasurement { counters })
  }

  /// Joules per package plus `cpu` with the sum
  pub fn stop(self) -> Vec<(String, f64)> {
    let mut result = vec![];
    let mut total = 0.0;
    for counter in self.counters {
      if let Some(end) = read_counter(&counter.path) {
        let consumed = energy_difference(counter.start, end, counter.range) as f64 / 1_000_000.0;
        total += consumed;
        result.push((counter.domain, consumed));
      }
    }
    if !result.is_empty() {
      result.insert(0, ("cpu".to_string(), total));
    }
    result
  }
}

/// Microjoules between two readings of a counter that wraps at `range`
pub fn energy_difference(start: u64, end: u64, range: u64) -> u64 {
  if end >= start {
    end - start
  } else {
    range.saturating_sub(start) + end
  }
}

/// Number of cpus this process may run on
pub fn cpu_count() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
}
