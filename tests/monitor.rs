use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::unistd::write;
use tempfile::tempdir;

use runbox::cgroup::{CgroupV1, Cgroups, MEMORY};
use runbox::monitor::{
  next_check_interval, scan_files, spawn_files_monitor, spawn_oom_monitor, spawn_time_monitor, FilesLimits,
  FilesUsage, KillAction, MonitorHandle, ReasonSlot, TimeLimits,
};
use runbox::TerminationReason;

mod common;

fn counter() -> (Arc<AtomicUsize>, KillAction) {
  let count = Arc::new(AtomicUsize::new(0));
  let inner = count.clone();
  (
    count,
    Arc::new(move || {
      inner.fetch_add(1, Ordering::SeqCst);
    }),
  )
}

fn wait_until_finished(monitor: &MonitorHandle, timeout: Duration) {
  let deadline = Instant::now() + timeout;
  while !monitor.is_finished() && Instant::now() < deadline {
    sleep(Duration::from_millis(20));
  }
}

#[test]
fn check_interval_follows_remaining_time() {
  common::setup();
  assert_eq!(next_check_interval(10.0, 5.0, 100.0, 1), 6.0);
  assert_eq!(next_check_interval(10.0, 10.0, 2.0, 4), 3.0);
  assert_eq!(next_check_interval(-3.0, 1.0, 10.0, 1), 1.0);
  assert_eq!(next_check_interval(1e12, 1e12, 1e12, 1), 3601.0);
  // No cpus would mean an infinite interval
  assert_eq!(next_check_interval(4.0, 4.0, 100.0, 0), 5.0);
}

#[test]
fn first_reason_wins() {
  common::setup();
  let slot = ReasonSlot::new();
  assert_eq!(slot.get(), None);
  assert!(slot.set(TerminationReason::Walltime));
  assert!(!slot.clone().set(TerminationReason::Memory));
  assert_eq!(slot.get(), Some(TerminationReason::Walltime));
}

#[test]
fn hard_cputime_limit_kills() {
  common::setup();
  let (kills, kill) = counter();
  let (terms, terminate) = counter();
  let reason = ReasonSlot::new();
  let limits = TimeLimits {
    soft_cputime: Some(1.0),
    hard_cputime: Some(1.0),
    walltime: Some(100.0),
  };
  let monitor = spawn_time_monitor(limits, 1, Arc::new(|| Some(2.0)), terminate, kill, reason.clone()).unwrap();
  wait_until_finished(&monitor, Duration::from_secs(5));
  assert!(monitor.is_finished());
  monitor.cancel_and_join();
  assert_eq!(kills.load(Ordering::SeqCst), 1);
  assert_eq!(terms.load(Ordering::SeqCst), 0);
  assert_eq!(reason.get(), Some(TerminationReason::Cputime));
}

#[test]
fn walltime_limit_kills() {
  common::setup();
  let (kills, kill) = counter();
  let (_, terminate) = counter();
  let reason = ReasonSlot::new();
  let limits = TimeLimits {
    soft_cputime: None,
    hard_cputime: None,
    walltime: Some(0.2),
  };
  let start = Instant::now();
  let monitor = spawn_time_monitor(limits, 1, Arc::new(|| None::<f64>), terminate, kill, reason.clone()).unwrap();
  wait_until_finished(&monitor, Duration::from_secs(10));
  assert!(monitor.is_finished());
  assert!(start.elapsed() >= Duration::from_millis(200));
  monitor.cancel_and_join();
  assert_eq!(kills.load(Ordering::SeqCst), 1);
  assert_eq!(reason.get(), Some(TerminationReason::Walltime));
}

#[test]
fn soft_limit_terminates_once() {
  common::setup();
  let (kills, kill) = counter();
  let (terms, terminate) = counter();
  let reason = ReasonSlot::new();
  let limits = TimeLimits {
    soft_cputime: Some(1.0),
    hard_cputime: Some(100.0),
    walltime: Some(1000.0),
  };
  let monitor = spawn_time_monitor(limits, 1, Arc::new(|| Some(1.5)), terminate, kill, reason.clone()).unwrap();
  sleep(Duration::from_millis(300));
  let start = Instant::now();
  monitor.cancel_and_join();
  // Cancelling wakes the sleeping monitor up
  assert!(start.elapsed() < Duration::from_secs(5));
  assert_eq!(terms.load(Ordering::SeqCst), 1);
  assert_eq!(kills.load(Ordering::SeqCst), 0);
  assert_eq!(reason.get(), Some(TerminationReason::CputimeSoft));
}

#[test]
fn scan_counts_regular_files_only() {
  common::setup();
  let dir = tempdir().unwrap();
  fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
  fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
  fs::write(dir.path().join("sub/deeper/b"), vec![0u8; 50]).unwrap();
  symlink(dir.path().join("a"), dir.path().join("link")).unwrap();
  fs::create_dir_all(dir.path().join(".runbox-results")).unwrap();
  fs::write(dir.path().join(".runbox-results/c"), vec![0u8; 1000]).unwrap();

  assert_eq!(scan_files(dir.path()), FilesUsage { count: 2, size: 150 });
}

#[test]
fn files_limits_check_count_first() {
  common::setup();
  let limits = FilesLimits {
    count: Some(10),
    size: Some(1000),
  };
  assert_eq!(limits.check(&FilesUsage { count: 10, size: 1000 }), None);
  assert_eq!(
    limits.check(&FilesUsage { count: 11, size: 1001 }),
    Some(TerminationReason::FilesCount)
  );
  assert_eq!(
    limits.check(&FilesUsage { count: 1, size: 1001 }),
    Some(TerminationReason::FilesSize)
  );
  assert!(FilesLimits::default().is_empty());
}

#[test]
fn files_monitor_kills_on_size_limit() {
  common::setup();
  let dir = tempdir().unwrap();
  let (kills, kill) = counter();
  let reason = ReasonSlot::new();
  let limits = FilesLimits {
    count: None,
    size: Some(1000),
  };
  let monitor = spawn_files_monitor(
    dir.path().to_path_buf(),
    limits,
    Duration::from_millis(50),
    kill,
    reason.clone(),
  )
  .unwrap();

  sleep(Duration::from_millis(200));
  assert_eq!(kills.load(Ordering::SeqCst), 0);
  fs::write(dir.path().join("big"), vec![0u8; 2000]).unwrap();

  wait_until_finished(&monitor, Duration::from_secs(5));
  assert!(monitor.is_finished());
  monitor.cancel_and_join();
  assert_eq!(kills.load(Ordering::SeqCst), 1);
  assert_eq!(reason.get(), Some(TerminationReason::FilesSize));
}

/// Records the memory limit seen at the moment the action runs
fn limit_recorder(cgroup: &Path, seen: Arc<Mutex<Vec<(&'static str, String)>>>, name: &'static str) -> KillAction {
  let limit_file = cgroup.join("memory.limit_in_bytes");
  Arc::new(move || {
    let limit = fs::read_to_string(&limit_file).unwrap();
    seen.lock().unwrap().push((name, limit.trim().to_string()));
  })
}

#[test]
fn oom_monitor_raises_limit_before_waiting_for_the_tool() {
  common::setup();
  let dir = tempdir().unwrap();
  let cgroup: PathBuf = dir.path().to_path_buf();
  for name in ["memory.oom_control", "cgroup.event_control"] {
    fs::write(cgroup.join(name), "").unwrap();
  }
  fs::write(cgroup.join("memory.limit_in_bytes"), "67108864").unwrap();
  fs::write(cgroup.join("memory.memsw.limit_in_bytes"), "67108864").unwrap();
  let mut per_subsystem = BTreeMap::new();
  per_subsystem.insert(MEMORY.to_string(), cgroup.clone());
  let cgroups = Cgroups::from_backend(Arc::new(CgroupV1::new()), per_subsystem);

  let seen = Arc::new(Mutex::new(vec![]));
  let reason = ReasonSlot::new();
  let monitor = spawn_oom_monitor(
    &cgroups,
    limit_recorder(&cgroup, seen.clone(), "signal"),
    limit_recorder(&cgroup, seen.clone(), "kill"),
    reason.clone(),
  )
  .unwrap();
  // The kernel OOM killer got disabled
  assert_eq!(fs::read_to_string(cgroup.join("memory.oom_control")).unwrap(), "1");

  // Deliver the event like the kernel would, through the registered eventfd
  let registration = fs::read_to_string(cgroup.join("cgroup.event_control")).unwrap();
  let efd = registration.split_whitespace().next().unwrap().parse::<i32>().unwrap();
  write(efd, &1u64.to_ne_bytes()).unwrap();

  wait_until_finished(&monitor, Duration::from_secs(5));
  assert!(monitor.is_finished());
  monitor.cancel_and_join();

  assert_eq!(reason.get(), Some(TerminationReason::Memory));
  let relaxed = (1u64 << 50).to_string();
  assert_eq!(
    *seen.lock().unwrap(),
    vec![("signal", "67108864".to_string()), ("kill", relaxed.clone())]
  );
  assert_eq!(
    fs::read_to_string(cgroup.join("memory.memsw.limit_in_bytes")).unwrap(),
    relaxed
  );
}
