use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use nix::unistd::Pid;
use tempfile::tempdir;

use runbox::cgroup::{
  decode_mount_path, parse_blkio_service_bytes, parse_cpu_stat_usage, parse_io_stat, parse_key_value_lines,
  parse_pressure_total, parse_proc_mounts, parse_proc_self_cgroup, parse_usage_percpu, CgroupV1, Cgroups, CPUACCT,
  CGROUP_NAME_PREFIX,
};

mod common;

#[test]
fn parse_self_cgroup_v1_and_v2() {
  common::setup();
  let content = "12:cpu,cpuacct:/user.slice\n4:name=systemd:/user.slice/session-2.scope\n0::/user.slice/user-1000.slice/session-2.scope\n";
  let parsed = parse_proc_self_cgroup(content);
  assert_eq!(parsed.len(), 3);
  assert_eq!(parsed[0].0, vec!["cpu".to_string(), "cpuacct".to_string()]);
  assert_eq!(parsed[0].1, PathBuf::from("user.slice"));
  assert_eq!(parsed[1].0, vec!["systemd".to_string()]);
  assert!(parsed[2].0.is_empty());
  assert_eq!(parsed[2].1, PathBuf::from("user.slice/user-1000.slice/session-2.scope"));
}

#[test]
fn parse_mounts_with_escapes() {
  common::setup();
  let content = "cgroup2 /sys/fs/cgroup cgroup2 rw,nosuid,nodev 0 0\n/dev/sda1 /mnt/my\\040disk ext4 rw,relatime 0 0\n";
  let mounts = parse_proc_mounts(content);
  assert_eq!(mounts.len(), 2);
  assert_eq!(mounts[0].fstype, "cgroup2");
  assert_eq!(mounts[0].mountpoint, Path::new("/sys/fs/cgroup"));
  assert_eq!(mounts[0].options, vec!["rw", "nosuid", "nodev"]);
  assert_eq!(mounts[1].mountpoint, Path::new("/mnt/my disk"));
  assert_eq!(decode_mount_path("a\\011b\\134c"), "a\tb\\c");
}

#[test]
fn parse_cpu_accounting() {
  common::setup();
  let percpu = parse_usage_percpu("1000000000 500000000 0\n");
  assert_eq!(percpu, vec![(0, 1.0), (1, 0.5), (2, 0.0)]);

  let stat = "usage_usec 2500000\nuser_usec 2000000\nsystem_usec 500000\n";
  assert_eq!(parse_cpu_stat_usage(stat), Some(2.5));
  assert_eq!(parse_cpu_stat_usage("user_usec 1\n"), None);
}

#[test]
fn parse_io_accounting() {
  common::setup();
  let blkio = "8:0 Read 4096\n8:0 Write 1024\n8:0 Sync 5120\n8:16 Read 100\nTotal 5220\n";
  assert_eq!(parse_blkio_service_bytes(blkio), (4196, 1024));

  let io = "8:0 rbytes=1000 wbytes=200 rios=3 wios=1\n8:16 rbytes=24 wbytes=0 rios=1 wios=0\n";
  assert_eq!(parse_io_stat(io), (1024, 200));
}

#[test]
fn parse_pressure_and_key_values() {
  common::setup();
  let pressure = "some avg10=0.00 avg60=0.00 avg300=0.00 total=1500000\nfull avg10=0.00 avg60=0.00 avg300=0.00 total=700000\n";
  assert_eq!(parse_pressure_total(pressure), Some(1.5));
  assert_eq!(parse_pressure_total(""), None);

  let pairs = parse_key_value_lines("oom 0\noom_kill 2\n");
  assert_eq!(pairs[1], ("oom_kill".to_string(), "2".to_string()));
}

#[test]
fn create_and_remove_child_cgroup() {
  common::setup();
  let cgroups = match Cgroups::discover() {
    Ok(cgroups) if !cgroups.is_empty() => cgroups,
    Ok(_) | Err(_) => {
      info!("No usable cgroups, skipping");
      return;
    }
  };
  let subsystems = cgroups.subsystems().map(|s| s.as_str()).collect::<Vec<&str>>();
  let child = match cgroups.create_fresh_child_cgroup(&subsystems, CGROUP_NAME_PREFIX) {
    Ok(child) => child,
    Err(err) => {
      info!("Cannot create cgroups here, skipping: {}", err);
      return;
    }
  };
  for path in child.paths() {
    assert!(path.is_dir());
    assert!(path
      .file_name()
      .unwrap()
      .to_string_lossy()
      .starts_with(CGROUP_NAME_PREFIX));
  }
  assert!(child.get_all_tasks(child.backend().cputime_subsystem()).is_empty());
  assert!(!child.get_all_tasks(child.backend().cputime_subsystem()).contains(&Pid::this()));

  child.remove();
  for path in child.paths() {
    assert!(!path.exists());
  }
  // Removing twice is harmless
  child.remove();
}

#[test]
fn killing_gives_up_on_processes_that_never_leave() {
  common::setup();
  let dir = tempdir().unwrap();
  // Beyond pid_max, so every signal fails and the task stays listed
  fs::write(dir.path().join("tasks"), format!("{}\n", i32::MAX)).unwrap();
  let mut per_subsystem = BTreeMap::new();
  per_subsystem.insert(CPUACCT.to_string(), dir.path().to_path_buf());
  let cgroups = Cgroups::from_backend(Arc::new(CgroupV1::new()), per_subsystem);

  let start = Instant::now();
  cgroups.kill_all_tasks();
  info!("Gave up killing after {:?}", start.elapsed());
  assert!(start.elapsed() < Duration::from_secs(30));
  assert_eq!(cgroups.get_all_tasks(CPUACCT), vec![Pid::from_raw(i32::MAX)]);
}
