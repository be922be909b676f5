use std::path::Path;

use runbox::container::{DirEntry, DirMode, DirectoryPolicy, CONTAINER_HOME};

mod common;

fn policy(entries: Vec<(&str, DirMode)>) -> DirectoryPolicy {
  let entries = entries
    .into_iter()
    .map(|(path, mode)| DirEntry::new(path, mode))
    .collect();
  DirectoryPolicy::new(entries, false).unwrap()
}

#[test]
fn defaults_hide_tmp_and_run() {
  common::setup();
  let policy = policy(vec![]);
  assert_eq!(policy.mode_for(Path::new("/")), DirMode::Overlay);
  assert_eq!(policy.mode_for(Path::new("/usr/bin")), DirMode::Overlay);
  assert_eq!(policy.mode_for(Path::new("/tmp")), DirMode::Hidden);
  assert_eq!(policy.mode_for(Path::new("/tmp/a/b")), DirMode::Hidden);
  assert_eq!(policy.mode_for(Path::new("/run/user")), DirMode::Hidden);
}

#[test]
fn longest_prefix_wins() {
  common::setup();
  let policy = policy(vec![
    ("/home", DirMode::Hidden),
    ("/home/user/project", DirMode::FullAccess),
    ("/home/user/project/cache", DirMode::ReadOnly),
  ]);
  assert_eq!(policy.mode_for(Path::new("/home/other")), DirMode::Hidden);
  assert_eq!(policy.mode_for(Path::new("/home/user")), DirMode::Hidden);
  assert_eq!(policy.mode_for(Path::new("/home/user/project/src")), DirMode::FullAccess);
  assert_eq!(policy.mode_for(Path::new("/home/user/project/cache/x")), DirMode::ReadOnly);
  // Prefixes match whole components only
  assert_eq!(policy.mode_for(Path::new("/home/user/projectile")), DirMode::Hidden);
}

#[test]
fn user_entries_override_defaults() {
  common::setup();
  let policy = policy(vec![("/tmp", DirMode::FullAccess), ("/", DirMode::ReadOnly)]);
  assert_eq!(policy.mode_for(Path::new("/tmp/x")), DirMode::FullAccess);
  assert_eq!(policy.mode_for(Path::new("/etc")), DirMode::ReadOnly);
  assert_eq!(policy.mode_for(Path::new("/run")), DirMode::Hidden);
}

#[test]
fn system_config_hides_container_home() {
  common::setup();
  let policy = DirectoryPolicy::new(vec![], true).unwrap();
  assert_eq!(policy.mode_for(Path::new(CONTAINER_HOME)), DirMode::Hidden);

  let policy = DirectoryPolicy::new(vec![DirEntry::new(CONTAINER_HOME, DirMode::FullAccess)], true).unwrap();
  assert_eq!(policy.mode_for(Path::new(CONTAINER_HOME)), DirMode::FullAccess);
}

#[test]
fn rejects_invalid_entries() {
  common::setup();
  assert!(DirectoryPolicy::new(vec![DirEntry::new("relative", DirMode::Hidden)], false).is_err());
  assert!(DirectoryPolicy::new(vec![DirEntry::new("/proc", DirMode::FullAccess)], false).is_err());
  assert!(DirectoryPolicy::new(
    vec![DirEntry::new("/opt", DirMode::Hidden), DirEntry::new("/opt", DirMode::ReadOnly)],
    false
  )
  .is_err());
}

#[test]
fn proc_is_always_read_only() {
  common::setup();
  let policy = policy(vec![("/", DirMode::FullAccess)]);
  assert_eq!(
    policy.determine_mode(Path::new("/proc"), Some("proc")),
    Some(DirMode::ReadOnly)
  );
  assert_eq!(policy.determine_mode(Path::new("/proc/sys/fs/binfmt_misc"), Some("autofs")), None);
}

#[test]
fn special_file_systems_are_not_overlaid() {
  common::setup();
  let policy = policy(vec![]);
  assert_eq!(policy.determine_mode(Path::new("/dev/shm"), Some("tmpfs")), Some(DirMode::ReadOnly));
  assert_eq!(policy.determine_mode(Path::new("/sys/fs/cgroup"), Some("cgroup2")), Some(DirMode::ReadOnly));
  assert_eq!(policy.determine_mode(Path::new("/mnt/usb"), Some("vfat")), Some(DirMode::ReadOnly));
  assert_eq!(policy.determine_mode(Path::new("/mnt/remote"), Some("fuse.sshfs")), Some(DirMode::ReadOnly));
  assert_eq!(policy.determine_mode(Path::new("/home"), Some("ext4")), Some(DirMode::Overlay));
}

#[test]
fn hidden_below_hidden_needs_no_mount() {
  common::setup();
  let policy = policy(vec![("/srv", DirMode::Hidden), ("/srv/data", DirMode::Hidden)]);
  assert_eq!(policy.determine_mode(Path::new("/srv/data"), Some("ext4")), None);
  assert_eq!(policy.determine_mode(Path::new("/srv"), Some("ext4")), Some(DirMode::Hidden));
}

#[test]
fn special_dirs_skip_redundant_entries() {
  common::setup();
  let policy = policy(vec![("/srv", DirMode::Hidden), ("/srv/data", DirMode::Hidden), ("/srv/www", DirMode::ReadOnly)]);
  let special = policy
    .special_dirs()
    .into_iter()
    .map(|entry| entry.path().to_string_lossy().to_string())
    .collect::<Vec<String>>();
  assert!(special.contains(&"/".to_string()));
  assert!(special.contains(&"/srv".to_string()));
  assert!(special.contains(&"/srv/www".to_string()));
  assert!(!special.contains(&"/srv/data".to_string()));
}

#[test]
fn parse_dir_modes() {
  common::setup();
  assert_eq!(DirMode::parse("read-only").unwrap(), DirMode::ReadOnly);
  assert_eq!(DirMode::parse("full-access").unwrap(), DirMode::FullAccess);
  assert!(DirMode::parse("writable").is_err());
  assert!(DirEntry::parse(DirMode::Hidden, "".to_string()).is_err());
  let entry = DirEntry::parse(DirMode::Hidden, "/var/cache".to_string()).unwrap();
  assert_eq!(entry.path(), Path::new("/var/cache"));
  assert_eq!(entry.mode(), DirMode::Hidden);
}
