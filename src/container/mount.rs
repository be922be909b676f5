use std::env;
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::mount::{mount, umount, umount2, MntFlags, MsFlags};
use nix::unistd::{access, chdir, chroot, pivot_root, AccessFlags};

use crate::cgroup::parse_proc_mounts;
use crate::container::{
  write_container_system_config, DirMode, DirectoryPolicy, CONTAINER_ETC_FILES, RESULT_FILES_DIR,
};
use crate::utils::{escape_string_shell, path_is_below};
use crate::RunBoxError;

/// The old root is moved here by pivot_root, any directory of the new root would do
const OLD_ROOT: &str = "/proc";

const LXCFS_PROC_DIR: &str = "/var/lib/lxcfs/proc";

lazy_static! {
  /// Mount options of /proc/self/mounts that have to be repeated on remount
  static ref MOUNT_FLAGS: Vec<(&'static str, MsFlags)> = vec![
    ("ro", MsFlags::MS_RDONLY),
    ("nosuid", MsFlags::MS_NOSUID),
    ("nodev", MsFlags::MS_NODEV),
    ("noexec", MsFlags::MS_NOEXEC),
    ("sync", MsFlags::MS_SYNCHRONOUS),
    ("mand", MsFlags::MS_MANDLOCK),
    ("dirsync", MsFlags::MS_DIRSYNC),
    ("noatime", MsFlags::MS_NOATIME),
    ("nodiratime", MsFlags::MS_NODIRATIME),
    ("relatime", MsFlags::MS_RELATIME),
    ("strictatime", MsFlags::MS_STRICTATIME),
  ];
}

/// Directories of one container below the run's temp directory
#[derive(Debug, Clone)]
pub struct MountLayout {
  pub temp_dir: PathBuf,
  /// The new root file system is assembled here
  pub mount_base: PathBuf,
  /// Upper layer of overlays and content of hidden directories, i.e., everything the tool writes
  pub temp_base: PathBuf,
  /// Work directories of overlayfs
  pub work_base: PathBuf,
}

impl MountLayout {
  pub fn new<P: Into<PathBuf>>(temp_dir: P) -> Self {
    let temp_dir = temp_dir.into();
    MountLayout {
      mount_base: temp_dir.join("mount"),
      temp_base: temp_dir.join("temp"),
      work_base: temp_dir.join("overlayfs"),
      temp_dir,
    }
  }

  pub fn create(&self) -> Result<(), RunBoxError> {
    for dir in [&self.mount_base, &self.temp_base, &self.work_base] {
      fs::create_dir(dir)
        .map_err(|err| RunBoxError::container(format!("Cannot create {}: {}", dir.display(), err)))?;
    }
    Ok(())
  }
}

/// Options of [`build_mount_view`]
#[derive(Debug, Clone)]
pub struct MountOptions {
  pub system_config: bool,
  /// Size of the tmpfs for shared memory
  pub memlimit: Option<u64>,
  /// Make the scratch directory visible inside the container for retrieving result files
  pub expose_results: bool,
}

/// `base` + absolute `path`
fn below(base: &Path, path: &Path) -> PathBuf {
  match path.strip_prefix("/") {
    Ok(relative) => base.join(relative),
    Err(_) => base.join(path),
  }
}

pub fn make_bind_mount(source: &Path, target: &Path, recursive: bool, private: bool) -> Result<(), Errno> {
  let mut flags = MsFlags::MS_BIND;
  if recursive {
    flags |= MsFlags::MS_REC;
  }
  mount(Some(source), target, None::<&str>, flags, None::<&str>)?;
  if private {
    let mut flags = MsFlags::MS_PRIVATE;
    if recursive {
      flags |= MsFlags::MS_REC;
    }
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>)?;
  }
  Ok(())
}

fn remount_with_additional_flags(mountpoint: &Path, existing: &[String], flags: MsFlags) -> Result<(), Errno> {
  let mut flags = flags | MsFlags::MS_REMOUNT | MsFlags::MS_BIND;
  for (option, flag) in MOUNT_FLAGS.iter() {
    if existing.iter().any(|o| o == option) {
      flags |= *flag;
    }
  }
  mount(None::<&str>, mountpoint, None::<&str>, flags, None::<&str>)
}

/// Escape characters with special meaning in overlayfs options
fn escape_overlay_path(path: &Path) -> String {
  path
    .to_string_lossy()
    .replace('\\', "\\\\")
    .replace(':', "\\:")
    .replace(',', "\\,")
}

fn find_executable(name: &str) -> Option<PathBuf> {
  let paths = env::var_os("PATH")?;
  env::split_paths(&paths)
    .map(|dir| dir.join(name))
    .find(|candidate| access(candidate.as_path(), AccessFlags::X_OK).is_ok())
}

fn make_overlay_mount(mount_path: &Path, lower: &Path, upper: &Path, work: &Path) -> Result<(), RunBoxError> {
  let options = format!(
    "lowerdir={},upperdir={},workdir={}",
    escape_overlay_path(lower),
    escape_overlay_path(upper),
    escape_overlay_path(work)
  );
  debug!(
    "Creating overlay mount: target={}, {}",
    mount_path.display(),
    options
  );
  let kernel_error = match mount(Some("none"), mount_path, Some("overlay"), MsFlags::empty(), Some(options.as_str())) {
    Ok(_) => return Ok(()),
    Err(errno) => errno,
  };

  // Kernel overlayfs refuses too deeply nested overlays
  let lower_display = lower.display().to_string();
  let fuse = match find_executable("fuse-overlayfs") {
    Some(fuse) => fuse,
    None => {
      return Err(RunBoxError::container(format!(
        "Creating overlay mount for '{}' failed: {}. Please use other directory modes, for example '--read-only-dir {}', or install fuse-overlayfs.",
        lower_display,
        kernel_error.desc(),
        escape_string_shell(&lower_display)
      )))
    }
  };
  info!(
    "Kernel overlayfs failed for {} ({}), using {}",
    lower_display,
    kernel_error.desc(),
    fuse.display()
  );
  let status = Command::new(&fuse)
    .arg("-o")
    .arg(&options)
    .arg(mount_path)
    .stdin(Stdio::null())
    .status()
    .map_err(|err| RunBoxError::container(format!("Cannot start {}: {}", fuse.display(), err)))?;
  if !status.success() {
    return Err(RunBoxError::container(format!(
      "Creating overlay mount for '{}' with fuse-overlayfs failed ({}). Please use other directory modes, for example '--read-only-dir {}'.",
      lower_display,
      status,
      escape_string_shell(&lower_display)
    )));
  }
  Ok(())
}

/// Build the file system of the container below `layout.mount_base` as a copy of the host
/// mount hierarchy with the modes of `policy` applied. Requires an own mount namespace.
pub fn build_mount_view(
  layout: &MountLayout,
  policy: &DirectoryPolicy,
  options: &MountOptions,
) -> Result<(), RunBoxError> {
  let mount_base = layout.mount_base.as_path();
  let temp_base = layout.temp_base.as_path();
  let work_base = layout.work_base.as_path();

  // Mounts of the host stay invisible to us and vice versa
  mount(
    None::<&str>,
    "/",
    None::<&str>,
    MsFlags::MS_REC | MsFlags::MS_PRIVATE,
    None::<&str>,
  )?;
  make_bind_mount(Path::new("/"), mount_base, true, true)?;

  // Every special directory has to be its own mount point to be covered below
  for entry in policy.special_dirs() {
    let mount_path = below(mount_base, entry.path());
    let temp_path = below(temp_base, entry.path());
    if mount_path.is_dir() {
      if let Err(err) = make_bind_mount(&mount_path, &mount_path, false, false) {
        // Non-recursive bind mounts fail on btrfs
        if err == Errno::EINVAL {
          if let Err(err) = make_bind_mount(&mount_path, &mount_path, true, false) {
            debug!("Failed to make {} a (recursive) bind mount: {}", mount_path.display(), err);
          }
        } else {
          debug!("Failed to make {} a bind mount: {}", mount_path.display(), err);
        }
      }
    }
    // Missing directories appear through the upper layer of the parent overlay
    create_dir_all(&temp_path)?;
  }

  if options.system_config {
    write_container_system_config(&temp_base.join("etc"))?;
  }

  let mounts = fs::read_to_string("/proc/self/mounts")?;
  for entry in parse_proc_mounts(&mounts) {
    let full_mountpoint = entry.mountpoint.as_path();
    if !path_is_below(full_mountpoint, mount_base) {
      continue;
    }
    let mountpoint = match full_mountpoint.strip_prefix(mount_base) {
      Ok(relative) => Path::new("/").join(relative),
      Err(_) => continue,
    };
    let mut mountpoint = mountpoint;
    let mut mode = match policy.determine_mode(&mountpoint, Some(entry.fstype.as_str())) {
      Some(mode) => mode,
      None => continue,
    };

    let parent = mountpoint.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("/"));
    if access(parent.as_path(), AccessFlags::X_OK).is_err() {
      // Hide the inaccessible ancestor, otherwise the mount point could become reachable
      let original = mountpoint.clone();
      let mut parent = parent;
      while access(parent.as_path(), AccessFlags::X_OK).is_err() {
        mountpoint = parent.clone();
        parent = match parent.parent() {
          Some(p) => p.to_path_buf(),
          None => break,
        };
      }
      mode = DirMode::Hidden;
      debug!(
        "Marking inaccessible directory '{}' as hidden because it contains a mountpoint at '{}'",
        mountpoint.display(),
        original.display()
      );
    } else {
      debug!("Mounting '{}' as {}", mountpoint.display(), mode);
    }

    let mount_path = below(mount_base, &mountpoint);
    let temp_path = below(temp_base, &mountpoint);
    let work_path = below(work_base, &mountpoint);

    match mode {
      DirMode::Overlay => {
        create_dir_all(&temp_path)?;
        create_dir_all(&work_path)?;
        if let Err(err) = umount(&mount_path) {
          debug!("Cannot unmount {}: {}", mount_path.display(), err);
        }
        make_overlay_mount(&mount_path, &mountpoint, &temp_path, &work_path)?;
      }
      DirMode::Hidden => {
        create_dir_all(&temp_path)?;
        if let Err(err) = umount(&mount_path) {
          debug!("Cannot unmount {}: {}", mount_path.display(), err);
        }
        make_bind_mount(&temp_path, &mount_path, false, false)?;
      }
      DirMode::ReadOnly => {
        if let Err(err) = remount_with_additional_flags(&mount_path, &entry.options, MsFlags::MS_RDONLY) {
          if err == Errno::EACCES {
            warn!(
              "Cannot mount '{}', directory may be missing from container",
              mountpoint.display()
            );
          } else {
            // Below an overlay or hidden directory the mount point has to be recreated first
            make_bind_mount(&mountpoint, &mount_path, true, true)?;
            remount_with_additional_flags(&mount_path, &entry.options, MsFlags::MS_RDONLY)?;
          }
        }
      }
      DirMode::FullAccess => {
        if let Err(err) = remount_with_additional_flags(&mount_path, &entry.options, MsFlags::empty()) {
          if err == Errno::EACCES {
            warn!(
              "Cannot mount '{}', directory may be missing from container",
              mountpoint.display()
            );
          } else {
            make_bind_mount(&mountpoint, &mount_path, true, true)?;
          }
        }
      }
    }
  }

  for shm in ["dev/shm", "run/shm"] {
    let shm_path = mount_base.join(shm);
    if !shm_path.is_dir() {
      continue;
    }
    let mut data = "mode=1777".to_string();
    if let Some(memlimit) = options.memlimit {
      data.push_str(&format!(",size={}", memlimit));
    }
    if let Err(err) = mount(
      Some("tmpfs"),
      &shm_path,
      Some("tmpfs"),
      MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
      Some(data.as_str()),
    ) {
      warn!("Cannot mount tmpfs on {}: {}", shm_path.display(), err);
    }
  }

  if options.system_config && policy.mode_for(Path::new("/etc")) != DirMode::Overlay {
    let etc = mount_base.join("etc");
    for (name, _) in CONTAINER_ETC_FILES.iter() {
      let target = etc.join(name);
      if target.exists() {
        make_bind_mount(&temp_base.join("etc").join(name), &target, false, true)?;
      }
    }
  }

  if options.expose_results && policy.mode_for(Path::new("/")) == DirMode::Overlay {
    let results = below(mount_base, Path::new(RESULT_FILES_DIR));
    create_dir_all(&results)?;
    make_bind_mount(temp_base, &results, false, true)?;
  }

  // Our own scratch directory must not be reachable from inside
  let own_dir = below(mount_base, &layout.temp_dir);
  if own_dir.is_dir() {
    let empty = layout.temp_dir.join("empty");
    create_dir_all(&empty)?;
    if let Err(err) = make_bind_mount(&empty, &own_dir, false, true) {
      warn!("Cannot hide {} inside container: {}", own_dir.display(), err);
    }
  }

  Ok(())
}

/// Make `target` the root of this mount namespace and detach the old root
pub fn pivot_into(target: &Path) -> Result<(), RunBoxError> {
  chdir(target)?;
  pivot_root(".", &below(Path::new("."), Path::new(OLD_ROOT)))?;
  chroot(".")?;
  // Below the old root the bind of the host /proc becomes visible again
  umount2(OLD_ROOT, MntFlags::MNT_DETACH)?;
  Ok(())
}

/// Mount a fresh proc for the pid namespace of the calling process
pub fn mount_proc(system_config: bool) -> Result<(), RunBoxError> {
  mount(Some("proc"), "/proc", Some("proc"), MsFlags::empty(), None::<&str>)?;

  if system_config && access(LXCFS_PROC_DIR, AccessFlags::R_OK).is_ok() {
    for entry in fs::read_dir(LXCFS_PROC_DIR)? {
      let entry = entry?;
      let target = Path::new("/proc").join(entry.file_name());
      if let Err(err) = make_bind_mount(&entry.path(), &target, false, true) {
        debug!("Cannot bind {} over {}: {}", entry.path().display(), target.display(), err);
      }
    }
    // Nested containers need a clean proc instance somewhere, the lxcfs binds break the first one
    mount(Some("proc"), "/proc/1/ns", Some("proc"), MsFlags::empty(), None::<&str>)?;
  }
  Ok(())
}
