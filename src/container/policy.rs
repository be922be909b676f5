use std::fmt::Display;
use std::fs::canonicalize;
use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::container::CONTAINER_HOME;
use crate::utils::path_is_below;
use crate::RunBoxError;

/// How a directory of the host is visible inside the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirMode {
  /// Replaced by an empty directory, writes go to the scratch area
  Hidden,
  ReadOnly,
  /// Host content as lower layer, writes go to the scratch area
  Overlay,
  /// Writes reach the host
  FullAccess,
}

impl DirMode {
  pub fn parse(text: &str) -> Result<Self, RunBoxError> {
    match text {
      "hidden" => Ok(DirMode::Hidden),
      "read-only" => Ok(DirMode::ReadOnly),
      "overlay" => Ok(DirMode::Overlay),
      "full-access" => Ok(DirMode::FullAccess),
      other => Err(RunBoxError::cli(format!("Unknown directory mode '{}'", other))),
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      DirMode::Hidden => "hidden",
      DirMode::ReadOnly => "read-only",
      DirMode::Overlay => "overlay",
      DirMode::FullAccess => "full-access",
    }
  }
}

impl Display for DirMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One user specified directory mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
  path: PathBuf,
  mode: DirMode,
}

impl DirEntry {
  pub fn new<P: Into<PathBuf>>(path: P, mode: DirMode) -> Self {
    DirEntry {
      path: path.into(),
      mode,
    }
  }

  fn canonicalize<PS: Into<PathBuf>>(path: PS) -> Result<PathBuf, RunBoxError> {
    let path: PathBuf = path.into();
    if path.is_absolute() {
      Ok(path)
    } else {
      canonicalize(&path).map_err(|err| RunBoxError::cli(format!("Invalid directory {}: {}", path.display(), err)))
    }
  }

  /// Parse a directory given on the command line, relative paths are resolved against the current directory
  pub fn parse(mode: DirMode, text: String) -> Result<Self, RunBoxError> {
    if text.is_empty() {
      error!("Parse {} directory fails, the path is empty", mode);
      return Err(RunBoxError::cli("Empty directory path"));
    }
    Ok(DirEntry {
      path: Self::canonicalize(text)?,
      mode,
    })
  }

  pub fn path(&self) -> &PathBuf {
    &self.path
  }

  pub fn mode(&self) -> DirMode {
    self.mode
  }
}

/// Mapping from every absolute path to a [`DirMode`], the longest configured prefix decides
#[derive(Debug, Clone)]
pub struct DirectoryPolicy {
  /// Sorted by path length, parents before children
  entries: Vec<DirEntry>,
}

impl DirectoryPolicy {
  /// `/` overlay, `/tmp` and `/run` hidden
  pub fn defaults() -> Vec<DirEntry> {
    vec![
      DirEntry::new("/", DirMode::Overlay),
      DirEntry::new("/run", DirMode::Hidden),
      DirEntry::new("/tmp", DirMode::Hidden),
    ]
  }

  /// Combine user entries with the defaults, user entries win.
  /// With the synthetic system config the container home is hidden unless configured.
  pub fn new(user_entries: Vec<DirEntry>, system_config: bool) -> Result<Self, RunBoxError> {
    let mut entries: Vec<DirEntry> = vec![];
    for entry in user_entries {
      if !entry.path.is_absolute() {
        return Err(RunBoxError::cli(format!(
          "Invalid non-absolute directory '{}'",
          entry.path.display()
        )));
      }
      if entry.path == Path::new("/proc") {
        return Err(RunBoxError::cli("Cannot specify directory mode for /proc"));
      }
      if entries.iter().any(|e| e.path == entry.path) {
        return Err(RunBoxError::cli(format!(
          "Cannot specify multiple directory modes for '{}'",
          entry.path.display()
        )));
      }
      entries.push(entry);
    }

    let mut defaults = Self::defaults();
    if system_config {
      defaults.push(DirEntry::new(CONTAINER_HOME, DirMode::Hidden));
    }
    for entry in defaults {
      if !entries.iter().any(|e| e.path == entry.path) {
        entries.push(entry);
      }
    }

    entries.sort_by_key(|entry| entry.path.as_os_str().len());
    debug!(
      "Directory modes: {}",
      entries
        .iter()
        .map(|e| format!("{}={}", e.path.display(), e.mode))
        .collect::<Vec<String>>()
        .join(", ")
    );
    Ok(DirectoryPolicy { entries })
  }

  pub fn entries(&self) -> &[DirEntry] {
    &self.entries
  }

  /// The configured mode for `path` (longest matching prefix), together with the mode of its parent entry
  fn lookup(&self, path: &Path) -> (DirMode, Option<DirMode>) {
    let mut result = DirMode::Overlay;
    let mut parent = None;
    for entry in self.entries.iter() {
      if path_is_below(path, &entry.path) {
        if path != entry.path {
          parent = Some(entry.mode);
        }
        result = entry.mode;
      }
    }
    (result, parent)
  }

  pub fn mode_for(&self, path: &Path) -> DirMode {
    self.lookup(path).0
  }

  /// Mode that a mount point at `path` with file system `fstype` should get.
  /// `None` means the mount point needs no treatment.
  pub fn determine_mode(&self, path: &Path, fstype: Option<&str>) -> Option<DirMode> {
    if fstype == Some("proc") {
      // The grandchild reads its pid from here, replaced later by a fresh proc
      return Some(DirMode::ReadOnly);
    }
    if path_is_below(path, Path::new("/proc")) {
      return None;
    }

    let (mode, parent) = self.lookup(path);

    if mode == DirMode::Overlay
      && (path_is_below(path, Path::new("/dev"))
        || path_is_below(path, Path::new("/sys"))
        || fstype == Some("fuse.lxcfs")
        || fstype == Some("cgroup"))
    {
      return Some(DirMode::ReadOnly);
    }

    if mode == DirMode::Overlay {
      if let Some(fstype) = fstype {
        if fstype.starts_with("fuse.") || matches!(fstype, "autofs" | "vfat" | "ntfs") {
          debug!(
            "Cannot use overlay mode for {} because it has file system {}, using read-only mode instead",
            path.display(),
            fstype
          );
          return Some(DirMode::ReadOnly);
        }
      }
    }

    if mode == DirMode::Hidden && parent == Some(DirMode::Hidden) {
      return None;
    }
    Some(mode)
  }

  /// Configured directories that need to become mount points of their own,
  /// entries with the same mode as their parent entry are covered by the parent.
  pub fn special_dirs(&self) -> Vec<&DirEntry> {
    self
      .entries
      .iter()
      .filter(|entry| {
        let parent = entry.path.parent().map(|p| self.mode_for(p));
        entry.path == Path::new("/") || parent != Some(entry.mode)
      })
      .collect()
  }
}
