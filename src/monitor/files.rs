use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, warn};
use walkdir::WalkDir;

use crate::container::{is_container_system_config_file, RESULT_FILES_DIR};
use crate::context::TerminationReason;
use crate::executor::CancelToken;
use crate::monitor::{KillAction, MonitorHandle, ReasonSlot};
use crate::RunBoxError;

/// Scans slower than this are reported
const SLOW_SCAN_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilesLimits {
  pub count: Option<u64>,
  /// Bytes
  pub size: Option<u64>,
}

impl FilesLimits {
  pub fn is_empty(&self) -> bool {
    self.count.is_none() && self.size.is_none()
  }

  /// The reason for killing the tool, if `usage` exceeds these limits
  pub fn check(&self, usage: &FilesUsage) -> Option<TerminationReason> {
    if matches!(self.count, Some(limit) if usage.count > limit) {
      Some(TerminationReason::FilesCount)
    } else if matches!(self.size, Some(limit) if usage.size > limit) {
      Some(TerminationReason::FilesSize)
    } else {
      None
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilesUsage {
  pub count: u64,
  pub size: u64,
}

/// Count regular files below `root` and sum up their sizes.
/// Symlinks and the synthetic `/etc` files of the container are not counted.
pub fn scan_files(root: &Path) -> FilesUsage {
  let results_dir = Path::new(RESULT_FILES_DIR.trim_start_matches('/'));
  let mut usage = FilesUsage::default();
  for entry in WalkDir::new(root)
    .follow_links(false)
    .into_iter()
    .filter_map(|e| e.ok())
  {
    if !entry.file_type().is_file() {
      continue;
    }
    let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
    if relative.starts_with(results_dir) || is_container_system_config_file(&Path::new("/").join(relative)) {
      continue;
    }
    usage.count += 1;
    // The file may just have been deleted
    if let Ok(metadata) = entry.metadata() {
      usage.size += metadata.len();
    }
  }
  usage
}

/// Every `interval`, check the files written by the tool below `root` against `limits`
pub fn spawn_files_monitor(
  root: PathBuf,
  limits: FilesLimits,
  interval: Duration,
  kill: KillAction,
  reason: ReasonSlot,
) -> Result<MonitorHandle, RunBoxError> {
  let cancel = CancelToken::new();
  let token = cancel.clone();
  MonitorHandle::spawn("files-monitor", cancel, move || loop {
    if token.wait_timeout(interval) {
      return;
    }

    let start = Instant::now();
    let usage = scan_files(&root);
    let duration = start.elapsed();

    if let Some(violated) = limits.check(&usage) {
      if !token.is_cancelled() {
        reason.set(violated);
        debug!(
          "Killing tool due to {} limit ({} files with {} bytes)",
          violated, usage.count, usage.size
        );
        kill();
      }
      return;
    }

    debug!(
      "Files monitor: {} files with {} bytes, scan took {:.3}s",
      usage.count,
      usage.size,
      duration.as_secs_f64()
    );
    if duration > SLOW_SCAN_THRESHOLD {
      warn!(
        "Scanning file hierarchy for enforcement of limits took {:.0}s",
        duration.as_secs_f64()
      );
    }
  })
}
