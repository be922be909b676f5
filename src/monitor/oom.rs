use std::fs::OpenOptions;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use log::{debug, warn};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{close, read, write};

use crate::cgroup::{Cgroups, MEMORY};
use crate::context::TerminationReason;
use crate::executor::CancelToken;
use crate::monitor::{KillAction, MonitorHandle, ReasonSlot};
use crate::utils::write_file;
use crate::RunBoxError;

/// Limit written after an OOM event, so the killed tool can still terminate
const RELAXED_MEMORY_LIMIT: u64 = 1 << 50;

/// Closed once neither the monitor thread nor its wakeup use it anymore
struct EventFd(RawFd);

impl Drop for EventFd {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

/// Kill the tool on an OOM event of the memory cgroup (cgroup v1 only).
/// The kernel OOM killer of the group is disabled, so the whole tool stops instead of a random process.
///
/// `signal` must not wait for the processes to exit. Processes waiting for memory cannot exit
/// before the limit is raised, so the blocking `kill` only runs afterwards.
pub fn spawn_oom_monitor(
  cgroups: &Cgroups,
  signal: KillAction,
  kill: KillAction,
  reason: ReasonSlot,
) -> Result<MonitorHandle, RunBoxError> {
  let cgroup = cgroups
    .path(MEMORY)
    .ok_or_else(|| RunBoxError::cgroup("No memory cgroup for the OOM monitor"))?
    .to_path_buf();

  let oom_control = OpenOptions::new()
    .write(true)
    .open(cgroup.join("memory.oom_control"))?;
  let efd = Arc::new(EventFd(eventfd(0, EfdFlags::EFD_CLOEXEC)?));
  if let Err(err) = write_file(
    cgroup.join("cgroup.event_control"),
    format!("{} {}", efd.0, oom_control.as_raw_fd()),
  ) {
    return Err(RunBoxError::cgroup(format!("Cannot register for OOM events: {}", err)));
  }
  if let Err(err) = write(oom_control.as_raw_fd(), b"1") {
    debug!("Failed to disable kernel-side OOM killer: {}", err);
  }
  drop(oom_control);

  let cancel = CancelToken::new();
  let token = cancel.clone();
  let thread_efd = efd.clone();
  let handle = MonitorHandle::spawn("oom-monitor", cancel, move || {
    let mut buffer = [0u8; 8];
    // The kernel also sends an event when the cgroup is removed
    let result = read(thread_efd.0, &mut buffer);
    if result.is_ok() && !token.is_cancelled() {
      reason.set(TerminationReason::Memory);
      debug!("Killing tool due to out-of-memory event from kernel");
      signal();
      // memsw first, it may never be lower than the plain limit
      for name in ["memory.memsw.limit_in_bytes", "memory.limit_in_bytes"] {
        let file = cgroup.join(name);
        if file.exists() {
          if let Err(err) = write_file(&file, RELAXED_MEMORY_LIMIT.to_string()) {
            warn!("Failed to increase {} after OOM: {}", name, err);
          }
        }
      }
      kill();
    }
  })?;

  Ok(handle.with_wakeup(Box::new(move || {
    let _ = write(efd.0, &1u64.to_ne_bytes());
  })))
}
