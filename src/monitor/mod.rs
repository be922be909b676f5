use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};

pub use files::{scan_files, spawn_files_monitor, FilesLimits, FilesUsage};
pub use oom::spawn_oom_monitor;
pub use time::{next_check_interval, spawn_time_monitor, TimeLimits};

use crate::context::TerminationReason;
use crate::executor::CancelToken;
use crate::RunBoxError;

mod files;
mod oom;
mod time;

/// Kills the tool, shared by all monitors of a run
pub type KillAction = Arc<dyn Fn() + Send + Sync>;

/// The reason of the first monitor that terminated the tool
#[derive(Clone, Default)]
pub struct ReasonSlot(Arc<Mutex<Option<TerminationReason>>>);

impl ReasonSlot {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record `reason` unless another one was recorded before. Returns whether it was recorded.
  pub fn set(&self, reason: TerminationReason) -> bool {
    let mut slot = match self.0.lock() {
      Ok(slot) => slot,
      Err(poisoned) => poisoned.into_inner(),
    };
    if slot.is_none() {
      debug!("Termination reason: {}", reason);
      *slot = Some(reason);
      true
    } else {
      false
    }
  }

  pub fn get(&self) -> Option<TerminationReason> {
    match self.0.lock() {
      Ok(slot) => *slot,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }
}

/// A running monitor thread
pub struct MonitorHandle {
  name: &'static str,
  cancel: CancelToken,
  thread: Option<JoinHandle<()>>,
  /// Wakes up a thread that blocks somewhere else than on `cancel`
  wakeup: Option<Box<dyn Fn() + Send>>,
}

impl MonitorHandle {
  pub(crate) fn spawn<F>(name: &'static str, cancel: CancelToken, body: F) -> Result<Self, RunBoxError>
  where
    F: FnOnce() + Send + 'static,
  {
    let thread = std::thread::Builder::new()
      .name(format!("runbox-{}", name))
      .spawn(body)
      .map_err(|err| RunBoxError::fork(format!("Cannot start {} monitor: {}", name, err)))?;
    Ok(MonitorHandle {
      name,
      cancel,
      thread: Some(thread),
      wakeup: None,
    })
  }

  pub(crate) fn with_wakeup(mut self, wakeup: Box<dyn Fn() + Send>) -> Self {
    self.wakeup = Some(wakeup);
    self
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn is_finished(&self) -> bool {
    self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
  }

  /// Stop the monitor and wait for its thread
  pub fn cancel_and_join(mut self) {
    self.shutdown();
  }

  fn shutdown(&mut self) {
    self.cancel.cancel();
    if let Some(wakeup) = &self.wakeup {
      wakeup();
    }
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        warn!("The {} monitor panicked", self.name);
      }
    }
  }
}

impl Drop for MonitorHandle {
  fn drop(&mut self) {
    self.shutdown();
  }
}
