use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub use base::{BaseExecutor, ForkStarter, StopHandle};
pub use container::{transfer_output_files, ContainerSettings, ContainerStarter, HANDSHAKE_TIMEOUT};
pub use protocol::{HandshakeState, Message};
pub use run::{RunExecutor, MAX_START_ATTEMPTS};

use nix::unistd::Pid;

use crate::cgroup::Cgroups;
use crate::context::ProcessStatus;
use crate::RunBoxError;

mod base;
mod container;
mod protocol;
mod run;

/// Cancellation flag shared between the controlling thread and whoever may stop a run.
/// Sleeping threads are woken up as soon as it is set.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<CancelInner>);

#[derive(Default)]
struct CancelInner {
  cancelled: AtomicBool,
  lock: Mutex<()>,
  wakeup: Condvar,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.cancelled.store(true, Ordering::SeqCst);
    if let Ok(_guard) = self.0.lock.lock() {
      self.0.wakeup.notify_all();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.cancelled.load(Ordering::SeqCst)
  }

  /// Sleep for at most `timeout`. Returns whether the token was cancelled.
  pub fn wait_timeout(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut guard = match self.0.lock.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    while !self.is_cancelled() {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return false;
      }
      guard = match self.0.wakeup.wait_timeout(guard, remaining) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
      };
    }
    true
  }
}

/// Everything a [`ProcessStarter`] needs to start the tool once
pub struct ProcessRequest<'a> {
  pub args: &'a [String],
  /// The complete environment of the tool
  pub env: Vec<(String, String)>,
  pub cwd: PathBuf,
  pub stdin: Option<&'a Path>,
  pub output: &'a Path,
  /// Fresh cgroup of this run
  pub cgroups: &'a Cgroups,
  /// Private scratch directory of this run
  pub temp_dir: &'a Path,
  pub memlimit: Option<u64>,
  /// Seconds for RLIMIT_CPU
  pub cpu_rlimit: Option<u64>,
  pub output_dir: Option<&'a Path>,
  pub result_files: &'a [String],
}

/// What the starter learned about the tool once it is placed in its cgroup
pub struct StartedProcess {
  /// The tool itself, as seen from outside of any namespace
  pub pid: Pid,
  /// The group whose processes make up the tool, target of every kill
  pub tool_cgroups: Cgroups,
  /// Where files written by the tool can be found from the outside
  pub files_root: PathBuf,
}

/// Callbacks of the run executor around the lifetime of the tool
pub trait ExecutionHooks {
  /// The tool is in its cgroup and running (or about to), measurement starts here
  fn started(&mut self, process: &StartedProcess) -> Result<(), RunBoxError>;

  /// The tool terminated, called before any result file is touched
  fn finished(&mut self, status: &ProcessStatus);
}

/// A strategy for starting the tool and waiting for it
pub trait ProcessStarter: Send + Sync {
  fn name(&self) -> &'static str;

  /// Point `HOME` and the temp directory variables to directories private to this run
  fn prepare_environment(&self, temp_dir: &Path, env: &mut Vec<(String, String)>) -> Result<(), RunBoxError>;

  /// Whether result files can be retrieved with this strategy
  fn supports_result_files(&self) -> bool;

  /// Start the tool, wait for it, and return its status
  fn run(&self, request: &ProcessRequest, hooks: &mut dyn ExecutionHooks) -> Result<ProcessStatus, RunBoxError>;
}

/// Set `key` in `env`, replacing an existing entry
pub(crate) fn set_env<K: Into<String>, V: Into<String>>(env: &mut Vec<(String, String)>, key: K, value: V) {
  let key = key.into();
  let value = value.into();
  match env.iter_mut().find(|(k, _)| *k == key) {
    Some(entry) => entry.1 = value,
    None => env.push((key, value)),
  }
}

pub(crate) const TEMP_DIR_VARIABLES: [&str; 4] = ["TMPDIR", "TMP", "TEMPDIR", "TEMP"];
