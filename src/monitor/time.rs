use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::context::TerminationReason;
use crate::executor::CancelToken;
use crate::monitor::{KillAction, MonitorHandle, ReasonSlot};
use crate::RunBoxError;

/// Stands in for a missing limit
const UNLIMITED: f64 = 60.0 * 60.0 * 24.0 * 365.0 * 100.0;

/// Checks never sleep longer than this
const MAX_CHECK_INTERVAL: f64 = 60.0 * 60.0;

/// Slack added to every sleep, the limits are only checked after they might be reached
const CHECK_SLACK: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeLimits {
  pub soft_cputime: Option<f64>,
  pub hard_cputime: Option<f64>,
  pub walltime: Option<f64>,
}

/// Seconds until the next check, given the remaining cpu and wall time
pub fn next_check_interval(remaining_cpu: f64, remaining_soft_cpu: f64, remaining_wall: f64, cpu_count: usize) -> f64 {
  let cpu_count = cpu_count.max(1) as f64;
  let remaining = (remaining_cpu / cpu_count)
    .min(remaining_soft_cpu / cpu_count)
    .min(remaining_wall)
    .min(MAX_CHECK_INTERVAL)
    .max(0.0);
  remaining + CHECK_SLACK
}

/// Watch cpu time (read by `read_cputime`) and wall time of the tool.
/// A violated soft limit sends SIGTERM via `terminate` once, hard limits `kill` the tool.
pub fn spawn_time_monitor(
  limits: TimeLimits,
  cpu_count: usize,
  read_cputime: Arc<dyn Fn() -> Option<f64> + Send + Sync>,
  terminate: KillAction,
  kill: KillAction,
  reason: ReasonSlot,
) -> Result<MonitorHandle, RunBoxError> {
  let cancel = CancelToken::new();
  let token = cancel.clone();
  let start = Instant::now();
  MonitorHandle::spawn("time-monitor", cancel, move || {
    let hard_limit = limits.hard_cputime.unwrap_or(UNLIMITED);
    let mut soft_limit = limits.soft_cputime.unwrap_or(UNLIMITED);
    let latest_kill_time = start + Duration::from_secs_f64(limits.walltime.unwrap_or(UNLIMITED).max(0.0));

    while !token.is_cancelled() {
      let used_cputime = read_cputime().unwrap_or(0.0);
      let remaining_cpu = hard_limit - used_cputime;
      let remaining_soft_cpu = soft_limit - used_cputime;
      let now = Instant::now();
      let remaining_wall = if now >= latest_kill_time {
        -(now - latest_kill_time).as_secs_f64()
      } else {
        (latest_kill_time - now).as_secs_f64()
      };
      debug!(
        "Time monitor: used cpu time {:.3}s, remaining cpu time {:.3}s, remaining soft cpu time {:.3}s, remaining wall time {:.3}s",
        used_cputime, remaining_cpu, remaining_soft_cpu, remaining_wall
      );

      if remaining_cpu <= 0.0 {
        reason.set(TerminationReason::Cputime);
        debug!("Killing tool due to cpu time timeout");
        kill();
        return;
      }
      if remaining_wall <= 0.0 {
        reason.set(TerminationReason::Walltime);
        warn!("Killing tool due to wall time timeout");
        kill();
        return;
      }
      if remaining_soft_cpu <= 0.0 {
        reason.set(TerminationReason::CputimeSoft);
        debug!("Asking tool to terminate due to soft cpu time limit");
        terminate();
        soft_limit = hard_limit;
      }

      let interval = next_check_interval(remaining_cpu, soft_limit - used_cputime, remaining_wall, cpu_count);
      token.wait_timeout(Duration::from_secs_f64(interval));
    }
  })
}
