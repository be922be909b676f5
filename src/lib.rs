pub use context::{
  ProcessExitCode, ProcessStatus, ResourceLimits, RunBox, RunBoxBuilder, RunBoxOption, RunBoxOptionBuilder,
  RunBoxResult, TerminationReason,
};
pub use error::{RunBoxError, RunBoxExit};
pub use executor::{CancelToken, RunExecutor, StopHandle};

pub mod cgroup;
pub mod container;
pub mod context;
mod error;
pub mod executor;
pub mod monitor;
pub mod system;
pub mod utils;
