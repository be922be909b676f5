use std::path::PathBuf;
use std::time::Duration;

use log::debug;

use crate::container::{DirEntry, DirMode, DirectoryPolicy};
use crate::context::{ResourceLimits, RunBox, RunBoxOption};
use crate::executor::{BaseExecutor, CancelToken, ContainerSettings, ContainerStarter, ForkStarter, ProcessStarter, RunExecutor};
use crate::utils::{parse_env, GidType, UidType};
use crate::RunBoxError;

/// Build RunBox
pub struct RunBoxBuilder {
  options: Vec<RunBoxOption>,
  container: bool,
  dirs: Vec<DirEntry>,
  network_access: bool,
  system_config: bool,
  keep_tmp: bool,
  uid: Option<UidType>,
  gid: Option<GidType>,
  cancel: Option<CancelToken>,
  env: Vec<(String, String)>,
  limits: ResourceLimits,
  cwd: Option<PathBuf>,
}

/// Build RunBox running option
pub struct RunBoxOptionBuilder {
  parent: RunBoxBuilder,
  option: RunBoxOption,
}

impl Default for RunBoxBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl RunBoxBuilder {
  /// Container mode with the synthetic system config
  pub fn new() -> Self {
    RunBoxBuilder {
      options: vec![],
      container: true,
      dirs: vec![],
      network_access: false,
      system_config: true,
      keep_tmp: false,
      uid: None,
      gid: None,
      cancel: None,
      env: vec![],
      limits: ResourceLimits::default(),
      cwd: None,
    }
  }

  /// Create a RunBox running the tool inside a container
  pub fn container() -> Self {
    Self::new()
  }

  /// Create a RunBox running the tool as plain child process
  pub fn fork() -> Self {
    Self::new().set_container(false)
  }

  /// Create a new command to be run, inheriting the defaults of this builder
  pub fn command<PS: Into<String>, AS: Into<String>>(self, program: PS, arguments: Vec<AS>) -> RunBoxOptionBuilder {
    let mut args = vec![program.into()];
    args.extend(arguments.into_iter().map(|a| a.into()));
    let mut option = RunBoxOption::new(args);
    option.limits = self.limits.clone();
    option.cwd = self.cwd.clone();
    option.env = self.env.clone();
    RunBoxOptionBuilder { parent: self, option }
  }

  /// Build RunBox after setting all the options
  pub fn build(self) -> Result<RunBox, RunBoxError> {
    let cancel = self.cancel.unwrap_or_default();
    let base = BaseExecutor::new(cancel);

    let starter: Box<dyn ProcessStarter> = if self.container {
      let policy = DirectoryPolicy::new(self.dirs, self.system_config)?;
      let mut settings = ContainerSettings::new(policy, self.network_access, self.system_config);
      if let Some(uid) = self.uid {
        settings.uid = uid;
      }
      if let Some(gid) = self.gid {
        settings.gid = gid;
      }
      Box::new(ContainerStarter::new(base.clone(), settings))
    } else {
      if !self.dirs.is_empty() || self.network_access {
        return Err(RunBoxError::cli(
          "Directory modes and network access can only be configured in container mode",
        ));
      }
      if self.uid.is_some() || self.gid.is_some() {
        return Err(RunBoxError::cli("Uid and gid can only be changed in container mode"));
      }
      Box::new(ForkStarter::new(base.clone()))
    };
    debug!("Building RunBox with {} commands", self.options.len());

    Ok(RunBox {
      executor: RunExecutor::new(starter, base, self.keep_tmp),
      options: self.options,
      results: vec![],
    })
  }

  pub fn set_container(mut self, flag: bool) -> Self {
    self.container = flag;
    self
  }

  /// Set the mode of a directory inside the container
  pub fn dir<P: Into<PathBuf>>(mut self, path: P, mode: DirMode) -> Self {
    self.dirs.push(DirEntry::new(path, mode));
    self
  }

  /// Parse directories given on the command line with the same mode
  pub fn parse_dirs(mut self, mode: DirMode, list: Vec<String>) -> Result<Self, RunBoxError> {
    for text in list {
      self.dirs.push(DirEntry::parse(mode, text)?);
    }
    Ok(self)
  }

  pub fn network_access(mut self, flag: bool) -> Self {
    self.network_access = flag;
    self
  }

  /// Use the synthetic `/etc` identity inside the container or the one of the host
  pub fn system_config(mut self, flag: bool) -> Self {
    self.system_config = flag;
    self
  }

  /// Keep temp directories for debugging
  pub fn keep_tmp(mut self, flag: bool) -> Self {
    self.keep_tmp = flag;
    self
  }

  pub fn set_uid(mut self, uid: Option<UidType>) -> Self {
    self.uid = uid;
    self
  }

  pub fn set_gid(mut self, gid: Option<GidType>) -> Self {
    self.gid = gid;
    self
  }

  /// Share a cancellation token, once it is cancelled no further run starts
  pub fn cancel_token(mut self, token: CancelToken) -> Self {
    self.cancel = Some(token);
    self
  }

  /// Set default limits
  pub fn set_default_limits(mut self, limits: ResourceLimits) -> Self {
    self.limits = limits;
    self
  }

  /// Set default cwd
  pub fn set_default_cwd(mut self, path: Option<PathBuf>) -> Self {
    self.cwd = path;
    self
  }

  /// Parse default env list
  pub fn parse_env_list(mut self, list: Vec<String>) -> Result<Self, RunBoxError> {
    for env_var in list {
      self.env.push(parse_env(env_var)?);
    }
    Ok(self)
  }
}

impl RunBoxOptionBuilder {
  /// Finish building, return RunBoxBuilder
  pub fn done(self) -> RunBoxBuilder {
    let mut builder = self.parent;
    builder.options.push(self.option);
    builder
  }

  /// Finish building, return RunBox
  pub fn build(self) -> Result<RunBox, RunBoxError> {
    self.done().build()
  }

  /// Finish building, return only the option for an executor created elsewhere
  pub fn into_option(self) -> RunBoxOption {
    self.option
  }

  pub fn limits(mut self, limits: ResourceLimits) -> Self {
    self.option.limits = limits;
    self
  }

  /// Set hard cpu time limit (unit: s)
  pub fn cputime_limit(mut self, value: f64) -> Self {
    self.option.limits.hard_cputime = Some(value);
    self
  }

  /// Set soft cpu time limit (unit: s)
  pub fn soft_cputime_limit(mut self, value: f64) -> Self {
    self.option.limits.soft_cputime = Some(value);
    self
  }

  /// Set wall time limit (unit: s)
  pub fn walltime_limit(mut self, value: f64) -> Self {
    self.option.limits.walltime = Some(value);
    self
  }

  /// Set memory limit (unit: B)
  pub fn memory_limit(mut self, value: u64) -> Self {
    self.option.limits.memory = Some(value);
    self
  }

  pub fn cores(mut self, cores: Vec<usize>) -> Self {
    self.option.limits.cores = Some(cores);
    self
  }

  pub fn memory_nodes(mut self, nodes: Vec<usize>) -> Self {
    self.option.limits.memory_nodes = Some(nodes);
    self
  }

  pub fn files_count_limit(mut self, value: u64) -> Self {
    self.option.limits.files_count = Some(value);
    self
  }

  /// Set limit of the size of written files (unit: B)
  pub fn files_size_limit(mut self, value: u64) -> Self {
    self.option.limits.files_size = Some(value);
    self
  }

  /// Set stdin redirection or not
  pub fn set_stdin<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
    self.option.stdin = path.map(|p| p.into());
    self
  }

  /// Set stdin redirection
  pub fn stdin<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.option.stdin = Some(path.into());
    self
  }

  /// Set the file receiving the header, stdout and stderr
  pub fn output<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.option.output = path.into();
    self
  }

  /// Set work directory or not
  pub fn set_cwd(mut self, path: Option<PathBuf>) -> Self {
    if let Some(path) = path {
      self.option.cwd = Some(path);
    }
    self
  }

  /// Set work directory
  pub fn cwd<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.option.cwd = Some(path.into());
    self
  }

  /// Pass env
  pub fn env<KS: Into<String>, VS: Into<String>>(mut self, key: KS, value: VS) -> Self {
    self.option.env.push((key.into(), value.into()));
    self
  }

  pub fn max_output_size(mut self, value: Option<u64>) -> Self {
    self.option.max_output_size = value;
    self
  }

  /// Move files matching `patterns` into `output_dir` after the run
  pub fn result_files<P: Into<PathBuf>, S: Into<String>>(mut self, output_dir: P, patterns: Vec<S>) -> Self {
    self.option.output_dir = Some(output_dir.into());
    self.option.result_files = patterns.into_iter().map(|p| p.into()).collect();
    self
  }

  pub fn set_output_dir(mut self, output_dir: Option<PathBuf>) -> Self {
    self.option.output_dir = output_dir;
    self
  }

  pub fn set_result_files(mut self, patterns: Vec<String>) -> Self {
    self.option.result_files = patterns;
    self
  }

  pub fn files_monitor_interval(mut self, interval: Duration) -> Self {
    self.option.files_monitor_interval = interval;
    self
  }
}
