use std::env;
use std::path::PathBuf;

use clap::Parser;
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::{debug, info};
use nix::sys::signal::{SigSet, Signal};

use runbox::container::DirMode;
use runbox::utils::{default_format, parse_int_list, parse_memory_value, parse_timespan_value, GidType, UidType};
use runbox::{ResourceLimits, RunBox, RunBoxBuilder, RunBoxError, RunBoxExit, StopHandle};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[arg(long, help = "Memory limit, with optional unit (B, kB, MB, GB, TB)")]
  memlimit: Option<String>,

  #[arg(long, help = "Hard cpu time limit, with optional unit (s, min, h, d)")]
  timelimit: Option<String>,

  #[arg(long, help = "Soft cpu time limit, the tool gets SIGTERM when it is reached")]
  softtimelimit: Option<String>,

  #[arg(long, help = "Wall time limit, defaults to the hard cpu time limit plus 30s")]
  walltimelimit: Option<String>,

  #[arg(long, help = "List of cores the tool may use, like 0-3,5")]
  cores: Option<String>,

  #[arg(long = "memoryNodes", help = "List of memory nodes the tool may use")]
  memory_nodes: Option<String>,

  #[arg(long, help = "Run the tool inside a container (default)")]
  container: bool,

  #[arg(long, conflicts_with = "container", help = "Run the tool as plain child process")]
  no_container: bool,

  #[arg(long = "hidden-dir", help = "Hide this directory inside the container")]
  hidden_dir: Vec<String>,

  #[arg(long = "read-only-dir", help = "Make this directory read-only inside the container")]
  read_only_dir: Vec<String>,

  #[arg(long = "overlay-dir", help = "Redirect writes to this directory into a scratch area")]
  overlay_dir: Vec<String>,

  #[arg(long = "full-access-dir", help = "Give full access to this directory of the host")]
  full_access_dir: Vec<String>,

  #[arg(long = "network-access", help = "Keep network access of the host")]
  network_access: bool,

  #[arg(long, help = "Read stdin of the tool from this file")]
  input: Option<PathBuf>,

  #[arg(long, default_value = "output.log", help = "File for the output of the tool")]
  output: PathBuf,

  #[arg(long = "maxOutputSize", help = "Shrink the output file to this size")]
  max_output_size: Option<String>,

  #[arg(long = "filesCountLimit", help = "Number of files the tool may write")]
  files_count_limit: Option<u64>,

  #[arg(long = "filesSizeLimit", help = "Size of the files the tool may write")]
  files_size_limit: Option<String>,

  #[arg(long = "output-directory", help = "Directory receiving the result files")]
  output_directory: Option<PathBuf>,

  #[arg(long = "result-files", help = "Patterns of result files to retrieve from the container")]
  result_files: Vec<String>,

  #[arg(long, help = "Working directory of the tool")]
  dir: Option<PathBuf>,

  #[arg(long, help = "Pass environment variable KEY=VALUE, or KEY with its current value")]
  env: Vec<String>,

  #[arg(long = "keep-system-config", help = "Keep /etc of the host instead of the synthetic identity")]
  keep_system_config: bool,

  #[arg(long = "keep-tmp", help = "Do not remove temp directories")]
  keep_tmp: bool,

  #[arg(long, help = "Inner uid in the container")]
  uid: Option<UidType>,

  #[arg(long, help = "Inner gid in the container")]
  gid: Option<GidType>,

  #[arg(long, help = "Print debug log")]
  debug: bool,

  #[arg(long, conflicts_with = "debug", help = "Only print warnings")]
  quiet: bool,

  #[arg(required = true, trailing_var_arg = true, help = "Command and arguments")]
  command: Vec<String>,
}

impl Cli {
  fn limits(&self) -> Result<ResourceLimits, RunBoxError> {
    let parse_time = |value: &Option<String>| value.as_deref().map(parse_timespan_value).transpose();
    let parse_memory = |value: &Option<String>| value.as_deref().map(parse_memory_value).transpose();
    Ok(ResourceLimits {
      soft_cputime: parse_time(&self.softtimelimit)?,
      hard_cputime: parse_time(&self.timelimit)?,
      walltime: parse_time(&self.walltimelimit)?,
      memory: parse_memory(&self.memlimit)?,
      cores: self.cores.as_deref().map(parse_int_list).transpose()?,
      memory_nodes: self.memory_nodes.as_deref().map(parse_int_list).transpose()?,
      files_count: self.files_count_limit,
      files_size: parse_memory(&self.files_size_limit)?,
    })
  }

  fn resolve(self) -> Result<RunBox, RunBoxError> {
    let limits = self.limits()?;
    let max_output_size = self.max_output_size.as_deref().map(parse_memory_value).transpose()?;
    let (program, arguments) = match self.command.split_first() {
      Some((program, arguments)) => (program.clone(), arguments.to_vec()),
      None => return Err(RunBoxError::cli("No command given")),
    };

    let builder = RunBoxBuilder::new()
      .set_container(!self.no_container)
      .network_access(self.network_access)
      .system_config(!self.keep_system_config)
      .keep_tmp(self.keep_tmp)
      .set_uid(self.uid)
      .set_gid(self.gid)
      .parse_dirs(DirMode::Hidden, self.hidden_dir)?
      .parse_dirs(DirMode::ReadOnly, self.read_only_dir)?
      .parse_dirs(DirMode::Overlay, self.overlay_dir)?
      .parse_dirs(DirMode::FullAccess, self.full_access_dir)?
      .parse_env_list(self.env)?
      .set_default_limits(limits)
      .set_default_cwd(self.dir);

    builder
      .command(program, arguments)
      .set_stdin(self.input)
      .output(self.output)
      .max_output_size(max_output_size)
      .set_output_dir(self.output_directory)
      .set_result_files(self.result_files)
      .build()
  }
}

const STOP_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

fn stop_signals() -> SigSet {
  let mut set = SigSet::empty();
  for signal in STOP_SIGNALS {
    set.add(signal);
  }
  set
}

/// Stop the executor on SIGINT, SIGTERM or SIGQUIT.
/// The signals are blocked in every thread and received by a dedicated one.
fn spawn_signal_handler(handle: StopHandle) -> Result<(), RunBoxError> {
  std::thread::Builder::new()
    .name("runbox-signals".to_string())
    .spawn(move || loop {
      match stop_signals().wait() {
        Ok(signal) => {
          info!("Received {}, stopping", signal);
          handle.stop();
        }
        Err(err) => {
          debug!("Waiting for signals failed: {}", err);
          return;
        }
      }
    })
    .map_err(|err| RunBoxError::fork(format!("Cannot start signal handler thread: {}", err)))?;
  Ok(())
}

fn start(cli: Cli) -> Result<RunBoxExit, RunBoxError> {
  let (log_spec, duplicate) = if cli.debug {
    ("runbox=debug", Duplicate::Debug)
  } else if cli.quiet {
    ("runbox=warn", Duplicate::Warn)
  } else {
    ("runbox=info", Duplicate::Warn)
  };
  // Before any other thread exists, so all of them inherit the mask
  stop_signals().thread_block()?;

  let _logger = Logger::try_with_str(log_spec)?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
        .basename("runbox")
        .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
        .suppress_timestamp(),
    )
    .append()
    .duplicate_to_stderr(duplicate)
    .format_for_files(default_format)
    .format_for_stderr(default_format)
    .start()?;

  let mut runbox = cli.resolve()?;
  spawn_signal_handler(runbox.executor().stop_handle())?;

  info!("Start running runbox");
  runbox.start()?;
  runbox.report();
  info!("Running runbox finished");

  Ok(match runbox.results().first() {
    Some(result) => RunBoxExit::Code(result.as_exit_code()),
    None => RunBoxExit::Ok,
  })
}

fn main() -> RunBoxExit {
  let cli = Cli::parse();
  match start(cli) {
    Ok(exit) => exit,
    Err(err) => RunBoxExit::Err(err),
  }
}
