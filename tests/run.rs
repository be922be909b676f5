use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::thread::sleep;
use std::time::Duration;

use log::info;
use tempfile::tempdir;

use runbox::container::DirMode;
use runbox::{RunBoxBuilder, RunBoxError, RunBoxOptionBuilder, RunBoxResult, TerminationReason};

mod common;

fn run_single(builder: RunBoxOptionBuilder) -> Result<RunBoxResult, RunBoxError> {
  let mut runbox = builder.build()?;
  runbox.start()?;
  Ok(runbox.results()[0].clone())
}

/// Container runs need unprivileged user namespaces, which not every host provides
fn run_in_container(builder: RunBoxOptionBuilder) -> Option<RunBoxResult> {
  match run_single(builder) {
    Ok(result) if result.termination_reason() == Some(TerminationReason::Failed) => {
      info!("Container setup failed, skipping");
      None
    }
    Ok(result) => Some(result),
    Err(err @ RunBoxError::Config(_)) | Err(err @ RunBoxError::Cli(_)) => panic!("Unexpected error: {}", err),
    Err(err) => {
      info!("Container not available, skipping: {}", err);
      None
    }
  }
}

fn output_lines(path: &Path) -> Vec<String> {
  fs::read_to_string(path)
    .unwrap()
    .lines()
    .map(|line| line.to_string())
    .collect()
}

#[test]
fn it_should_echo() {
  common::setup();
  let dir = tempdir().unwrap();
  let output = dir.path().join("output.log");

  let result = run_single(
    RunBoxBuilder::fork()
      .command("echo", vec!["TEST_TOKEN"])
      .output(&output),
  )
  .unwrap();

  info!("Result: {:?}", result.entries());
  assert!(result.exitcode().unwrap().is_success());
  assert_eq!(result.termination_reason(), None);
  assert!(result.walltime() < 5.0);
  assert!(result.starttime().is_some());

  let lines = output_lines(&output);
  assert_eq!(lines.first().map(|s| s.as_str()), Some("echo TEST_TOKEN"));
  assert_eq!(lines.last().map(|s| s.as_str()), Some("TEST_TOKEN"));
}

#[test]
fn it_should_pass_input_and_environment() {
  common::setup();
  let dir = tempdir().unwrap();
  let input = dir.path().join("input.txt");
  let output = dir.path().join("output.log");
  fs::write(&input, "from stdin\n").unwrap();

  let result = run_single(
    RunBoxBuilder::fork()
      .command("sh", vec!["-c", "cat; echo \"$RUNBOX_VALUE\"; echo \"$HOME\""])
      .stdin(&input)
      .env("RUNBOX_VALUE", "from env")
      .output(&output),
  )
  .unwrap();

  assert!(result.exitcode().unwrap().is_success());
  let lines = output_lines(&output);
  let n = lines.len();
  assert_eq!(lines[n - 3], "from stdin");
  assert_eq!(lines[n - 2], "from env");
  // HOME is private to the run
  assert!(lines[n - 1].ends_with("/home"));
  assert!(!Path::new(&lines[n - 1]).exists());
}

#[test]
fn it_should_report_return_value() {
  common::setup();
  let dir = tempdir().unwrap();
  let result = run_single(
    RunBoxBuilder::fork()
      .command("sh", vec!["-c", "exit 7"])
      .output(dir.path().join("output.log")),
  )
  .unwrap();
  assert_eq!(result.exitcode().unwrap().value(), Some(7));
  assert_eq!(result.as_exit_code(), 7);
}

#[test]
fn it_should_kill_on_walltime() {
  common::setup();
  let dir = tempdir().unwrap();
  let result = run_single(
    RunBoxBuilder::fork()
      .command("sleep", vec!["10"])
      .walltime_limit(1.0)
      .output(dir.path().join("output.log")),
  )
  .unwrap();

  info!("Result: {:?}", result.entries());
  assert_eq!(result.termination_reason(), Some(TerminationReason::Walltime));
  assert_eq!(result.exitcode().unwrap().signal(), Some(9));
  assert!(result.walltime() >= 1.0);
  assert!(result.walltime() < 8.0);
  assert!(result.cputime().unwrap_or(0.0) < 0.5);
}

#[test]
fn it_should_kill_on_cputime() {
  common::setup();
  let dir = tempdir().unwrap();
  let result = run_single(
    RunBoxBuilder::fork()
      .command("sh", vec!["-c", "while :; do :; done"])
      .cputime_limit(1.0)
      .output(dir.path().join("output.log")),
  )
  .unwrap();

  info!("Result: {:?}", result.entries());
  assert_eq!(result.termination_reason(), Some(TerminationReason::Cputime));
  assert!(result.exitcode().unwrap().signal().is_some());
  assert!(result.cputime().unwrap() >= 0.9);
  assert!(result.walltime() < 20.0);
}

#[test]
fn it_should_kill_on_memory() {
  common::setup();
  let dir = tempdir().unwrap();
  let output = dir.path().join("output.log");
  // No wall time limit, the memory limit alone has to end the run
  let (sender, receiver) = mpsc::channel();
  std::thread::spawn(move || {
    let result = match run_single(
      RunBoxBuilder::fork()
        .command("tail", vec!["/dev/zero"])
        .memory_limit(64 * 1000 * 1000)
        .output(output),
    ) {
      Ok(result) => Ok(Some(result)),
      Err(err @ RunBoxError::Config(_)) | Err(err @ RunBoxError::Cgroup(_)) => {
        info!("Memory cgroup not available, skipping: {}", err);
        Ok(None)
      }
      Err(err) => Err(err.to_string()),
    };
    let _ = sender.send(result);
  });
  let result = match receiver
    .recv_timeout(Duration::from_secs(60))
    .expect("Run with memory limit did not finish after running out of memory")
  {
    Ok(Some(result)) => result,
    Ok(None) => return,
    Err(err) => panic!("Unexpected error: {}", err),
  };

  info!("Result: {:?}", result.entries());
  assert_eq!(result.termination_reason(), Some(TerminationReason::Memory));
  assert_eq!(result.exitcode().unwrap().signal(), Some(9));
  assert!(result.walltime() < 30.0);
}

#[test]
fn it_should_kill_on_files_size() {
  common::setup();
  let dir = tempdir().unwrap();
  let result = run_single(
    RunBoxBuilder::fork()
      .command("sh", vec!["-c", "head -c 100000 /dev/zero > \"$TMPDIR/big\"; sleep 20"])
      .files_size_limit(10000)
      .files_monitor_interval(Duration::from_millis(100))
      .walltime_limit(15.0)
      .output(dir.path().join("output.log")),
  )
  .unwrap();

  info!("Result: {:?}", result.entries());
  assert_eq!(result.termination_reason(), Some(TerminationReason::FilesSize));
  assert!(result.walltime() < 10.0);
}

#[test]
fn it_should_fail_on_missing_program() {
  common::setup();
  let dir = tempdir().unwrap();
  let result = run_single(
    RunBoxBuilder::fork()
      .command("/nonexistent/runbox-test-program", Vec::<String>::new())
      .output(dir.path().join("output.log")),
  )
  .unwrap();
  assert_eq!(result.termination_reason(), Some(TerminationReason::Failed));
  assert!(result.exitcode().is_none());
}

#[test]
fn it_should_stop_on_request() {
  common::setup();
  let dir = tempdir().unwrap();
  let mut runbox = RunBoxBuilder::fork()
    .command("sleep", vec!["20"])
    .output(dir.path().join("output.log"))
    .build()
    .unwrap();

  let handle = runbox.executor().stop_handle();
  let stopper = std::thread::spawn(move || {
    sleep(Duration::from_millis(500));
    handle.stop();
  });
  runbox.start().unwrap();
  stopper.join().unwrap();

  let result = &runbox.results()[0];
  assert_eq!(result.termination_reason(), Some(TerminationReason::Killed));
  assert_eq!(result.exitcode().unwrap().signal(), Some(9));
  assert!(result.walltime() < 10.0);
  assert!(runbox.executor().is_stopped());
}

#[test]
fn it_should_reject_invalid_limits() {
  common::setup();
  let dir = tempdir().unwrap();
  let result = run_single(
    RunBoxBuilder::fork()
      .command("true", Vec::<String>::new())
      .soft_cputime_limit(5.0)
      .cputime_limit(2.0)
      .output(dir.path().join("output.log")),
  );
  assert!(matches!(result, Err(RunBoxError::Config(_))));

  let result = run_single(
    RunBoxBuilder::fork()
      .command("true", Vec::<String>::new())
      .result_files(dir.path(), vec!["*"])
      .output(dir.path().join("output.log")),
  );
  assert!(matches!(result, Err(RunBoxError::Config(_))));
}

#[test]
fn it_should_echo_in_container() {
  common::setup();
  let dir = tempdir().unwrap();
  let output = dir.path().join("output.log");

  let result = match run_in_container(
    RunBoxBuilder::container()
      .command("sh", vec!["-c", "echo TEST_TOKEN; id -u; hostname"])
      .output(&output),
  ) {
    Some(result) => result,
    None => return,
  };

  info!("Result: {:?}", result.entries());
  assert!(result.exitcode().unwrap().is_success());
  let lines = output_lines(&output);
  assert_eq!(lines[0], "sh -c 'echo TEST_TOKEN; id -u; hostname'");
  let n = lines.len();
  assert_eq!(lines[n - 3], "TEST_TOKEN");
  assert_eq!(lines[n - 2], "1000");
  assert_eq!(lines[n - 1], "runbox");
}

#[test]
fn it_should_retrieve_result_files() {
  common::setup();
  let dir = tempdir().unwrap();
  let work = tempdir().unwrap();
  let results = dir.path().join("results");
  let output = dir.path().join("output.log");

  let result = match run_in_container(
    RunBoxBuilder::container()
      .dir(work.path(), DirMode::Overlay)
      .command(
        "sh",
        vec!["-c", "mkdir -p out && echo kept > out/a.txt && echo skipped > b.log && echo nested > out/c.txt"],
      )
      .cwd(work.path())
      .result_files(&results, vec!["out/*.txt"])
      .output(&output),
  ) {
    Some(result) => result,
    None => return,
  };

  assert!(result.exitcode().unwrap().is_success());
  assert_eq!(fs::read_to_string(results.join("out/a.txt")).unwrap(), "kept\n");
  assert_eq!(fs::read_to_string(results.join("out/c.txt")).unwrap(), "nested\n");
  assert!(!results.join("b.log").exists());
  // The host directory was only overlaid
  assert!(!work.path().join("out").exists());
}
