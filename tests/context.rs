use runbox::container::DirMode;
use runbox::{ProcessExitCode, ProcessStatus, ResourceLimits, RunBoxBuilder, RunBoxResult, TerminationReason};

mod common;

#[test]
fn exit_codes_are_decoded() {
  common::setup();
  let returned = ProcessExitCode::from_raw(3 << 8);
  assert_eq!(returned.value(), Some(3));
  assert_eq!(returned.signal(), None);
  assert_eq!(returned.as_exit_code(), 3);
  assert!(!returned.is_success());
  assert_eq!(returned.to_string(), "return value 3");

  let killed = ProcessExitCode::from_raw(9);
  assert_eq!(killed.value(), None);
  assert_eq!(killed.signal(), Some(9));
  assert_eq!(killed.as_exit_code(), 9);
  assert_eq!(killed.to_string(), "signal 9");

  assert!(ProcessExitCode::from_raw(0).is_success());

  let status = ProcessStatus {
    raw: 0,
    utime: 1.25,
    stime: 0.5,
    maxrss: 0,
  };
  assert_eq!(status.cputime(), 1.75);
}

#[test]
fn limits_are_completed() {
  common::setup();
  let limits = ResourceLimits {
    hard_cputime: Some(10.0),
    ..ResourceLimits::default()
  }
  .normalized();
  assert_eq!(limits.soft_cputime, Some(10.0));
  assert_eq!(limits.walltime, Some(40.0));

  let limits = ResourceLimits {
    soft_cputime: Some(5.0),
    walltime: Some(7.0),
    ..ResourceLimits::default()
  }
  .normalized();
  assert_eq!(limits.hard_cputime, Some(5.0));
  assert_eq!(limits.walltime, Some(7.0));

  assert_eq!(ResourceLimits::default().normalized(), ResourceLimits::default());
}

#[test]
fn termination_reasons_have_stable_names() {
  common::setup();
  let names = [
    (TerminationReason::CputimeSoft, "cputime-soft"),
    (TerminationReason::Cputime, "cputime"),
    (TerminationReason::Walltime, "walltime"),
    (TerminationReason::Memory, "memory"),
    (TerminationReason::FilesCount, "files-count"),
    (TerminationReason::FilesSize, "files-size"),
    (TerminationReason::Killed, "killed"),
    (TerminationReason::Failed, "failed"),
  ];
  for (reason, name) in names {
    assert_eq!(reason.to_string(), name);
  }
}

#[test]
fn empty_result_reports_walltime() {
  common::setup();
  let result = RunBoxResult::default();
  let entries = result.entries();
  assert_eq!(entries, vec![("walltime".to_string(), "0s".to_string())]);
  // The tool never ran
  assert_eq!(result.as_exit_code(), 1);
}

#[test]
fn options_inherit_builder_defaults() {
  common::setup();
  let runbox = RunBoxBuilder::fork()
    .set_default_limits(ResourceLimits {
      walltime: Some(3.0),
      ..ResourceLimits::default()
    })
    .parse_env_list(vec!["A=1".to_string()])
    .unwrap()
    .command("echo", vec!["one"])
    .env("B", "2")
    .done()
    .command("echo", vec!["two"])
    .walltime_limit(5.0)
    .build()
    .unwrap();

  let options = runbox.commands().collect::<Vec<_>>();
  assert_eq!(options.len(), 2);
  assert_eq!(options[0].args(), &["echo".to_string(), "one".to_string()]);
  assert_eq!(options[0].limits().walltime, Some(3.0));
  assert_eq!(
    options[0].env(),
    &[("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]
  );
  assert_eq!(options[1].limits().walltime, Some(5.0));
  assert!(runbox.single().is_none());
  assert_eq!(runbox.executor().starter_name(), "fork");
}

#[test]
fn fork_mode_rejects_container_options() {
  common::setup();
  assert!(RunBoxBuilder::fork()
    .dir("/opt", DirMode::Hidden)
    .command("true", Vec::<String>::new())
    .build()
    .is_err());
  assert!(RunBoxBuilder::fork()
    .set_uid(Some(0))
    .command("true", Vec::<String>::new())
    .build()
    .is_err());
}
