use std::fs;
use std::path::Path;

use tempfile::tempdir;

use runbox::utils::output::{format_command_line, open_output_file, reduce_file_size_if_necessary, write_output_header};
use runbox::utils::{
  escape_string_shell, parse_env, parse_int_list, parse_memory_value, parse_timespan_value, path_is_below,
};

mod common;

#[test]
fn parse_values_with_units() {
  common::setup();
  assert_eq!(parse_memory_value("1024").unwrap(), 1024);
  assert_eq!(parse_memory_value("1024B").unwrap(), 1024);
  assert_eq!(parse_memory_value("2kB").unwrap(), 2000);
  assert_eq!(parse_memory_value("3MB").unwrap(), 3_000_000);
  assert_eq!(parse_memory_value("1GB").unwrap(), 1_000_000_000);
  assert_eq!(parse_memory_value("1TB").unwrap(), 1_000_000_000_000);
  assert!(parse_memory_value("12XB").is_err());
  assert!(parse_memory_value("MB").is_err());

  assert_eq!(parse_timespan_value("10").unwrap(), 10.0);
  assert_eq!(parse_timespan_value("1.5s").unwrap(), 1.5);
  assert_eq!(parse_timespan_value("2min").unwrap(), 120.0);
  assert_eq!(parse_timespan_value("1h").unwrap(), 3600.0);
  assert_eq!(parse_timespan_value("1d").unwrap(), 86400.0);
  assert!(parse_timespan_value("5 weeks").is_err());
}

#[test]
fn parse_number_lists() {
  common::setup();
  assert_eq!(parse_int_list("0-3,5").unwrap(), vec![0, 1, 2, 3, 5]);
  assert_eq!(parse_int_list("7").unwrap(), vec![7]);
  assert_eq!(parse_int_list("0-1,\n").unwrap(), vec![0, 1]);
  assert!(parse_int_list("").unwrap().is_empty());
  assert!(parse_int_list("3-1").is_err());
  assert!(parse_int_list("a-b").is_err());
}

#[test]
fn parse_env_pairs() {
  common::setup();
  assert_eq!(
    parse_env("KEY=some=value".to_string()).unwrap(),
    ("KEY".to_string(), "some=value".to_string())
  );
  assert!(parse_env("=value".to_string()).is_err());
  std::env::set_var("RUNBOX_TEST_VARIABLE", "inherited");
  assert_eq!(
    parse_env("RUNBOX_TEST_VARIABLE".to_string()).unwrap(),
    ("RUNBOX_TEST_VARIABLE".to_string(), "inherited".to_string())
  );
}

#[test]
fn escape_for_shell() {
  common::setup();
  assert_eq!(escape_string_shell("echo"), "echo");
  assert_eq!(escape_string_shell("/usr/bin/a-b_c.d"), "/usr/bin/a-b_c.d");
  assert_eq!(escape_string_shell("two words"), "'two words'");
  assert_eq!(escape_string_shell(""), "''");
  assert_eq!(escape_string_shell("it's"), "'it'\"'\"'s'");
  assert_eq!(
    format_command_line(&["echo".to_string(), "a b".to_string()]),
    "echo 'a b'"
  );
}

#[test]
fn path_prefixes_are_component_wise() {
  common::setup();
  assert!(path_is_below(Path::new("/home/user"), Path::new("/home")));
  assert!(path_is_below(Path::new("/home"), Path::new("/home")));
  assert!(path_is_below(Path::new("/anything"), Path::new("/")));
  assert!(!path_is_below(Path::new("/homework"), Path::new("/home")));
}

#[test]
fn output_file_starts_with_command_line() {
  common::setup();
  let dir = tempdir().unwrap();
  let output = dir.path().join("output.log");
  fs::write(&output, "old content").unwrap();

  write_output_header(&output, &["echo".to_string(), "TEST_TOKEN".to_string()]).unwrap();
  {
    use std::io::Write;
    let mut file = open_output_file(&output).unwrap();
    writeln!(file, "TEST_TOKEN").unwrap();
  }

  let content = fs::read_to_string(&output).unwrap();
  let lines = content.lines().collect::<Vec<&str>>();
  assert_eq!(lines[0], "echo TEST_TOKEN");
  assert_eq!(lines[3], "-".repeat(80));
  assert_eq!(lines.last(), Some(&"TEST_TOKEN"));
  assert!(!content.contains("old content"));
}

#[test]
fn shrink_keeps_head_and_tail() {
  common::setup();
  let dir = tempdir().unwrap();
  let output = dir.path().join("output.log");
  let content = (0..2000).map(|i| (b'a' + (i % 26) as u8) as char).collect::<String>();
  fs::write(&output, &content).unwrap();

  assert!(!reduce_file_size_if_necessary(&output, 1600).unwrap());
  assert_eq!(fs::read_to_string(&output).unwrap(), content);

  assert!(reduce_file_size_if_necessary(&output, 1000).unwrap());
  let shrunk = fs::read_to_string(&output).unwrap();
  assert!(shrunk.starts_with(&content[..500]));
  assert!(shrunk.ends_with(&content[1500..]));
  assert!(shrunk.contains("WARNING: YOUR LOGFILE WAS TOO LONG, SOME LINES IN THE MIDDLE WERE REMOVED."));
  assert!(shrunk.len() < content.len());
}

#[test]
fn huge_output_limit_keeps_file() {
  common::setup();
  let dir = tempdir().unwrap();
  let output = dir.path().join("output.log");
  fs::write(&output, "some output\n").unwrap();

  assert!(!reduce_file_size_if_necessary(&output, u64::MAX).unwrap());
  assert!(!reduce_file_size_if_necessary(&output, u64::MAX - 100).unwrap());
  assert_eq!(fs::read_to_string(&output).unwrap(), "some output\n");
}
