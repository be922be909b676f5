use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};

use crate::utils::escape_string_shell;
use crate::RunBoxError;

const OUTPUT_SEPARATOR_WIDTH: usize = 80;

/// Files are only shrunk when they exceed the limit by more than this
const SHRINK_SLACK: u64 = 500;

const SHRINK_WARNING: &str =
  "\n\n\nWARNING: YOUR LOGFILE WAS TOO LONG, SOME LINES IN THE MIDDLE WERE REMOVED.\n\n\n\n";

/// The command line as it is written on top of the output file
pub fn format_command_line(args: &[String]) -> String {
  args
    .iter()
    .map(|arg| escape_string_shell(arg))
    .collect::<Vec<String>>()
    .join(" ")
}

/// Create (or truncate) the output file and write the command line header into it
pub fn write_output_header<P: AsRef<Path>>(path: P, args: &[String]) -> Result<(), RunBoxError> {
  let path = path.as_ref();
  let mut file = File::create(path)
    .map_err(|err| RunBoxError::fs(format!("Cannot create output file {}: {}", path.display(), err)))?;
  write!(
    file,
    "{}\n\n\n{}\n\n\n",
    format_command_line(args),
    "-".repeat(OUTPUT_SEPARATOR_WIDTH)
  )?;
  Ok(())
}

/// Open the output file for the tool, its output is appended below the header
pub fn open_output_file<P: AsRef<Path>>(path: P) -> Result<File, RunBoxError> {
  let path = path.as_ref();
  OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .map_err(|err| RunBoxError::fs(format!("Cannot open output file {}: {}", path.display(), err)))
}

/// Shrink a file to roughly `max_size` bytes by cutting out its middle part.
/// The beginning and the end of the file stay unchanged.
/// Returns whether the file was changed.
pub fn reduce_file_size_if_necessary<P: AsRef<Path>>(path: P, max_size: u64) -> Result<bool, RunBoxError> {
  let path = path.as_ref();
  let file_size = path.metadata()?.len();
  if file_size < max_size.saturating_add(SHRINK_SLACK) {
    return Ok(false);
  }

  info!(
    "Output file {} has {} bytes, shrinking it to about {} bytes",
    path.display(),
    file_size,
    max_size
  );

  let mut file = OpenOptions::new().read(true).write(true).open(path)?;
  let rest = max_size / 2;

  file.seek(SeekFrom::Start(file_size - rest))?;
  let mut last_part = Vec::with_capacity(rest as usize);
  file.read_to_end(&mut last_part)?;

  file.seek(SeekFrom::Start(max_size / 2))?;
  file.write_all(SHRINK_WARNING.as_bytes())?;
  file.write_all(&last_part)?;
  let end = file.stream_position()?;
  file.set_len(end)?;

  debug!("Output file {} now has {} bytes", path.display(), end);
  Ok(true)
}
