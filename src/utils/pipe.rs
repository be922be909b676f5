use std::os::unix::prelude::RawFd;
use std::time::{Duration, Instant};

use nix::{
  errno::Errno,
  fcntl::OFlag,
  poll::{poll, PollFd, PollFlags},
  unistd::{self, close, pipe2},
};

use crate::error::RunBoxError;

/// An anonymous pipe whose ends are split between processes after fork / clone
pub struct RunBoxPipe(RawFd, RawFd);

pub struct RunBoxReadPipe(RawFd);

pub struct RunBoxWritePipe(RawFd);

impl RunBoxPipe {
  pub fn new() -> Result<Self, RunBoxError> {
    let result = pipe2(OFlag::O_CLOEXEC)?;
    Ok(RunBoxPipe(result.0, result.1))
  }

  /// Raw descriptors `(read, write)`, used by code running in a cloned process
  pub fn fds(&self) -> (RawFd, RawFd) {
    (self.0, self.1)
  }

  pub fn read(self) -> Result<RunBoxReadPipe, RunBoxError> {
    let (read, write) = self.fds();
    std::mem::forget(self);
    close(write)?;
    Ok(RunBoxReadPipe(read))
  }

  pub fn write(self) -> Result<RunBoxWritePipe, RunBoxError> {
    let (read, write) = self.fds();
    std::mem::forget(self);
    close(read)?;
    Ok(RunBoxWritePipe(write))
  }
}

impl Drop for RunBoxPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
    let _ = close(self.1);
  }
}

impl RunBoxReadPipe {
  /// Take over a descriptor inherited from the parent process
  pub fn from_raw(fd: RawFd) -> Self {
    RunBoxReadPipe(fd)
  }

  pub fn fd(&self) -> RawFd {
    self.0
  }

  /// Read once, retrying on EINTR. Returns an empty vector on EOF.
  pub fn read_some(&self, max: usize) -> Result<Vec<u8>, RunBoxError> {
    let mut buf = vec![0 as u8; max];
    let size = loop {
      match unistd::read(self.0, buf.as_mut_slice()) {
        Err(Errno::EINTR) => continue,
        other => break other?,
      }
    };
    buf.truncate(size);
    Ok(buf)
  }

  /// Read a single byte, `None` means the other side closed the pipe
  pub fn read_byte(&self) -> Result<Option<u8>, RunBoxError> {
    Ok(self.read_some(1)?.first().copied())
  }

  /// Read once, but give up after `timeout`.
  /// `Ok(None)` is a timeout, `Ok(Some(vec![]))` is EOF.
  pub fn read_timeout(&self, max: usize, timeout: Duration) -> Result<Option<Vec<u8>>, RunBoxError> {
    let deadline = Instant::now() + timeout;
    loop {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        return Ok(None);
      }
      let mut fds = [PollFd::new(self.0, PollFlags::POLLIN)];
      let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
      match poll(&mut fds, millis) {
        Ok(0) => return Ok(None),
        Ok(_) => return self.read_some(max).map(Some),
        Err(Errno::EINTR) => continue,
        Err(err) => return Err(err.into()),
      }
    }
  }

  /// Read until EOF, at most `max` bytes
  pub fn read_to_end(&self, max: usize) -> Result<Vec<u8>, RunBoxError> {
    let mut result = vec![];
    while result.len() < max {
      let chunk = self.read_some(max - result.len())?;
      if chunk.is_empty() {
        break;
      }
      result.extend(chunk);
    }
    Ok(result)
  }

  pub fn close(self) -> Result<(), RunBoxError> {
    Ok(())
  }
}

impl Drop for RunBoxReadPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

impl RunBoxWritePipe {
  /// Take over a descriptor inherited from the parent process
  pub fn from_raw(fd: RawFd) -> Self {
    RunBoxWritePipe(fd)
  }

  pub fn fd(&self) -> RawFd {
    self.0
  }

  pub fn write(&self, bytes: &[u8]) -> Result<usize, RunBoxError> {
    let mut written = 0;
    while written < bytes.len() {
      match unistd::write(self.0, &bytes[written..]) {
        Ok(size) => written += size,
        Err(Errno::EINTR) => continue,
        Err(err) => return Err(err.into()),
      }
    }
    Ok(written)
  }

  pub fn close(self) -> Result<(), RunBoxError> {
    Ok(())
  }
}

impl Drop for RunBoxWritePipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}
