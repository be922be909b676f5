use std::ffi::c_void;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::prelude::RawFd;
use std::path::Path;

use lazy_static::lazy_static;
use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc;
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use nix::unistd::{close, sethostname, Pid};

pub use mount::{build_mount_view, mount_proc, pivot_into, MountLayout, MountOptions};
pub use policy::{DirEntry, DirMode, DirectoryPolicy};
pub use seccomp::{build_deny_filter, install_seccomp_filter, SockFilter, DENIED_SYSCALLS};

use crate::context::ProcessStatus;
use crate::utils::{wait_any, write_file, GidType, UidType};
use crate::RunBoxError;

mod mount;
mod policy;
mod seccomp;

pub const CONTAINER_UID: UidType = 1000;

pub const CONTAINER_GID: GidType = 1000;

pub const CONTAINER_HOME: &str = "/home/runbox";

pub const CONTAINER_HOSTNAME: &str = "runbox";

/// Where the scratch directory of the tool is visible inside the container
pub const RESULT_FILES_DIR: &str = "/.runbox-results";

const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

const SIOCGIFFLAGS: libc::c_ulong = 0x8913;

const SIOCSIFFLAGS: libc::c_ulong = 0x8914;

const IFF_UP: libc::c_short = 0x1;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;

const CONTAINER_ETC_NSSWITCH_CONF: &str = "
passwd: files
group: files
shadow: files
hosts: files
networks: files

protocols:      db files
services:       db files
ethers:         db files
rpc:            db files

netgroup:       files
automount:      files
";

lazy_static! {
  /// Files that replace the host identity in `/etc` of the container
  pub static ref CONTAINER_ETC_FILES: Vec<(&'static str, String)> = vec![
    ("nsswitch.conf", CONTAINER_ETC_NSSWITCH_CONF.to_string()),
    (
      "passwd",
      format!(
        "root:x:0:0:root:/root:/bin/bash\nrunbox:x:{uid}:{gid}:runbox:{home}:/bin/bash\nnobody:x:65534:65534:nobody:/:/bin/false\n",
        uid = CONTAINER_UID,
        gid = CONTAINER_GID,
        home = CONTAINER_HOME
      )
    ),
    (
      "group",
      format!("root:x:0:\nrunbox:x:{gid}:\nnogroup:x:65534:\n", gid = CONTAINER_GID)
    ),
    ("hostname", format!("{}\n", CONTAINER_HOSTNAME)),
    (
      "hosts",
      format!(
        "127.0.0.1       localhost {host}\n# The following lines are desirable for IPv6 capable hosts\n::1     localhost ip6-localhost ip6-loopback\nff02::1 ip6-allnodes\nff02::2 ip6-allrouters\n",
        host = CONTAINER_HOSTNAME
      )
    ),
  ];
}

/// Whether an absolute path inside the container is one of the synthetic `/etc` files
pub fn is_container_system_config_file(path: &Path) -> bool {
  match path.strip_prefix("/etc") {
    Ok(rest) => {
      let rest = rest.to_string_lossy();
      rest == "mtab" || CONTAINER_ETC_FILES.iter().any(|(name, _)| *name == rest)
    }
    Err(_) => false,
  }
}

/// Write the synthetic `/etc` files below `etc` (usually the upper layer of the overlay)
pub fn write_container_system_config(etc: &Path) -> Result<(), RunBoxError> {
  fs::create_dir_all(etc)?;
  for (name, content) in CONTAINER_ETC_FILES.iter() {
    write_file(etc.join(name), content)?;
  }
  let mtab = etc.join("mtab");
  match fs::remove_file(&mtab) {
    Err(err) if err.kind() != ErrorKind::NotFound => return Err(err.into()),
    _ => {}
  }
  std::os::unix::fs::symlink("/proc/self/mounts", &mtab)?;
  Ok(())
}

/// Anonymous memory for the stack of a cloned process, with a guard page at its low end
struct GuardedStack {
  base: *mut c_void,
  guard: usize,
  size: usize,
}

impl GuardedStack {
  fn allocate(size: usize) -> Result<Self, RunBoxError> {
    let guard = match nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE) {
      Ok(Some(page)) => page as usize,
      _ => 4096,
    };
    let base = unsafe {
      libc::mmap(
        std::ptr::null_mut(),
        size + guard,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_GROWSDOWN | libc::MAP_STACK,
        -1,
        0,
      )
    };
    if base == libc::MAP_FAILED {
      return Err(RunBoxError::Nix(Errno::last()));
    }
    let stack = GuardedStack { base, guard, size };
    // Overflowing the stack crashes instead of corrupting memory
    if unsafe { libc::mprotect(base, guard, libc::PROT_NONE) } != 0 {
      return Err(RunBoxError::Nix(Errno::last()));
    }
    Ok(stack)
  }

  fn as_mut_slice(&mut self) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut((self.base as *mut u8).add(self.guard), self.size) }
  }
}

impl Drop for GuardedStack {
  fn drop(&mut self) {
    unsafe {
      libc::munmap(self.base, self.size + self.guard);
    }
  }
}

/// Start `entry` as pid 1 of new mount, UTS, IPC, user and PID namespaces
/// (and a new network namespace if `use_network_ns`).
/// The return value of `entry` becomes the exit code of the new process.
pub fn clone_into_namespaces(entry: Box<dyn FnMut() -> isize + '_>, use_network_ns: bool) -> Result<Pid, RunBoxError> {
  let mut flags = CloneFlags::CLONE_NEWNS
    | CloneFlags::CLONE_NEWUTS
    | CloneFlags::CLONE_NEWIPC
    | CloneFlags::CLONE_NEWUSER
    | CloneFlags::CLONE_NEWPID;
  if use_network_ns {
    flags |= CloneFlags::CLONE_NEWNET;
  }

  let mut stack = GuardedStack::allocate(DEFAULT_STACK_SIZE)?;
  let mut entry = entry;
  // The child gets a copy of our memory, so the stack may be unmapped here right after
  #[allow(unused_unsafe)]
  let result = unsafe {
    nix::sched::clone(
      Box::new(move || {
        let code = entry();
        // Never return into code that belongs to the parent
        unsafe { libc::_exit(code as i32) }
      }),
      stack.as_mut_slice(),
      flags,
      Some(Signal::SIGCHLD as i32),
    )
  };
  match result {
    Ok(pid) => Ok(pid),
    Err(errno) => Err(RunBoxError::container(user_namespace_hint(errno))),
  }
}

/// Explain why creating namespaces failed
fn user_namespace_hint(errno: Errno) -> String {
  let read_sysctl = |path: &str| {
    fs::read_to_string(path)
      .map(|s| s.trim().to_string())
      .unwrap_or_default()
  };
  let hint = if read_sysctl("/proc/sys/kernel/apparmor_restrict_unprivileged_userns") == "1" {
    "Unprivileged user namespaces are forbidden by AppArmor on this system (kernel.apparmor_restrict_unprivileged_userns=1). Please allow them for this program with an AppArmor profile, or disable the restriction."
  } else if read_sysctl("/proc/sys/kernel/unprivileged_userns_clone") == "0" {
    "Unprivileged user namespaces are disabled on this system. Please set the sysctl option kernel.unprivileged_userns_clone=1."
  } else if read_sysctl("/proc/sys/user/max_user_namespaces") == "0" {
    "User namespaces are disabled on this system. Please set the sysctl option user.max_user_namespaces to a positive value."
  } else {
    "Please make sure that your kernel supports user namespaces and that they are allowed for regular users."
  };
  format!(
    "Creating namespace for container mode failed: {}. {} Alternatively, run without the container using --no-container.",
    errno.desc(),
    hint
  )
}

/// Map exactly one identity into the user namespace of `pid`
pub fn map_user(pid: Pid, uid: UidType, gid: GidType, parent_uid: UidType, parent_gid: GidType) {
  let proc_child = Path::new("/proc").join(pid.to_string());

  if let Err(err) = write_file(proc_child.join("uid_map"), format!("{} {} 1", uid, parent_uid)) {
    warn!("Creating UID mapping into container failed: {}", err);
  }
  match write_file(proc_child.join("setgroups"), "deny") {
    Err(err) if err.kind() != ErrorKind::NotFound => {
      warn!("Could not write to setgroups file in /proc: {}", err);
    }
    _ => {}
  }
  if let Err(err) = write_file(proc_child.join("gid_map"), format!("{} {} 1", gid, parent_gid)) {
    warn!("Creating GID mapping into container failed: {}", err);
  }
}

#[repr(C)]
struct IfReqFlags {
  name: [u8; libc::IFNAMSIZ],
  flags: libc::c_short,
  pad: [u8; 22],
}

/// Bring up a network interface, like `lo` in a fresh network namespace
pub fn activate_network_interface(iface: &str) -> Result<(), RunBoxError> {
  let bytes = iface.as_bytes();
  if bytes.len() >= libc::IFNAMSIZ {
    return Err(RunBoxError::container(format!("Invalid interface name {}", iface)));
  }
  let mut request = IfReqFlags {
    name: [0; libc::IFNAMSIZ],
    flags: 0,
    pad: [0; 22],
  };
  request.name[..bytes.len()].copy_from_slice(bytes);

  let sock = socket(AddressFamily::Inet, SockType::Datagram, SockFlag::SOCK_CLOEXEC, None)?;
  let result = (|| {
    if unsafe { libc::ioctl(sock, SIOCGIFFLAGS as _, &mut request as *mut IfReqFlags) } < 0 {
      return Err(RunBoxError::Nix(Errno::last()));
    }
    request.flags |= IFF_UP;
    if unsafe { libc::ioctl(sock, SIOCSIFFLAGS as _, &mut request as *mut IfReqFlags) } < 0 {
      return Err(RunBoxError::Nix(Errno::last()));
    }
    Ok(())
  })();
  let _ = close(sock);
  result
}

pub fn set_hostname(name: &str) -> Result<(), RunBoxError> {
  sethostname(name)?;
  Ok(())
}

/// Our pid as seen by the namespace in which `/proc` was mounted
pub fn get_my_pid_from_procfs() -> Result<Pid, RunBoxError> {
  let link = fs::read_link("/proc/self")?;
  link
    .to_string_lossy()
    .parse::<i32>()
    .map(Pid::from_raw)
    .map_err(|_| RunBoxError::container(format!("Unexpected content of /proc/self: {}", link.display())))
}

#[repr(C)]
struct CapUserHeader {
  version: u32,
  pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
  effective: u32,
  permitted: u32,
  inheritable: u32,
}

/// Drop all capabilities of the calling thread except `keep`
pub fn drop_capabilities(keep: &[u32]) -> Result<(), RunBoxError> {
  let header = CapUserHeader {
    version: LINUX_CAPABILITY_VERSION_3,
    pid: 0,
  };
  let mut data = [CapUserData::default(); 2];
  for cap in keep {
    let slot = (*cap / 32) as usize;
    data[slot].effective |= 1 << (cap % 32);
    data[slot].permitted |= 1 << (cap % 32);
  }
  let result = unsafe { libc::syscall(libc::SYS_capset, &header as *const CapUserHeader, data.as_ptr()) };
  if result != 0 {
    return Err(RunBoxError::Nix(Errno::last()));
  }
  Ok(())
}

pub fn block_all_signals() -> Result<(), RunBoxError> {
  sigprocmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), None)?;
  Ok(())
}

pub fn reset_signal_mask() -> Result<(), RunBoxError> {
  sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
  Ok(())
}

fn is_forwardable(signal: Signal) -> bool {
  let number = signal as i32;
  number < 32 && !matches!(signal, Signal::SIGKILL | Signal::SIGSTOP | Signal::SIGCHLD)
}

/// Act as init for `child`: reap every terminated process and forward all other signals to `child`.
/// Returns once `child` itself terminated.
pub fn forward_signals_as_init(child: Pid) -> Result<ProcessStatus, RunBoxError> {
  block_all_signals()?;
  let all = SigSet::all();
  loop {
    let signal = all.wait()?;
    if signal == Signal::SIGCHLD {
      while let Some((pid, status)) = wait_any(None, true)? {
        if pid == child {
          return Ok(status);
        }
        debug!("Received unexpected SIGCHLD for process #{}.", pid);
      }
    } else if is_forwardable(signal) {
      debug!("Forwarding signal {} to process #{}.", signal, child);
      if let Err(err) = kill(child, signal) {
        debug!("Could not forward signal {} to process #{}.: {}", signal, child, err);
      }
    }
  }
}

/// Close every descriptor that would be inherited by an exec'd program, except `keep`.
/// Descriptors with close-on-exec (like the log file) stay open for us.
pub fn close_open_fds(keep: &[RawFd]) -> Result<(), RunBoxError> {
  let fds = fs::read_dir("/proc/self/fd")?
    .filter_map(|entry| entry.ok())
    .filter_map(|entry| entry.file_name().to_string_lossy().parse::<RawFd>().ok())
    .collect::<Vec<RawFd>>();
  for fd in fds {
    if keep.contains(&fd) {
      continue;
    }
    match fcntl(fd, FcntlArg::F_GETFD) {
      Ok(flags) if FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC) => {}
      // The descriptor of the directory listing is already gone
      Err(_) => {}
      Ok(_) => {
        debug!("Closing inherited file descriptor {}", fd);
        let _ = close(fd);
      }
    }
  }
  Ok(())
}
