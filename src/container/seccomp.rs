use log::{debug, warn};
use nix::errno::Errno;
use nix::libc;

use crate::RunBoxError;

const SECCOMP_MODE_FILTER: libc::c_ulong = 2;
const SECCOMP_RET_ALLOW: u32 = 0x7fff0000;
// errno ENOSYS, the caller just sees an unsupported syscall
const SECCOMP_RET_ERRNO_ENOSYS: u32 = 0x00050000 | 38;

const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

// seccomp_data offsets
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc00000b7;

/// Keyring syscalls are not namespaced, userfaultfd can block the kernel for a long time
pub const DENIED_SYSCALLS: &[libc::c_long] = &[
  libc::SYS_add_key,
  libc::SYS_request_key,
  libc::SYS_keyctl,
  libc::SYS_userfaultfd,
];

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
  pub code: u16,
  pub jt: u8,
  pub jf: u8,
  pub k: u32,
}

impl SockFilter {
  const fn stmt(code: u16, k: u32) -> Self {
    SockFilter { code, jt: 0, jf: 0, k }
  }

  const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
    SockFilter { code, jt, jf, k }
  }
}

#[repr(C)]
struct SockFprog {
  len: u16,
  filter: *const SockFilter,
}

/// BPF program returning ENOSYS for every syscall in `denied` and allowing all others.
/// Syscalls of a foreign architecture are allowed, their numbers mean something else.
pub fn build_deny_filter(denied: &[libc::c_long]) -> Vec<SockFilter> {
  let count = denied.len();
  let mut program = Vec::with_capacity(count + 5);
  program.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
  // Foreign architecture: jump over the checks to the allow instruction
  program.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_NATIVE, 0, (count + 1) as u8));
  program.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SYSCALL_NR));
  for (index, syscall) in denied.iter().enumerate() {
    // On match jump to the deny instruction, which follows the allow instruction
    let to_deny = (count - index) as u8;
    program.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, *syscall as u32, to_deny, 0));
  }
  program.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
  program.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO_ENOSYS));
  program
}

/// Install a filter that makes the given syscalls fail with ENOSYS.
/// Failing to do so is only a warning, not every kernel has seccomp.
pub fn install_seccomp_filter(denied: &[libc::c_long]) {
  match try_install(denied) {
    Ok(_) => debug!("Installed seccomp filter for {} syscalls", denied.len()),
    Err(err) => warn!("Could not enable seccomp filter, continuing without it: {}", err),
  }
}

fn try_install(denied: &[libc::c_long]) -> Result<(), RunBoxError> {
  let program = build_deny_filter(denied);
  let fprog = SockFprog {
    len: program.len() as u16,
    filter: program.as_ptr(),
  };
  if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
    return Err(RunBoxError::Nix(Errno::last()));
  }
  let result = unsafe {
    libc::prctl(
      libc::PR_SET_SECCOMP,
      SECCOMP_MODE_FILTER,
      &fprog as *const SockFprog,
      0,
      0,
    )
  };
  if result != 0 {
    return Err(RunBoxError::Nix(Errno::last()));
  }
  Ok(())
}
