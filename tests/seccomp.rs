use nix::errno::Errno;
use nix::libc;

use runbox::container::{build_deny_filter, install_seccomp_filter, DENIED_SYSCALLS};

mod common;

const BPF_RET_K: u16 = 0x06;
const BPF_JEQ_K: u16 = 0x05 | 0x10;

#[test]
fn filter_jumps_to_allow_and_deny() {
  common::setup();
  let denied = [libc::SYS_keyctl, libc::SYS_add_key, libc::SYS_request_key];
  let program = build_deny_filter(&denied);
  let count = denied.len();
  assert_eq!(program.len(), count + 5);

  let allow = count + 3;
  let deny = count + 4;
  assert_eq!(program[allow].code, BPF_RET_K);
  assert_eq!(program[allow].k, 0x7fff0000);
  assert_eq!(program[deny].code, BPF_RET_K);
  assert_eq!(program[deny].k & 0xffff, libc::ENOSYS as u32);

  // Foreign architectures skip every check
  assert_eq!(program[1].code, BPF_JEQ_K);
  assert_eq!(1 + 1 + program[1].jf as usize, allow);

  for (index, syscall) in denied.iter().enumerate() {
    let position = 3 + index;
    let check = program[position];
    assert_eq!(check.code, BPF_JEQ_K);
    assert_eq!(check.k, *syscall as u32);
    assert_eq!(check.jf, 0);
    assert_eq!(position + 1 + check.jt as usize, deny);
  }
}

#[test]
fn denied_syscalls_fail_with_enosys() {
  common::setup();
  let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
  if !status.contains("Seccomp:") {
    log::info!("Kernel without seccomp, skipping");
    return;
  }
  // The filter only applies to the thread installing it
  let result = std::thread::spawn(|| {
    install_seccomp_filter(DENIED_SYSCALLS);
    let ret = unsafe { libc::syscall(libc::SYS_keyctl, 0, 0, 0, 0, 0) };
    (ret, Errno::last())
  })
  .join()
  .unwrap();
  assert_eq!(result.0, -1);
  assert_eq!(result.1, Errno::ENOSYS);

  let getpid = unsafe { libc::syscall(libc::SYS_getpid) };
  assert!(getpid > 0);
}
