//! The Linux-flavored system call layer: LoongArch syscall numbers,
//! errno encoding, the default handler set and the accelerated native
//! replacements for the hot libc primitives.
//!
//! The handler table is machine-scoped: every [`Machine`] owns its own
//! 512-entry table, so host applications running several guests never
//! share syscall state.

use crate::runtime::bytecode::Bytecode;
use crate::runtime::decoder::DecoderEntry;
use crate::runtime::register::{REG_A0, REG_A1, REG_A2};
use crate::runtime::{Machine, MachineError};

/// Handler signature: the handler reads arguments from A0..A5, writes
/// its result to A0 and may stop the machine or move PC.
pub type SyscallHandler = fn(&mut Machine) -> Result<(), MachineError>;

/// Size of the per-machine syscall table.
pub const SYSCALLS_MAX: usize = 512;

/// LoongArch Linux syscall numbers.
pub mod nr {
  pub const FCNTL: u64 = 25;
  pub const IOCTL: u64 = 29;
  pub const OPENAT: u64 = 56;
  pub const CLOSE: u64 = 57;
  pub const READ: u64 = 63;
  pub const WRITE: u64 = 64;
  pub const WRITEV: u64 = 66;
  pub const PPOLL: u64 = 73;
  pub const READLINKAT: u64 = 78;
  pub const FSTAT: u64 = 80;
  pub const EXIT: u64 = 93;
  pub const EXIT_GROUP: u64 = 94;
  pub const SET_TID_ADDRESS: u64 = 96;
  pub const FUTEX: u64 = 98;
  pub const SET_ROBUST_LIST: u64 = 99;
  pub const CLOCK_GETTIME: u64 = 113;
  pub const TGKILL: u64 = 131;
  pub const RT_SIGACTION: u64 = 134;
  pub const RT_SIGPROCMASK: u64 = 135;
  pub const PRCTL: u64 = 167;
  pub const GETTIMEOFDAY: u64 = 169;
  pub const GETPID: u64 = 172;
  pub const GETUID: u64 = 174;
  pub const GETEUID: u64 = 175;
  pub const GETGID: u64 = 176;
  pub const GETEGID: u64 = 177;
  pub const GETTID: u64 = 178;
  pub const BRK: u64 = 214;
  pub const MUNMAP: u64 = 215;
  pub const MMAP: u64 = 222;
  pub const MPROTECT: u64 = 226;
  pub const MADVISE: u64 = 233;
  pub const PRLIMIT64: u64 = 261;
  pub const GETRANDOM: u64 = 278;

  // Accelerated native replacements for hot libc primitives; installed
  // by decoder-cache patching, outside the kernel number space.
  pub const NATIVE_STRLEN: u64 = 500;
  pub const NATIVE_STRNLEN: u64 = 501;
  pub const NATIVE_STRCMP: u64 = 502;
  pub const NATIVE_STRNCMP: u64 = 503;
  pub const NATIVE_MEMCHR: u64 = 507;
  pub const NATIVE_MEMCPY: u64 = 508;
  pub const NATIVE_MEMSET: u64 = 509;
  pub const NATIVE_MEMCMP: u64 = 510;
  pub const NATIVE_MEMMOVE: u64 = 511;
}

/// Guest errno values, reported as negative results in A0.
pub mod errno {
  pub const ENOENT: i64 = 2;
  pub const EBADF: i64 = 9;
  pub const EAGAIN: i64 = 11;
  pub const EINVAL: i64 = 22;
  pub const ENOTTY: i64 = 25;
  pub const ENOSYS: i64 = 38;
}

impl Machine {
  /// Install the smallest useful handler set: exit and write, enough for
  /// freestanding guests.
  pub fn setup_minimal_syscalls(&mut self) {
    self.install_syscall_handler(nr::EXIT, syscall_exit);
    self.install_syscall_handler(nr::EXIT_GROUP, syscall_exit);
    self.install_syscall_handler(nr::WRITE, syscall_write);
  }

  /// Install the Linux-like handler set a statically linked libc guest
  /// expects.
  pub fn setup_linux_syscalls(&mut self) {
    self.setup_minimal_syscalls();
    self.install_syscall_handler(nr::WRITEV, syscall_writev);
    self.install_syscall_handler(nr::READ, syscall_read);
    self.install_syscall_handler(nr::BRK, syscall_brk);
    self.install_syscall_handler(nr::MMAP, syscall_mmap);
    self.install_syscall_handler(nr::MUNMAP, syscall_munmap);
    self.install_syscall_handler(nr::MPROTECT, syscall_ok);
    self.install_syscall_handler(nr::MADVISE, syscall_ok);
    self.install_syscall_handler(nr::SET_TID_ADDRESS, syscall_gettid);
    self.install_syscall_handler(nr::SET_ROBUST_LIST, syscall_ok);
    self.install_syscall_handler(nr::FUTEX, syscall_ok);
    self.install_syscall_handler(nr::GETPID, syscall_getpid);
    self.install_syscall_handler(nr::GETTID, syscall_gettid);
    self.install_syscall_handler(nr::GETUID, syscall_getid);
    self.install_syscall_handler(nr::GETEUID, syscall_getid);
    self.install_syscall_handler(nr::GETGID, syscall_getid);
    self.install_syscall_handler(nr::GETEGID, syscall_getid);
    self.install_syscall_handler(nr::CLOCK_GETTIME, syscall_clock_gettime);
    self.install_syscall_handler(nr::GETTIMEOFDAY, syscall_gettimeofday);
    self.install_syscall_handler(nr::GETRANDOM, syscall_getrandom);
    self.install_syscall_handler(nr::FSTAT, syscall_fstat);
    self.install_syscall_handler(nr::IOCTL, syscall_enotty);
    self.install_syscall_handler(nr::FCNTL, syscall_ok);
    self.install_syscall_handler(nr::PPOLL, syscall_ok);
    self.install_syscall_handler(nr::READLINKAT, syscall_enoent);
    self.install_syscall_handler(nr::OPENAT, syscall_enoent);
    self.install_syscall_handler(nr::CLOSE, syscall_ok);
    self.install_syscall_handler(nr::PRLIMIT64, syscall_ok);
    self.install_syscall_handler(nr::RT_SIGACTION, syscall_ok);
    self.install_syscall_handler(nr::RT_SIGPROCMASK, syscall_ok);
    self.install_syscall_handler(nr::PRCTL, syscall_ok);
    self.install_syscall_handler(nr::TGKILL, syscall_ok);
  }

  /// Replace well-known libc primitives with native implementations by
  /// patching a syscall record over each function's first instruction.
  /// The patched copy is machine-local; shared segments are untouched.
  pub fn setup_accelerated_syscalls(&mut self) {
    self.install_syscall_handler(nr::NATIVE_MEMCPY, native_memcpy);
    self.install_syscall_handler(nr::NATIVE_MEMMOVE, native_memcpy);
    self.install_syscall_handler(nr::NATIVE_MEMSET, native_memset);
    self.install_syscall_handler(nr::NATIVE_MEMCMP, native_memcmp);
    self.install_syscall_handler(nr::NATIVE_MEMCHR, native_memchr);
    self.install_syscall_handler(nr::NATIVE_STRLEN, native_strlen);
    self.install_syscall_handler(nr::NATIVE_STRNLEN, native_strnlen);
    self.install_syscall_handler(nr::NATIVE_STRCMP, native_strcmp);
    self.install_syscall_handler(nr::NATIVE_STRNCMP, native_strncmp);

    let patches: [(&[&str], u64); 9] = [
      (&["memcpy", "__memcpy"], nr::NATIVE_MEMCPY),
      (&["memmove", "__memmove"], nr::NATIVE_MEMMOVE),
      (&["memset", "__memset"], nr::NATIVE_MEMSET),
      (&["memcmp", "__memcmp"], nr::NATIVE_MEMCMP),
      (&["memchr"], nr::NATIVE_MEMCHR),
      (&["strlen"], nr::NATIVE_STRLEN),
      (&["strnlen"], nr::NATIVE_STRNLEN),
      (&["strcmp"], nr::NATIVE_STRCMP),
      (&["strncmp"], nr::NATIVE_STRNCMP),
    ];
    for (symbols, number) in patches {
      for sym in symbols {
        if let Some(addr) = self.memory.address_of(sym) {
          if let Err(e) = self.patch_syscall_imm(addr, number) {
            tracing::warn!(symbol = sym, error = %e, "failed to patch accelerated syscall");
          }
        }
      }
    }
  }

  /// Overwrite the decoder record at `addr` with a diverging syscall
  /// record carrying `number` in its instruction slot.
  pub fn patch_syscall_imm(&mut self, addr: u64, number: u64) -> Result<(), MachineError> {
    let segment = self.memory.exec_segment_for(addr)?;
    let entry = DecoderEntry {
      bytecode: Bytecode::SyscallImm,
      handler: 0,
      block_bytes: 0,
      instr: number as u32,
    };
    let patched = std::sync::Arc::new(segment.with_patched_entry(addr, entry));
    self.memory.replace_segment(&segment, patched.clone());
    if std::sync::Arc::ptr_eq(self.cpu.current_segment(), &segment) {
      self.cpu.set_segment(patched);
    }
    Ok(())
  }
}

fn set_result(m: &mut Machine, value: i64) {
  m.cpu.regs.set(REG_A0, value as u64);
}

fn syscall_exit(m: &mut Machine) -> Result<(), MachineError> {
  let status = m.cpu.regs.get(REG_A0);
  if m.verbose_syscalls() {
    tracing::debug!(status, "exit");
  }
  m.stop();
  Ok(())
}

fn syscall_write(m: &mut Machine) -> Result<(), MachineError> {
  let fd = m.cpu.regs.get(REG_A0) as i64;
  let addr = m.cpu.regs.get(REG_A1);
  let len = m.cpu.regs.get(REG_A2);

  if fd == 1 || fd == 2 {
    let bytes = m.memory.memarray(addr, len)?.to_vec();
    m.print(&bytes);
    set_result(m, len as i64);
  } else {
    set_result(m, -errno::EBADF);
  }
  if m.verbose_syscalls() {
    tracing::debug!(fd, addr, len, "write");
  }
  Ok(())
}

fn syscall_writev(m: &mut Machine) -> Result<(), MachineError> {
  let fd = m.cpu.regs.get(REG_A0) as i64;
  let iov_addr = m.cpu.regs.get(REG_A1);
  let iovcnt = m.cpu.regs.get(REG_A2);
  if iovcnt > 1024 {
    set_result(m, -errno::EINVAL);
    return Ok(());
  }
  if fd != 1 && fd != 2 {
    set_result(m, -errno::EBADF);
    return Ok(());
  }

  let mut total: u64 = 0;
  for idx in 0..iovcnt {
    let base = m.memory.read::<u64>(iov_addr + idx * 16)?;
    let len = m.memory.read::<u64>(iov_addr + idx * 16 + 8)?;
    if len == 0 {
      continue;
    }
    let bytes = m.memory.memarray(base, len)?.to_vec();
    m.print(&bytes);
    total += len;
  }
  set_result(m, total as i64);
  Ok(())
}

fn syscall_read(m: &mut Machine) -> Result<(), MachineError> {
  // No input is wired up; every descriptor reads as end-of-file.
  set_result(m, 0);
  Ok(())
}

fn syscall_brk(m: &mut Machine) -> Result<(), MachineError> {
  let requested = m.cpu.regs.get(REG_A0);
  let (base, limit) = m.memory.brk_range();
  if requested >= base && requested <= limit {
    m.memory.set_brk_address(requested);
  }
  let brk = m.memory.brk_address();
  set_result(m, brk as i64);
  if m.verbose_syscalls() {
    tracing::debug!(requested, brk, "brk");
  }
  Ok(())
}

fn syscall_mmap(m: &mut Machine) -> Result<(), MachineError> {
  let addr = m.cpu.regs.get(REG_A0);
  let len = m.cpu.regs.get(REG_A1);
  if addr != 0 {
    // Fixed mappings land wherever the guest asked; the arena is flat.
    set_result(m, addr as i64);
    return Ok(());
  }
  let result = m.memory.mmap_allocate(len);
  if result + len > m.memory.arena_size() {
    set_result(m, -errno::EAGAIN);
  } else {
    set_result(m, result as i64);
  }
  if m.verbose_syscalls() {
    tracing::debug!(len, result, "mmap");
  }
  Ok(())
}

fn syscall_munmap(m: &mut Machine) -> Result<(), MachineError> {
  let addr = m.cpu.regs.get(REG_A0);
  let len = m.cpu.regs.get(REG_A1);
  m.memory.mmap_deallocate(addr, len);
  set_result(m, 0);
  Ok(())
}

fn syscall_ok(m: &mut Machine) -> Result<(), MachineError> {
  set_result(m, 0);
  Ok(())
}

fn syscall_enotty(m: &mut Machine) -> Result<(), MachineError> {
  set_result(m, -errno::ENOTTY);
  Ok(())
}

fn syscall_enoent(m: &mut Machine) -> Result<(), MachineError> {
  set_result(m, -errno::ENOENT);
  Ok(())
}

fn syscall_getpid(m: &mut Machine) -> Result<(), MachineError> {
  set_result(m, 1);
  Ok(())
}

fn syscall_gettid(m: &mut Machine) -> Result<(), MachineError> {
  set_result(m, 1);
  Ok(())
}

fn syscall_getid(m: &mut Machine) -> Result<(), MachineError> {
  set_result(m, 1000);
  Ok(())
}

fn host_time() -> (u64, u64) {
  match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
    Ok(d) => (d.as_secs(), d.subsec_nanos() as u64),
    Err(_) => (0, 0),
  }
}

fn syscall_clock_gettime(m: &mut Machine) -> Result<(), MachineError> {
  let ts_addr = m.cpu.regs.get(REG_A1);
  let (secs, nanos) = host_time();
  m.memory.write::<u64>(ts_addr, secs)?;
  m.memory.write::<u64>(ts_addr + 8, nanos)?;
  set_result(m, 0);
  Ok(())
}

fn syscall_gettimeofday(m: &mut Machine) -> Result<(), MachineError> {
  let tv_addr = m.cpu.regs.get(REG_A0);
  let (secs, nanos) = host_time();
  m.memory.write::<u64>(tv_addr, secs)?;
  m.memory.write::<u64>(tv_addr + 8, nanos / 1000)?;
  set_result(m, 0);
  Ok(())
}

fn syscall_getrandom(m: &mut Machine) -> Result<(), MachineError> {
  use rand::RngCore;
  let addr = m.cpu.regs.get(REG_A0);
  let len = m.cpu.regs.get(REG_A1);
  let view = m.memory.writable_memarray(addr, len)?;
  rand::thread_rng().fill_bytes(view);
  set_result(m, len as i64);
  Ok(())
}

fn syscall_fstat(m: &mut Machine) -> Result<(), MachineError> {
  const S_IFCHR: u32 = 0o020000;
  let fd = m.cpu.regs.get(REG_A0) as i64;
  let buf = m.cpu.regs.get(REG_A1);
  if !(0..=2).contains(&fd) {
    set_result(m, -errno::EBADF);
    return Ok(());
  }
  // struct stat is 144 bytes on LoongArch; zero it and mark a chardev.
  m.memory.memset(buf, 0, 144)?;
  m.memory.write::<u32>(buf + 16, S_IFCHR | 0o666)?;
  set_result(m, 0);
  Ok(())
}

// === Accelerated native implementations ===

fn native_memcpy(m: &mut Machine) -> Result<(), MachineError> {
  let dest = m.cpu.regs.get(REG_A0);
  let src = m.cpu.regs.get(REG_A1);
  let n = m.cpu.regs.get(REG_A2);
  let bytes = m.memory.memarray(src, n)?.to_vec();
  m.memory.copy_to_guest(dest, &bytes)?;
  set_result(m, dest as i64);
  Ok(())
}

fn native_memset(m: &mut Machine) -> Result<(), MachineError> {
  let dest = m.cpu.regs.get(REG_A0);
  let value = m.cpu.regs.get(REG_A1) as u8;
  let n = m.cpu.regs.get(REG_A2);
  m.memory.memset(dest, value, n)?;
  set_result(m, dest as i64);
  Ok(())
}

fn native_memcmp(m: &mut Machine) -> Result<(), MachineError> {
  let a = m.cpu.regs.get(REG_A0);
  let b = m.cpu.regs.get(REG_A1);
  let n = m.cpu.regs.get(REG_A2);
  let ordering = m.memory.memcmp(a, b, n)?;
  set_result(m, ordering as i64);
  Ok(())
}

fn native_memchr(m: &mut Machine) -> Result<(), MachineError> {
  let addr = m.cpu.regs.get(REG_A0);
  let value = m.cpu.regs.get(REG_A1) as u8;
  let n = m.cpu.regs.get(REG_A2);
  let view = m.memory.memarray(addr, n)?;
  match view.iter().position(|&b| b == value) {
    Some(offset) => set_result(m, (addr + offset as u64) as i64),
    None => set_result(m, 0),
  }
  Ok(())
}

fn native_strlen(m: &mut Machine) -> Result<(), MachineError> {
  let addr = m.cpu.regs.get(REG_A0);
  let len = m.memory.strlen(addr, m.memory.arena_size())?;
  set_result(m, len as i64);
  Ok(())
}

fn native_strnlen(m: &mut Machine) -> Result<(), MachineError> {
  let addr = m.cpu.regs.get(REG_A0);
  let maxlen = m.cpu.regs.get(REG_A1);
  let len = m.memory.strlen(addr, maxlen)?;
  set_result(m, len.min(maxlen) as i64);
  Ok(())
}

fn native_strcmp(m: &mut Machine) -> Result<(), MachineError> {
  let a = m.memory.memstring(m.cpu.regs.get(REG_A0), u64::MAX)?;
  let b = m.memory.memstring(m.cpu.regs.get(REG_A1), u64::MAX)?;
  set_result(m, cmp_result(a.as_bytes(), b.as_bytes()));
  Ok(())
}

fn native_strncmp(m: &mut Machine) -> Result<(), MachineError> {
  let n = m.cpu.regs.get(REG_A2);
  let a = m.memory.memstring(m.cpu.regs.get(REG_A0), n)?;
  let b = m.memory.memstring(m.cpu.regs.get(REG_A1), n)?;
  set_result(m, cmp_result(a.as_bytes(), b.as_bytes()));
  Ok(())
}

fn cmp_result(a: &[u8], b: &[u8]) -> i64 {
  match a.cmp(b) {
    std::cmp::Ordering::Less => -1,
    std::cmp::Ordering::Equal => 0,
    std::cmp::Ordering::Greater => 1,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runtime::register::{REG_A0, REG_A1, REG_A2, REG_A7};
  use crate::runtime::Machine;
  use crate::utils::{asm, with_memory_max, MachineOptions};

  fn test_machine() -> Machine {
    let code = [asm::nop(), asm::syscall()];
    let opts = MachineOptions::default().with_options(vec![with_memory_max(16 << 20)]);
    Machine::from_code(&code, 0x10000, opts).unwrap()
  }

  #[test]
  fn brk_reports_and_moves_the_break() {
    let mut m = test_machine();
    let (base, limit) = m.memory.brk_range();

    // Query with zero.
    m.cpu.regs.set(REG_A0, 0);
    m.system_call(nr::BRK).unwrap();
    assert_eq!(base, m.return_value::<u64>());

    // Move within bounds.
    m.cpu.regs.set(REG_A0, base + 0x1000);
    m.system_call(nr::BRK).unwrap();
    assert_eq!(base + 0x1000, m.return_value::<u64>());

    // Out-of-range requests leave the break alone.
    m.cpu.regs.set(REG_A0, limit + 0x1000);
    m.system_call(nr::BRK).unwrap();
    assert_eq!(base + 0x1000, m.return_value::<u64>());
  }

  #[test]
  fn mmap_hands_out_pages() {
    let mut m = test_machine();
    m.cpu.regs.set(REG_A0, 0);
    m.cpu.regs.set(REG_A1, 8192);
    m.system_call(nr::MMAP).unwrap();
    let first = m.return_value::<u64>();
    assert_ne!(0, first);
    assert_eq!(0, first % 4096);

    m.cpu.regs.set(REG_A0, 0);
    m.cpu.regs.set(REG_A1, 4096);
    m.system_call(nr::MMAP).unwrap();
    assert_eq!(first + 8192, m.return_value::<u64>());
  }

  #[test]
  fn write_rejects_unknown_descriptors() {
    let mut m = test_machine();
    m.cpu.regs.set(REG_A0, 7);
    m.cpu.regs.set(REG_A1, m.memory.heap_address());
    m.cpu.regs.set(REG_A2, 4);
    m.system_call(nr::WRITE).unwrap();
    assert_eq!(-errno::EBADF, m.return_value::<i64>());
  }

  #[test]
  fn fstat_answers_for_the_standard_streams_only() {
    let mut m = test_machine();
    let buf = m.memory.heap_address();

    m.cpu.regs.set(REG_A0, 1);
    m.cpu.regs.set(REG_A1, buf);
    m.system_call(nr::FSTAT).unwrap();
    assert_eq!(0, m.return_value::<i64>());
    let mode = m.memory.read::<u32>(buf + 16).unwrap();
    assert_ne!(0, mode & 0o020000);

    m.cpu.regs.set(REG_A0, 9);
    m.system_call(nr::FSTAT).unwrap();
    assert_eq!(-errno::EBADF, m.return_value::<i64>());
  }

  #[test]
  fn getrandom_fills_guest_memory() {
    let mut m = test_machine();
    let buf = m.memory.heap_address();
    m.cpu.regs.set(REG_A0, buf);
    m.cpu.regs.set(REG_A1, 64);
    m.system_call(nr::GETRANDOM).unwrap();
    assert_eq!(64, m.return_value::<u64>());
    let bytes = m.memory.memarray(buf, 64).unwrap();
    assert!(bytes.iter().any(|&b| b != 0));
  }

  #[test]
  fn exit_stops_the_machine() {
    let mut m = test_machine();
    m.set_max_instructions(1000);
    m.cpu.regs.set(REG_A0, 5);
    m.cpu.regs.set(REG_A7, nr::EXIT);
    m.system_call(nr::EXIT).unwrap();
    assert_eq!(0, m.max_instructions());
    assert_eq!(5, m.return_value::<i32>());
  }

  #[test]
  fn native_memory_helpers_operate_on_the_arena() {
    let mut m = test_machine();
    let heap = m.memory.heap_address();
    m.memory.copy_to_guest(heap, b"hello world\0").unwrap();

    m.cpu.regs.set(REG_A0, heap);
    m.system_call(nr::NATIVE_STRLEN).unwrap_err();

    // Handlers only exist after the accelerated setup.
    m.setup_accelerated_syscalls();
    m.cpu.regs.set(REG_A0, heap);
    m.system_call(nr::NATIVE_STRLEN).unwrap();
    assert_eq!(11, m.return_value::<u64>());

    m.cpu.regs.set(REG_A0, heap + 0x100);
    m.cpu.regs.set(REG_A1, heap);
    m.cpu.regs.set(REG_A2, 12);
    m.system_call(nr::NATIVE_MEMCPY).unwrap();
    assert_eq!("hello world", m.memory.memstring(heap + 0x100, 64).unwrap());

    m.cpu.regs.set(REG_A0, heap);
    m.cpu.regs.set(REG_A1, heap + 0x100);
    m.cpu.regs.set(REG_A2, 12);
    m.system_call(nr::NATIVE_MEMCMP).unwrap();
    assert_eq!(0, m.return_value::<i64>());
  }
}
