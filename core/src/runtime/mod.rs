pub mod bytecode;
pub mod cpu;
pub mod decoder;
pub mod dispatch;
pub mod handlers;
pub mod instruction;
pub mod memory;
pub mod opcode;
pub mod register;
pub mod segment;
pub mod syscall;
pub mod vmcall;

pub use cpu::Cpu;
pub use instruction::Instruction;
pub use memory::{Memory, Symbol};
pub use register::*;
pub use syscall::SyscallHandler;
pub use vmcall::CallArg;

use std::sync::OnceLock;
use std::time::Instant;

use thiserror::Error;

use crate::elf::LoadedElf;
use crate::runtime::bytecode::Bytecode;
use crate::utils::MachineOptions;

/// Faults the emulator core can raise. Every variant carries the
/// auxiliary address (usually the faulting PC or the offending memory
/// address) the host needs to report something useful.
#[derive(Error, Debug, PartialEq)]
pub enum MachineError {
  #[error("illegal opcode 0x{1:08x} near pc 0x{0:x}")]
  IllegalOpcode(u64, u32),
  #[error("unimplemented instruction 0x{1:08x} near pc 0x{0:x}")]
  UnimplementedInstruction(u64, u32),
  #[error("{1} at address 0x{0:x}")]
  ProtectionFault(u64, &'static str),
  #[error("no execute segment contains pc 0x{0:x}")]
  ExecSpaceProtectionFault(u64),
  #[error("misaligned instruction address 0x{0:x}")]
  MisalignedInstruction(u64),
  #[error("instruction limit reached after {0} instructions")]
  Timeout(u64),
  #[error("guest aborted with status {0}")]
  GuestAbort(u64),
  #[error("unimplemented system call {0}")]
  UnimplementedSyscall(u64),
  #[error("out of memory: {0}")]
  OutOfMemory(&'static str),
  #[error("invalid program: {0}")]
  InvalidProgram(String),
  #[error("symbol not found: {0}")]
  SymbolNotFound(String),
}

/// Callback supplying the value of the guest-visible `rdtime.d` counter.
pub type RdtimeHandler = fn(&Machine) -> u64;

/// A value readable out of the guest's return registers.
pub trait GuestValue {
  fn from_machine(machine: &Machine) -> Self;
}

macro_rules! int_guest_value {
  ($($t:ty),*) => {
    $(impl GuestValue for $t {
      fn from_machine(machine: &Machine) -> Self {
        machine.cpu.regs.get(register::REG_A0) as $t
      }
    })*
  };
}

int_guest_value!(u64, i64, u32, i32, u16, i16, u8, i8);

impl GuestValue for f32 {
  fn from_machine(machine: &Machine) -> Self {
    machine.cpu.regs.vreg(0).f32()
  }
}

impl GuestValue for f64 {
  fn from_machine(machine: &Machine) -> Self {
    machine.cpu.regs.vreg(0).f64()
  }
}

/// Per-bytecode record counts over the machine's decoded segments.
#[derive(Debug, Clone, Copy)]
pub struct BytecodeStats {
  pub bytecode: Bytecode,
  pub count: u64,
}

/// One emulated LA64 guest: CPU state, the flat memory arena, the
/// instruction budget and the machine-scoped syscall table.
///
/// A machine is single-threaded and not re-entrant; the dispatch loop
/// borrows it exclusively for the duration of `simulate` or `vmcall`.
/// Many machines may run in parallel host threads, sharing decoded
/// execute segments through the process-wide cache.
pub struct Machine {
  pub cpu: Cpu,
  pub memory: Memory,
  counter: u64,
  max_instructions: u64,
  syscall_handlers: Vec<Option<SyscallHandler>>,
  rdtime_handler: Option<RdtimeHandler>,
  options: MachineOptions,
}

impl Machine {
  /// Load a statically linked LA64 ELF image and prepare it for
  /// execution. The default Linux syscall layer is installed; hosts can
  /// override any entry afterwards.
  pub fn new(binary: &[u8], options: MachineOptions) -> Result<Self, MachineError> {
    let elf = LoadedElf::parse(binary)?;
    let memory = Memory::new(&elf, &options)?;
    let mut machine = Self::assemble(memory, options);

    if let Some(addr) = machine.memory.address_of("fast_exit") {
      machine.memory.set_exit_address(addr);
    }
    let start = machine.memory.start_address();
    if let Ok(segment) = machine.memory.exec_segment_for(start) {
      machine.cpu.set_segment(segment);
    }
    Ok(machine)
  }

  /// Build a machine around raw instruction words placed at `base`, with
  /// no ELF involved. Region boundaries put the code read-only and
  /// everything from the next page up read-write.
  pub fn from_code(code: &[u32], base: u64, options: MachineOptions) -> Result<Self, MachineError> {
    let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_le_bytes()).collect();
    let data_start = (base + bytes.len() as u64 + 4095) & !4095;
    let mut memory = Memory::uninitialized(options.memory_max() as u64, base, data_start)?;
    memory.install_image(base, &bytes)?;
    memory.set_start_address(base);
    memory.create_execute_segment(&bytes, base, true)?;

    let mut machine = Self::assemble(memory, options);
    let segment = machine.memory.exec_segment_for(base)?;
    machine.cpu.set_segment(segment);
    Ok(machine)
  }

  fn assemble(memory: Memory, options: MachineOptions) -> Self {
    let mut machine = Self {
      cpu: Cpu::new(),
      memory,
      counter: 0,
      max_instructions: 0,
      syscall_handlers: vec![None; syscall::SYSCALLS_MAX],
      rdtime_handler: None,
      options,
    };
    machine
      .cpu
      .reset(machine.memory.start_address(), machine.memory.stack_address());
    machine.setup_linux_syscalls();
    machine
  }

  pub fn options(&self) -> &MachineOptions {
    &self.options
  }

  pub(crate) fn verbose_syscalls(&self) -> bool {
    self.options.verbose_syscalls()
  }

  // === Execution ===

  /// Run the dispatch loop for at most `max_instructions` retired
  /// instructions. Returns true iff the machine stopped explicitly (a
  /// handler zeroed the budget), false on budget exhaustion.
  pub fn simulate(&mut self, max_instructions: u64) -> Result<bool, MachineError> {
    dispatch::simulate(self, self.cpu.pc(), 0, max_instructions)
  }

  /// Stop the dispatch loop at the next block boundary.
  pub fn stop(&mut self) {
    self.max_instructions = 0;
  }

  pub fn stopped(&self) -> bool {
    self.counter >= self.max_instructions
  }

  /// True when the loop exhausted a non-zero budget (as opposed to an
  /// explicit stop).
  pub fn instruction_limit_reached(&self) -> bool {
    self.max_instructions != 0 && self.counter >= self.max_instructions
  }

  pub fn instruction_counter(&self) -> u64 {
    self.counter
  }

  pub fn set_instruction_counter(&mut self, value: u64) {
    self.counter = value;
  }

  pub fn increment_counter(&mut self, value: u64) {
    self.counter += value;
  }

  pub fn max_instructions(&self) -> u64 {
    self.max_instructions
  }

  pub fn set_max_instructions(&mut self, value: u64) {
    self.max_instructions = value;
  }

  // === System calls ===

  pub fn install_syscall_handler(&mut self, number: u64, handler: SyscallHandler) {
    if let Some(slot) = self.syscall_handlers.get_mut(number as usize) {
      *slot = Some(handler);
    }
  }

  pub fn system_call(&mut self, number: u64) -> Result<(), MachineError> {
    match self.syscall_handlers.get(number as usize).copied().flatten() {
      Some(handler) => handler(self),
      None => Err(MachineError::UnimplementedSyscall(number)),
    }
  }

  /// Write a syscall or call result into A0.
  pub fn set_result(&mut self, value: u64) {
    self.cpu.regs.set(register::REG_A0, value);
  }

  /// Read the guest's A0 (or FA0 for float types).
  pub fn return_value<T: GuestValue>(&self) -> T {
    T::from_machine(self)
  }

  pub fn set_rdtime(&mut self, handler: RdtimeHandler) {
    self.rdtime_handler = Some(handler);
  }

  /// The guest-visible stable counter, host-clock-backed by default.
  pub fn rdtime(&self) -> u64 {
    if let Some(handler) = self.rdtime_handler {
      return handler(self);
    }
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
  }

  /// Guest console output; stdout by line discipline of the host.
  pub fn print(&self, bytes: &[u8]) {
    use std::io::Write;
    let _ = std::io::stdout().write_all(bytes);
  }

  // === Linux userspace setup ===

  /// Build the initial guest stack: environment and argument strings,
  /// 16 random bytes, the auxiliary vector, envp, argv and argc, leaving
  /// SP at the argc cell.
  pub fn setup_linux(&mut self, args: &[&str], env: &[&str]) -> Result<(), MachineError> {
    const AT_NULL: u64 = 0;
    const AT_PHDR: u64 = 3;
    const AT_PHENT: u64 = 4;
    const AT_PHNUM: u64 = 5;
    const AT_PAGESZ: u64 = 6;
    const AT_BASE: u64 = 7;
    const AT_ENTRY: u64 = 9;
    const AT_UID: u64 = 11;
    const AT_EUID: u64 = 12;
    const AT_GID: u64 = 13;
    const AT_EGID: u64 = 14;
    const AT_HWCAP: u64 = 16;
    const AT_CLKTCK: u64 = 17;
    const AT_RANDOM: u64 = 25;

    if args.is_empty() {
      return Err(MachineError::InvalidProgram(
        "setup_linux requires at least the program name".into(),
      ));
    }

    let mut sp = self.cpu.regs.get(register::REG_SP) & !15;

    let mut env_ptrs = Vec::with_capacity(env.len());
    for e in env {
      sp -= e.len() as u64 + 1;
      self.memory.copy_to_guest(sp, e.as_bytes())?;
      self.memory.write::<u8>(sp + e.len() as u64, 0)?;
      env_ptrs.push(sp);
    }

    let mut arg_ptrs = Vec::with_capacity(args.len());
    for arg in args {
      sp -= arg.len() as u64 + 1;
      self.memory.copy_to_guest(sp, arg.as_bytes())?;
      self.memory.write::<u8>(sp + arg.len() as u64, 0)?;
      arg_ptrs.push(sp);
    }

    // AT_RANDOM payload, then realign after the variable-length strings.
    sp -= 16;
    let random_addr = sp;
    let random_bytes: [u8; 16] = rand::random();
    self.memory.copy_to_guest(random_addr, &random_bytes)?;
    sp &= !15;

    let at_base = self.memory.start_address() & !0xff_ffff;
    let auxv: &[(u64, u64)] = &[
      (AT_PHDR, self.memory.elf_phdr_addr()),
      (AT_PHENT, self.memory.elf_phentsize() as u64),
      (AT_PHNUM, self.memory.elf_phnum() as u64),
      (AT_PAGESZ, 4096),
      (AT_BASE, at_base),
      (AT_ENTRY, self.memory.start_address()),
      (AT_UID, 1000),
      (AT_EUID, 1000),
      (AT_GID, 1000),
      (AT_EGID, 1000),
      (AT_HWCAP, 0),
      (AT_CLKTCK, 100),
      (AT_RANDOM, random_addr),
      (AT_NULL, 0),
    ];
    sp -= auxv.len() as u64 * 16;
    let mut at = sp;
    for (tag, value) in auxv {
      self.memory.write::<u64>(at, *tag)?;
      self.memory.write::<u64>(at + 8, *value)?;
      at += 16;
    }

    // envp, null-terminated.
    sp -= 8;
    self.memory.write::<u64>(sp, 0)?;
    for ptr in env_ptrs.iter().rev() {
      sp -= 8;
      self.memory.write::<u64>(sp, *ptr)?;
    }

    // argv, null-terminated.
    sp -= 8;
    self.memory.write::<u64>(sp, 0)?;
    for ptr in arg_ptrs.iter().rev() {
      sp -= 8;
      self.memory.write::<u64>(sp, *ptr)?;
    }

    sp -= 8;
    self.memory.write::<u64>(sp, args.len() as u64)?;

    self.cpu.regs.set(register::REG_SP, sp);
    Ok(())
  }

  // === Symbols and diagnostics ===

  pub fn address_of(&self, name: &str) -> Option<u64> {
    self.memory.address_of(name)
  }

  pub fn lookup_symbol(&self, addr: u64) -> Option<&Symbol> {
    self.memory.lookup_symbol(addr)
  }

  /// Best-effort call trace: the current PC, then stack words that
  /// resolve to known symbols. A debugging aid, not a contract.
  pub fn backtrace(&self) -> String {
    use std::fmt::Write;

    let pc = self.cpu.regs.pc;
    let mut addrs = vec![pc];
    let mut sp = self.cpu.regs.get(register::REG_SP);
    let top = self.memory.stack_address();
    while sp < top && addrs.len() < 16 {
      if let Ok(word) = self.memory.read::<u64>(sp) {
        if word != pc && self.lookup_symbol(word).is_some() {
          addrs.push(word);
        }
      }
      sp += 8;
    }

    let mut out = String::new();
    for (frame, addr) in addrs.iter().enumerate() {
      match self.lookup_symbol(*addr) {
        Some(sym) => {
          let _ = writeln!(
            out,
            "#{frame} 0x{addr:016x} in {}+0x{:x}",
            sym.name,
            addr - sym.address
          );
        }
        None => {
          let _ = writeln!(out, "#{frame} 0x{addr:016x}");
        }
      }
    }
    out
  }

  /// Count decoder records per bytecode across this machine's execute
  /// segments, most frequent first.
  pub fn collect_bytecode_statistics(&self) -> Vec<BytecodeStats> {
    let mut stats: Vec<BytecodeStats> = Vec::new();
    for segment in self.memory.execute_segments() {
      for entry in segment.entries() {
        match stats.iter_mut().find(|s| s.bytecode == entry.bytecode) {
          Some(slot) => slot.count += 1,
          None => stats.push(BytecodeStats {
            bytecode: entry.bytecode,
            count: 1,
          }),
        }
      }
    }
    stats.sort_by(|a, b| b.count.cmp(&a.count));
    stats
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runtime::bytecode::Bytecode;
  use crate::runtime::register::REG_SP;
  use crate::runtime::segment::DecodedExecuteSegment;
  use crate::utils::asm;
  use crate::utils::MachineOptions;
  use std::sync::Arc;

  fn small_opts() -> MachineOptions {
    MachineOptions::default().with_options(vec![crate::utils::with_memory_max(16 << 20)])
  }

  /// `_start`: place `value` in A0 and take the exit syscall.
  fn exit_with(value: i32) -> Vec<u32> {
    vec![
      asm::addi_w(4, 0, value),
      asm::ori(11, 0, 93),
      asm::syscall(),
    ]
  }

  #[test]
  fn simple_program_returns_42() {
    crate::utils::setup_logger();
    let image = asm::build_elf(&exit_with(42), 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    machine.setup_linux(&["prog"], &[]).unwrap();

    let stopped = machine.simulate(1_000_000).unwrap();
    assert!(stopped);
    assert_eq!(42, machine.return_value::<i32>());
    assert!(machine.instruction_counter() > 0);
    assert!(machine.instruction_counter() < 200_000);
  }

  #[test]
  fn counter_increments_once_per_instruction() {
    let image = asm::build_elf(&exit_with(0), 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    machine.simulate(1_000_000).unwrap();
    // Two straight-line instructions plus the syscall terminator.
    assert_eq!(3, machine.instruction_counter());
  }

  #[test]
  fn zero_budget_returns_immediately() {
    let image = asm::build_elf(&exit_with(7), 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    let stopped = machine.simulate(0).unwrap();
    assert!(stopped);
    assert_eq!(0, machine.instruction_counter());
    assert_eq!(0x12000, machine.cpu.pc());
  }

  #[test]
  fn budget_exhaustion_is_resumable() {
    // A counting loop: a0 counts down from 60, then exit with a1.
    let code = vec![
      asm::addi_w(4, 0, 60),
      asm::addi_w(5, 0, 0),
      // loop:
      asm::addi_w(5, 5, 1),
      asm::addi_w(4, 4, -1),
      asm::bnez(4, -8),
      asm::or_(4, 5, 0),
      asm::ori(11, 0, 93),
      asm::syscall(),
    ];
    let image = asm::build_elf(&code, 0x12000, &[]);

    // One shot.
    let mut one = Machine::new(&image, small_opts()).unwrap();
    assert!(one.simulate(1_000_000).unwrap());
    assert_eq!(60, one.return_value::<i32>());

    // Split across two calls with a budget boundary mid-loop.
    let mut two = Machine::new(&image, small_opts()).unwrap();
    assert!(!two.simulate(50).unwrap());
    assert!(two.instruction_limit_reached());
    assert!(two.simulate(1_000_000).unwrap());
    assert_eq!(60, two.return_value::<i32>());
  }

  #[test]
  fn exit_syscall_propagates_status() {
    let code = vec![
      asm::addi_w(4, 0, 123),
      asm::ori(11, 0, 94),
      asm::syscall(),
    ];
    let image = asm::build_elf(&code, 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    let stopped = machine.simulate(1_000_000).unwrap();
    assert!(stopped);
    assert_eq!(0, machine.max_instructions());
    assert_eq!(123, machine.return_value::<i32>());
    // The syscall itself retired.
    assert_eq!(3, machine.instruction_counter());
  }

  #[test]
  fn zero_register_stays_zero() {
    let code = vec![
      asm::addi_d(0, 0, 55),
      asm::or_(4, 0, 0),
      asm::ori(11, 0, 93),
      asm::syscall(),
    ];
    let image = asm::build_elf(&code, 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    machine.simulate(1_000_000).unwrap();
    assert_eq!(0, machine.return_value::<u64>());
    assert_eq!(0, machine.cpu.regs.get(0));
  }

  #[test]
  fn guest_write_to_rodata_faults() {
    // st.w into the page below the image.
    let base: u64 = 0x12000;
    let code = vec![
      asm::lu12i_w(12, (base >> 12) as i32),
      asm::st_w(0, 12, -4),
    ];
    let image = asm::build_elf(&code, base, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    let err = machine.simulate(1_000).unwrap_err();
    assert_eq!(
      MachineError::ProtectionFault(base - 4, "write to read-only memory"),
      err
    );
  }

  #[test]
  fn host_write_to_rodata_faults_with_address() {
    let image = asm::build_elf(&exit_with(0), 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    let rodata = machine.memory.rodata_start();
    let err = machine
      .memory
      .write::<u32>(rodata - 4, 0xdead_beef)
      .unwrap_err();
    assert!(matches!(err, MachineError::ProtectionFault(addr, _) if addr == rodata - 4));
  }

  #[test]
  fn jump_outside_any_segment_faults() {
    let code = vec![asm::jirl(0, 4, 0)];
    let image = asm::build_elf(&code, 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    machine.cpu.regs.set(4, 0x9_0000);
    let err = machine.simulate(1_000).unwrap_err();
    assert_eq!(MachineError::ExecSpaceProtectionFault(0x9_0000), err);
  }

  #[test]
  fn pc_at_segment_end_resolves_instead_of_fetching() {
    // A jump landing exactly on exec_end must take the resolution path,
    // which faults here because no further segment exists.
    let code = vec![asm::b(4)];
    let mut machine = Machine::from_code(&code, 0x10000, small_opts()).unwrap();
    let end = machine.cpu.current_segment().exec_end();
    assert_eq!(0x10004, end);
    let err = machine.simulate(10).unwrap_err();
    assert_eq!(MachineError::ExecSpaceProtectionFault(end), err);
  }

  #[test]
  fn misaligned_jump_faults() {
    let code = vec![asm::jirl(0, 4, 0)];
    let image = asm::build_elf(&code, 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    machine.cpu.regs.set(4, 0x12002);
    let err = machine.simulate(1_000).unwrap_err();
    assert_eq!(MachineError::MisalignedInstruction(0x12002), err);
  }

  #[test]
  fn unknown_syscall_number_faults() {
    let code = vec![asm::ori(11, 0, 499), asm::syscall()];
    let image = asm::build_elf(&code, 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    let err = machine.simulate(1_000).unwrap_err();
    assert_eq!(MachineError::UnimplementedSyscall(499), err);
  }

  fn add_function_image() -> Vec<u8> {
    // add: add.w a0, a0, a1; ret -- plus the fast_exit stub.
    let base: u64 = 0x12000;
    let mut code = vec![asm::add_w(4, 4, 5), asm::ret()];
    code.extend_from_slice(&asm::fast_exit_stub());
    asm::build_elf(
      &code,
      base,
      &[("add", base, 8), ("fast_exit", base + 8, 8)],
    )
  }

  #[test]
  fn vmcall_passes_integer_arguments() {
    let mut machine = Machine::new(&add_function_image(), small_opts()).unwrap();
    let result = machine.vmcall("add", &[15i32.into(), 27i32.into()]).unwrap();
    assert_eq!(42, result as i32);
  }

  #[test]
  fn vmcall_unknown_symbol_errors() {
    let mut machine = Machine::new(&add_function_image(), small_opts()).unwrap();
    assert_eq!(
      Err(MachineError::SymbolNotFound("missing".into())),
      machine.vmcall("missing", &[])
    );
  }

  #[test]
  fn vmcall_resets_the_stack_each_call() {
    let mut machine = Machine::new(&add_function_image(), small_opts()).unwrap();
    machine.vmcall("add", &[1i32.into(), 2i32.into()]).unwrap();
    let sp_after_first = machine.cpu.regs.get(REG_SP);
    machine.vmcall("add", &[3i32.into(), 4i32.into()]).unwrap();
    assert_eq!(sp_after_first, machine.cpu.regs.get(REG_SP));
  }

  fn fib_image() -> Vec<u8> {
    let base: u64 = 0x12000;
    let code = vec![
      // fib:
      asm::slti(12, 4, 2),
      asm::beqz(12, 8),
      asm::ret(),
      // recurse:
      asm::addi_d(3, 3, -32),
      asm::st_d(1, 3, 0),
      asm::st_d(23, 3, 8),
      asm::st_d(4, 3, 16),
      asm::addi_w(4, 4, -1),
      asm::bl(-32),
      asm::or_(23, 4, 0),
      asm::ld_d(4, 3, 16),
      asm::addi_w(4, 4, -2),
      asm::bl(-48),
      asm::add_w(4, 4, 23),
      asm::ld_d(1, 3, 0),
      asm::ld_d(23, 3, 8),
      asm::addi_d(3, 3, 32),
      asm::ret(),
    ];
    let mut code = code;
    let exit_at = base + code.len() as u64 * 4;
    code.extend_from_slice(&asm::fast_exit_stub());
    asm::build_elf(
      &code,
      base,
      &[("fib", base, 18 * 4), ("fast_exit", exit_at, 8)],
    )
  }

  #[test]
  fn vmcall_recursive_fib() {
    crate::utils::setup_logger();
    let mut machine = Machine::new(&fib_image(), small_opts()).unwrap();
    assert_eq!(55, machine.vmcall("fib", &[10i32.into()]).unwrap());
    assert_eq!(6765, machine.vmcall("fib", &[20i32.into()]).unwrap());
  }

  #[test]
  fn preempt_times_out_on_small_budgets() {
    let mut machine = Machine::new(&fib_image(), small_opts()).unwrap();
    let err = machine.preempt(100, "fib", &[10i32.into()]).unwrap_err();
    assert!(matches!(err, MachineError::Timeout(_)));
    // With a real budget the same call succeeds.
    assert_eq!(55, machine.preempt(100_000, "fib", &[10i32.into()]).unwrap());
  }

  #[test]
  fn vmcall_pushes_buffers_on_the_stack() {
    let base: u64 = 0x12000;
    // first_byte: ld.bu a0, a0, 0; ret
    let mut code = vec![asm::ld_bu(4, 4, 0), asm::ret()];
    code.extend_from_slice(&asm::fast_exit_stub());
    let image = asm::build_elf(
      &code,
      base,
      &[("first_byte", base, 8), ("fast_exit", base + 8, 8)],
    );
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    let result = machine.vmcall("first_byte", &["Zebra".into()]).unwrap();
    assert_eq!(b'Z' as u64, result);
    // The pushed frame is 16-byte aligned.
    assert_eq!(0, machine.cpu.regs.get(REG_SP) % 16);
  }

  #[test]
  fn machines_share_decoded_segments_across_threads() {
    let image = fib_image();
    let opts = small_opts();
    let first = Machine::new(&image, opts).unwrap();
    let second = Machine::new(&image, opts).unwrap();

    let seg_a = first.memory.execute_segments().next().unwrap().clone();
    let seg_b = second.memory.execute_segments().next().unwrap().clone();
    assert!(Arc::ptr_eq(&seg_a, &seg_b));

    let handles = [first, second].map(|mut machine| {
      std::thread::spawn(move || machine.vmcall("fib", &[20i32.into()]).unwrap())
    });
    for handle in handles {
      assert_eq!(6765, handle.join().unwrap());
    }
  }

  #[test]
  fn rewritten_and_generic_records_agree() {
    // A program with a healthy mix of rewrite-eligible instructions.
    let code = vec![
      asm::addi_d(4, 0, 100),
      asm::addi_w(5, 0, -3),
      asm::add_d(6, 4, 5),
      asm::sub_w(7, 4, 5),
      asm::slli_d(8, 4, 3),
      asm::andi(9, 8, 0xff),
      asm::sltu(10, 5, 4),
      asm::st_d(6, 3, -8),
      asm::ld_d(11, 3, -8),
      asm::bstrpick_d(13, 8, 7, 0),
      asm::ori(11, 0, 93),
      asm::syscall(),
    ];
    let base = 0x12000;
    let image = asm::build_elf(&code, base, &[]);

    let mut rewritten = Machine::new(&image, small_opts()).unwrap();
    rewritten.simulate(1_000).unwrap();

    // Force the generic path: populate without the rewriter pass.
    let mut generic = Machine::new(&image, small_opts()).unwrap();
    let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_le_bytes()).collect();
    let entries = crate::runtime::decoder::populate(&bytes, base);
    let plain = Arc::new(DecodedExecuteSegment::new(
      base,
      base + bytes.len() as u64,
      entries,
    ));
    generic.cpu.set_segment(plain);
    generic.simulate(1_000).unwrap();

    assert_eq!(rewritten.cpu.regs.all(), generic.cpu.regs.all());
    assert_eq!(
      rewritten.instruction_counter(),
      generic.instruction_counter()
    );
  }

  #[test]
  fn setup_linux_stack_layout() {
    let image = asm::build_elf(&exit_with(0), 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    machine
      .setup_linux(&["prog", "arg1"], &["TERM=dumb"])
      .unwrap();

    let sp = machine.cpu.regs.get(REG_SP);
    assert_eq!(0, sp % 8);

    // argc, then argv[0..2], then a null terminator.
    assert_eq!(2, machine.memory.read::<u64>(sp).unwrap());
    let argv0 = machine.memory.read::<u64>(sp + 8).unwrap();
    let argv1 = machine.memory.read::<u64>(sp + 16).unwrap();
    assert_eq!(0, machine.memory.read::<u64>(sp + 24).unwrap());
    assert_eq!("prog", machine.memory.memstring(argv0, 64).unwrap());
    assert_eq!("arg1", machine.memory.memstring(argv1, 64).unwrap());

    // envp follows: one pointer, then the terminator.
    let envp0 = machine.memory.read::<u64>(sp + 32).unwrap();
    assert_eq!("TERM=dumb", machine.memory.memstring(envp0, 64).unwrap());
    assert_eq!(0, machine.memory.read::<u64>(sp + 40).unwrap());

    // The auxiliary vector starts after envp and ends with AT_NULL.
    let mut at = sp + 48;
    let mut saw_pagesz = false;
    let mut saw_random = false;
    loop {
      let tag = machine.memory.read::<u64>(at).unwrap();
      let value = machine.memory.read::<u64>(at + 8).unwrap();
      match tag {
        0 => break,
        6 => {
          assert_eq!(4096, value);
          saw_pagesz = true;
        }
        25 => {
          assert_ne!(0, value);
          saw_random = true;
        }
        _ => {}
      }
      at += 16;
    }
    assert!(saw_pagesz);
    assert!(saw_random);
  }

  #[test]
  fn setup_linux_requires_a_program_name() {
    let image = asm::build_elf(&exit_with(0), 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    assert!(machine.setup_linux(&[], &[]).is_err());
  }

  #[test]
  fn ll_sc_pair_succeeds_and_clears_the_link() {
    let code = vec![
      // a0 = &data (heap); ll/sc increment.
      asm::ll_d(13, 4, 0),
      asm::addi_d(13, 13, 1),
      asm::sc_d(13, 4, 0),
      asm::or_(5, 13, 0),
      // A second sc without ll must fail.
      asm::addi_d(14, 0, 9),
      asm::sc_d(14, 4, 0),
      asm::or_(6, 14, 0),
      asm::ori(11, 0, 93),
      asm::syscall(),
    ];
    let image = asm::build_elf(&code, 0x12000, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    let data = machine.memory.heap_address();
    machine.memory.write::<u64>(data, 41).unwrap();
    machine.cpu.regs.set(4, data);
    machine.simulate(1_000).unwrap();

    assert_eq!(42, machine.memory.read::<u64>(data).unwrap());
    assert_eq!(1, machine.cpu.regs.get(5));
    assert_eq!(0, machine.cpu.regs.get(6));
  }

  #[test]
  fn stale_segments_are_rebuilt_before_reentry() {
    let base: u64 = 0x12000;
    let code = vec![
      asm::addi_w(4, 0, 1),
      asm::ori(11, 0, 93),
      asm::syscall(),
    ];
    let image = asm::build_elf(&code, base, &[]);
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    machine.simulate(1_000).unwrap();
    assert_eq!(1, machine.return_value::<i32>());

    // Rewrite the first instruction in the arena and invalidate.
    machine
      .memory
      .install_image(base, &asm::addi_w(4, 0, 7).to_le_bytes())
      .unwrap();
    machine.memory.invalidate_code_range(base, 4);
    let segment = machine.memory.exec_segment_for(base).unwrap();
    machine.cpu.set_segment(segment);

    machine.cpu.regs.pc = base;
    machine.simulate(1_000).unwrap();
    assert_eq!(7, machine.return_value::<i32>());
  }

  #[test]
  fn accelerated_strlen_patch() {
    let base: u64 = 0x12000;
    // A strlen that would loop forever if actually executed; the patch
    // must divert it before the first instruction runs.
    let mut code = vec![asm::b(0), asm::ret()];
    code.extend_from_slice(&asm::fast_exit_stub());
    let image = asm::build_elf(
      &code,
      base,
      &[("strlen", base, 8), ("fast_exit", base + 8, 8)],
    );
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    machine.setup_accelerated_syscalls();
    let result = machine.vmcall("strlen", &["four".into()]).unwrap();
    assert_eq!(4, result);
  }

  #[test]
  fn float_arguments_and_results() {
    let base: u64 = 0x12000;
    // dadd: fadd.d fa0, fa0, fa1; ret
    let mut code = vec![asm::fadd_d(0, 0, 1), asm::ret()];
    code.extend_from_slice(&asm::fast_exit_stub());
    let image = asm::build_elf(
      &code,
      base,
      &[("dadd", base, 8), ("fast_exit", base + 8, 8)],
    );
    let mut machine = Machine::new(&image, small_opts()).unwrap();
    machine.vmcall("dadd", &[1.5f64.into(), 2.25f64.into()]).unwrap();
    assert_eq!(3.75, machine.return_value::<f64>());
  }

  #[test]
  fn bytecode_statistics_cover_the_image() {
    let image = asm::build_elf(&exit_with(1), 0x12000, &[]);
    let machine = Machine::new(&image, small_opts()).unwrap();
    let stats = machine.collect_bytecode_statistics();
    let total: u64 = stats.iter().map(|s| s.count).sum();
    // Three instructions plus the sentinel record.
    assert_eq!(4, total);
    assert!(stats.iter().any(|s| s.bytecode == Bytecode::Syscall));
  }

  #[test]
  fn raw_code_machines_need_no_elf() {
    let code = vec![
      asm::addi_w(4, 0, 31),
      asm::addi_w(5, 0, 11),
      asm::add_w(4, 4, 5),
      asm::ori(11, 0, 93),
      asm::syscall(),
    ];
    let mut machine = Machine::from_code(&code, 0x10000, small_opts()).unwrap();
    assert!(machine.simulate(100).unwrap());
    assert_eq!(42, machine.return_value::<i32>());
  }

  #[test]
  fn barriers_are_transparent() {
    let code = vec![
      asm::addi_w(4, 0, 5),
      asm::dbar(),
      asm::addi_w(4, 4, 2),
      asm::ori(11, 0, 93),
      asm::syscall(),
    ];
    let mut machine = Machine::from_code(&code, 0x10000, small_opts()).unwrap();
    machine.simulate(100).unwrap();
    assert_eq!(7, machine.return_value::<i32>());
    assert_eq!(5, machine.instruction_counter());
  }

  #[test]
  fn backtrace_names_the_faulting_frame() {
    let mut machine = Machine::new(&fib_image(), small_opts()).unwrap();
    machine.vmcall("fib", &[5i32.into()]).unwrap();
    machine.cpu.regs.pc = machine.address_of("fib").unwrap() + 4;
    let trace = machine.backtrace();
    assert!(trace.contains("fib+0x4"));
  }
}
