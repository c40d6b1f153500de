//! Host-initiated guest function calls.
//!
//! `vmcall` marshals arguments per the LA64 C calling convention (the
//! integer/float register subset plus stack-pushed buffers), points RA at
//! the pre-registered exit address and runs the dispatch loop until the
//! guest returns there. The exit address is conventionally a guest stub
//! of `li.w $a7, 94; syscall 0` whose handler stops the machine.

use crate::runtime::register::{REG_A0, REG_RA, REG_SP};
use crate::runtime::{Machine, MachineError};

/// One marshalled call argument.
///
/// Integers and pointers ride in A0..A7, floats in FA0..FA7; buffers,
/// strings and by-value structs are pushed onto the guest stack in
/// 16-byte frames with the frame address passed as an integer argument.
#[derive(Debug, Clone)]
pub enum CallArg<'a> {
  Int(u64),
  Float(f32),
  Double(f64),
  /// A byte buffer pushed by copy (structs passed by value use this too).
  Buffer(&'a [u8]),
  /// A string pushed with its zero terminator.
  Str(&'a str),
}

impl From<u64> for CallArg<'_> {
  fn from(v: u64) -> Self {
    CallArg::Int(v)
  }
}

impl From<i64> for CallArg<'_> {
  fn from(v: i64) -> Self {
    CallArg::Int(v as u64)
  }
}

impl From<u32> for CallArg<'_> {
  fn from(v: u32) -> Self {
    CallArg::Int(v as u64)
  }
}

impl From<i32> for CallArg<'_> {
  fn from(v: i32) -> Self {
    CallArg::Int(v as i64 as u64)
  }
}

impl From<f32> for CallArg<'_> {
  fn from(v: f32) -> Self {
    CallArg::Float(v)
  }
}

impl From<f64> for CallArg<'_> {
  fn from(v: f64) -> Self {
    CallArg::Double(v)
  }
}

impl<'a> From<&'a str> for CallArg<'a> {
  fn from(v: &'a str) -> Self {
    CallArg::Str(v)
  }
}

impl<'a> From<&'a [u8]> for CallArg<'a> {
  fn from(v: &'a [u8]) -> Self {
    CallArg::Buffer(v)
  }
}

impl Machine {
  /// Push raw bytes onto the guest stack in a 16-byte-aligned frame,
  /// returning the pushed address.
  pub fn stack_push(&mut self, sp: &mut u64, data: &[u8]) -> Result<u64, MachineError> {
    let aligned = (data.len() as u64 + 15) & !15;
    *sp -= aligned;
    self.memory.copy_to_guest(*sp, data)?;
    Ok(*sp)
  }

  /// Marshal `args` into registers and stack per the call contract and
  /// aim RA at the exit address. The stack pointer is reset to the top
  /// of the stack for every call.
  fn setup_call(&mut self, args: &[CallArg<'_>]) -> Result<(), MachineError> {
    let exit_addr = self.memory.exit_address();
    self.cpu.regs.set(REG_RA, exit_addr);

    let mut sp = self.memory.stack_address();
    let mut iarg = REG_A0;
    let mut farg = 0u32;

    for arg in args {
      match arg {
        CallArg::Int(v) => {
          self.cpu.regs.set(iarg, *v);
          iarg += 1;
        }
        CallArg::Float(v) => {
          self.cpu.regs.vreg_mut(farg).set_f32(*v);
          farg += 1;
        }
        CallArg::Double(v) => {
          self.cpu.regs.vreg_mut(farg).set_f64(*v);
          farg += 1;
        }
        CallArg::Buffer(data) => {
          let addr = self.stack_push(&mut sp, data)?;
          self.cpu.regs.set(iarg, addr);
          iarg += 1;
        }
        CallArg::Str(s) => {
          let mut bytes = Vec::with_capacity(s.len() + 1);
          bytes.extend_from_slice(s.as_bytes());
          bytes.push(0);
          let addr = self.stack_push(&mut sp, &bytes)?;
          self.cpu.regs.set(iarg, addr);
          iarg += 1;
        }
      }
    }

    sp &= !0xf;
    self.cpu.regs.set(REG_SP, sp);
    Ok(())
  }

  /// Call the guest function at `addr` and run until it returns through
  /// the exit address. Returns the guest's A0.
  pub fn vmcall_at(&mut self, addr: u64, args: &[CallArg<'_>]) -> Result<u64, MachineError> {
    self.setup_call(args)?;
    self.cpu.jump(addr)?;
    crate::runtime::dispatch::simulate_inaccurate(self, addr)?;
    Ok(self.cpu.regs.get(REG_A0))
  }

  /// Call a guest function by symbol name.
  pub fn vmcall(&mut self, name: &str, args: &[CallArg<'_>]) -> Result<u64, MachineError> {
    let addr = self
      .memory
      .address_of(name)
      .ok_or_else(|| MachineError::SymbolNotFound(name.to_string()))?;
    self.vmcall_at(addr, args)
  }

  /// Call with an instruction budget; exceeding it without reaching the
  /// exit address is a timeout fault.
  pub fn preempt_at(
    &mut self,
    max_instructions: u64,
    addr: u64,
    args: &[CallArg<'_>],
  ) -> Result<u64, MachineError> {
    self.setup_call(args)?;
    self.cpu.jump(addr)?;
    let stopped = crate::runtime::dispatch::simulate(self, addr, 0, max_instructions)?;
    if !stopped {
      return Err(MachineError::Timeout(self.instruction_counter()));
    }
    Ok(self.cpu.regs.get(REG_A0))
  }

  /// [`Machine::preempt_at`] by symbol name.
  pub fn preempt(
    &mut self,
    max_instructions: u64,
    name: &str,
    args: &[CallArg<'_>],
  ) -> Result<u64, MachineError> {
    let addr = self
      .memory
      .address_of(name)
      .ok_or_else(|| MachineError::SymbolNotFound(name.to_string()))?;
    self.preempt_at(max_instructions, addr, args)
  }
}
