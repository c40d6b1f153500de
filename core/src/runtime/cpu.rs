use std::sync::Arc;

use crate::runtime::register::{Registers, REG_SP};
use crate::runtime::segment::DecodedExecuteSegment;
use crate::runtime::MachineError;

/// Execution state of the single guest hart: the register file, the LL/SC
/// link bit and the execute segment the dispatch loop is currently
/// running from.
pub struct Cpu {
  pub regs: Registers,
  /// Load-linked bit: set by LL, consumed by SC. Always succeeds in the
  /// single-threaded model.
  pub ll_bit: bool,
  exec: Arc<DecodedExecuteSegment>,
}

impl Cpu {
  pub fn new() -> Self {
    Self {
      regs: Registers::new(),
      ll_bit: false,
      exec: Arc::new(DecodedExecuteSegment::empty()),
    }
  }

  /// Reset registers and point SP and PC into the loaded image.
  pub fn reset(&mut self, start_address: u64, stack_address: u64) {
    self.regs.reset();
    self.regs.pc = start_address;
    self.regs.set(REG_SP, stack_address);
    self.ll_bit = false;
  }

  pub fn pc(&self) -> u64 {
    self.regs.pc
  }

  #[inline]
  pub fn reg(&self, idx: u32) -> u64 {
    self.regs.get(idx)
  }

  #[inline]
  pub fn set_reg(&mut self, idx: u32, value: u64) {
    self.regs.set(idx, value);
  }

  pub fn registers(&self) -> &Registers {
    &self.regs
  }

  pub fn registers_mut(&mut self) -> &mut Registers {
    &mut self.regs
  }

  /// Jump to an address, faulting unless it is instruction-aligned.
  pub fn jump(&mut self, addr: u64) -> Result<(), MachineError> {
    if addr % 4 != 0 {
      return Err(MachineError::MisalignedInstruction(addr));
    }
    self.regs.pc = addr;
    Ok(())
  }

  pub fn current_segment(&self) -> &Arc<DecodedExecuteSegment> {
    &self.exec
  }

  pub fn set_segment(&mut self, segment: Arc<DecodedExecuteSegment>) {
    self.exec = segment;
  }
}

impl Default for Cpu {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reset_places_sp_and_pc() {
    let mut cpu = Cpu::new();
    cpu.reset(0x12000, 0x7f000);
    assert_eq!(0x12000, cpu.pc());
    assert_eq!(0x7f000, cpu.regs.get(REG_SP));
    assert!(!cpu.ll_bit);
  }

  #[test]
  fn jump_requires_alignment() {
    let mut cpu = Cpu::new();
    assert!(cpu.jump(0x1004).is_ok());
    assert!(matches!(
      cpu.jump(0x1002),
      Err(MachineError::MisalignedInstruction(0x1002))
    ));
  }

  #[test]
  fn fresh_cpu_has_an_empty_segment() {
    let cpu = Cpu::new();
    assert!(cpu.current_segment().is_empty());
  }
}
