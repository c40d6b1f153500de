//! The bytecode dispatch loop: the hot path that walks decoder-cache
//! records, retires one straight-line block per PC check and executes the
//! diverging terminator individually.

use std::sync::Arc;

use crate::runtime::bytecode::{Bytecode, RegImm, RegReg, RegUpper};
use crate::runtime::decoder::{self, DecoderEntry, Handler};
use crate::runtime::instruction::Instruction;
use crate::runtime::register::{REG_A7, REG_RA};
use crate::runtime::segment::DecodedExecuteSegment;
use crate::runtime::{Machine, MachineError};

/// Local instruction counter pair: the loop runs on these and publishes
/// them to the machine at syscalls and on exit.
#[derive(Debug, Clone, Copy)]
pub struct InstrCounter {
  counter: u64,
  max: u64,
}

impl InstrCounter {
  pub fn new(counter: u64, max: u64) -> Self {
    Self { counter, max }
  }

  #[inline]
  pub fn value(&self) -> u64 {
    self.counter
  }

  #[inline]
  pub fn max(&self) -> u64 {
    self.max
  }

  #[inline]
  pub fn stop(&mut self) {
    self.max = 0;
  }

  #[inline]
  pub fn increment(&mut self, count: u64) {
    self.counter += count;
  }

  #[inline]
  pub fn overflowed(&self) -> bool {
    self.counter >= self.max
  }

  /// Publish both counters to the machine (before a syscall).
  pub fn apply(&self, machine: &mut Machine) {
    machine.set_instruction_counter(self.counter);
    machine.set_max_instructions(self.max);
  }

  /// Reload both counters from the machine (after a syscall; the handler
  /// may have stopped the machine or extended the budget).
  pub fn retrieve(&mut self, machine: &Machine) {
    self.counter = machine.instruction_counter();
    self.max = machine.max_instructions();
  }
}

fn resolve_segment(
  machine: &mut Machine,
  pc: u64,
) -> Result<Arc<DecodedExecuteSegment>, MachineError> {
  let segment = machine.memory.exec_segment_for(pc)?;
  machine.cpu.set_segment(segment.clone());
  Ok(segment)
}

/// Run the accurate dispatch loop from `pc` until the instruction budget
/// is exhausted or a handler stops the machine. Leaves the CPU's PC at
/// the next instruction to execute and the machine counters up to date.
/// Returns true iff the machine stopped explicitly (`max_counter == 0`).
pub fn simulate(
  machine: &mut Machine,
  pc: u64,
  counter: u64,
  max_counter: u64,
) -> Result<bool, MachineError> {
  let mut pc = pc;
  let mut counter = InstrCounter::new(counter, max_counter);

  let mut exec = machine.cpu.current_segment().clone();
  let mut handlers = decoder::handler_table();

  let stopped = loop {
    if counter.overflowed() {
      break counter.max() == 0;
    }
    if pc % 4 != 0 {
      return Err(MachineError::MisalignedInstruction(pc));
    }
    if !exec.contains(pc) {
      machine.cpu.regs.pc = pc;
      exec = resolve_segment(machine, pc)?;
      // New segments may have interned new handlers.
      handlers = decoder::handler_table();
    }

    let entries = exec.entries();
    let mut idx = ((pc - exec.exec_begin()) >> 2) as usize;
    let entry = entries[idx];
    let mut remaining = entry.block_bytes as u64;
    pc += remaining;
    counter.increment(entry.instruction_count());

    // The straight-line run: none of these touch PC.
    while remaining >= 4 {
      execute_one(machine, entries[idx], &handlers)?;
      idx += 1;
      remaining -= 4;
    }

    // The diverging terminator sees the up-to-date PC and may move it.
    let term = entries[idx];
    machine.cpu.regs.pc = pc;
    match term.bytecode {
      Bytecode::Syscall => {
        counter.apply(machine);
        let nr = machine.cpu.regs.get(REG_A7);
        machine.system_call(nr)?;
        counter.retrieve(machine);
        if machine.cpu.regs.pc != pc {
          // The handler redirected control; re-resolve from the new PC.
          pc = machine.cpu.regs.pc;
          if counter.overflowed() {
            break counter.max() == 0;
          }
          continue;
        }
        if counter.max() == 0 {
          pc += 4;
          break true;
        }
        pc += 4;
      }
      Bytecode::SyscallImm => {
        counter.apply(machine);
        machine.system_call(term.instr as u64)?;
        counter.retrieve(machine);
        if counter.max() == 0 {
          pc = machine.cpu.regs.get(REG_RA);
          break true;
        }
        // Patched prologues return straight to the caller.
        pc = machine.cpu.regs.get(REG_RA);
      }
      Bytecode::Stop => {
        pc += 4;
        counter.stop();
        break true;
      }
      _ => {
        execute_one(machine, term, &handlers)?;
        pc = machine.cpu.regs.pc.wrapping_add(4);
      }
    }
  };

  machine.cpu.regs.pc = pc;
  counter.apply(machine);
  Ok(stopped)
}

/// The budget-free variant: no counter updates, no overflow checks. Runs
/// until a handler stops the machine (or faults). Used by callers with
/// no instruction budget, where the loop overhead matters.
pub fn simulate_inaccurate(machine: &mut Machine, pc: u64) -> Result<(), MachineError> {
  let mut pc = pc;
  machine.set_max_instructions(u64::MAX);

  let mut exec = machine.cpu.current_segment().clone();
  let mut handlers = decoder::handler_table();

  loop {
    if pc % 4 != 0 {
      return Err(MachineError::MisalignedInstruction(pc));
    }
    if !exec.contains(pc) {
      machine.cpu.regs.pc = pc;
      exec = resolve_segment(machine, pc)?;
      handlers = decoder::handler_table();
    }

    let entries = exec.entries();
    let mut idx = ((pc - exec.exec_begin()) >> 2) as usize;
    let mut remaining = entries[idx].block_bytes as u64;
    pc += remaining;

    while remaining >= 4 {
      execute_one(machine, entries[idx], &handlers)?;
      idx += 1;
      remaining -= 4;
    }

    let term = entries[idx];
    machine.cpu.regs.pc = pc;
    match term.bytecode {
      Bytecode::Syscall => {
        let nr = machine.cpu.regs.get(REG_A7);
        machine.system_call(nr)?;
        if machine.cpu.regs.pc != pc {
          pc = machine.cpu.regs.pc;
          if machine.max_instructions() == 0 {
            machine.cpu.regs.pc = pc;
            return Ok(());
          }
          continue;
        }
        if machine.max_instructions() == 0 {
          machine.cpu.regs.pc = pc.wrapping_add(4);
          return Ok(());
        }
        pc += 4;
      }
      Bytecode::SyscallImm => {
        machine.system_call(term.instr as u64)?;
        pc = machine.cpu.regs.get(REG_RA);
        if machine.max_instructions() == 0 {
          machine.cpu.regs.pc = pc;
          return Ok(());
        }
      }
      Bytecode::Stop => {
        machine.cpu.regs.pc = pc.wrapping_add(4);
        machine.set_max_instructions(0);
        return Ok(());
      }
      _ => {
        execute_one(machine, term, &handlers)?;
        pc = machine.cpu.regs.pc.wrapping_add(4);
      }
    }
  }
}

/// Execute one decoder record: the specialized bytecodes read their
/// pre-extracted fields straight out of the packed `instr` word; the
/// generic fallbacks go through the interned handler table with the raw
/// instruction bits.
#[inline]
fn execute_one(
  machine: &mut Machine,
  e: DecoderEntry,
  handlers: &[Handler],
) -> Result<(), MachineError> {
  use Bytecode::*;

  let m = machine;
  match e.bytecode {
    // === Loads, 12-bit immediate ===
    LdB => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      let v = m.memory.read::<i8>(addr)?;
      m.cpu.regs.set(ri.rd, v as i64 as u64);
    }
    LdH => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      let v = m.memory.read::<i16>(addr)?;
      m.cpu.regs.set(ri.rd, v as i64 as u64);
    }
    LdW => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      let v = m.memory.read::<i32>(addr)?;
      m.cpu.regs.set(ri.rd, v as i64 as u64);
    }
    LdD => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      let v = m.memory.read::<u64>(addr)?;
      m.cpu.regs.set(ri.rd, v);
    }
    LdBu => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      let v = m.memory.read::<u8>(addr)?;
      m.cpu.regs.set(ri.rd, v as u64);
    }
    LdHu => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      let v = m.memory.read::<u16>(addr)?;
      m.cpu.regs.set(ri.rd, v as u64);
    }
    LdWu => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      let v = m.memory.read::<u32>(addr)?;
      m.cpu.regs.set(ri.rd, v as u64);
    }

    // === Stores, 12-bit immediate ===
    StB => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      m.memory.write::<u8>(addr, m.cpu.regs.get(ri.rd) as u8)?;
    }
    StH => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      m.memory.write::<u16>(addr, m.cpu.regs.get(ri.rd) as u16)?;
    }
    StW => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      m.memory.write::<u32>(addr, m.cpu.regs.get(ri.rd) as u32)?;
    }
    StD => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      m.memory.write::<u64>(addr, m.cpu.regs.get(ri.rd))?;
    }

    // === 14-bit scaled offset forms (offset pre-scaled at rewrite) ===
    LdptrW => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      let v = m.memory.read::<i32>(addr)?;
      m.cpu.regs.set(ri.rd, v as i64 as u64);
    }
    LdptrD => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      let v = m.memory.read::<u64>(addr)?;
      m.cpu.regs.set(ri.rd, v);
    }
    StptrW => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      m.memory.write::<u32>(addr, m.cpu.regs.get(ri.rd) as u32)?;
    }
    StptrD => {
      let ri = RegImm::from_packed(e.instr);
      let addr = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      m.memory.write::<u64>(addr, m.cpu.regs.get(ri.rd))?;
    }

    // === Register-indexed loads and stores ===
    LdxW => {
      let rr = RegReg::from_packed(e.instr);
      let addr = m.cpu.regs.get(rr.rj).wrapping_add(m.cpu.regs.get(rr.rk));
      let v = m.memory.read::<i32>(addr)?;
      m.cpu.regs.set(rr.rd, v as i64 as u64);
    }
    LdxD => {
      let rr = RegReg::from_packed(e.instr);
      let addr = m.cpu.regs.get(rr.rj).wrapping_add(m.cpu.regs.get(rr.rk));
      let v = m.memory.read::<u64>(addr)?;
      m.cpu.regs.set(rr.rd, v);
    }
    LdxBu => {
      let rr = RegReg::from_packed(e.instr);
      let addr = m.cpu.regs.get(rr.rj).wrapping_add(m.cpu.regs.get(rr.rk));
      let v = m.memory.read::<u8>(addr)?;
      m.cpu.regs.set(rr.rd, v as u64);
    }
    StxW => {
      let rr = RegReg::from_packed(e.instr);
      let addr = m.cpu.regs.get(rr.rj).wrapping_add(m.cpu.regs.get(rr.rk));
      m.memory.write::<u32>(addr, m.cpu.regs.get(rr.rd) as u32)?;
    }
    StxD => {
      let rr = RegReg::from_packed(e.instr);
      let addr = m.cpu.regs.get(rr.rj).wrapping_add(m.cpu.regs.get(rr.rk));
      m.memory.write::<u64>(addr, m.cpu.regs.get(rr.rd))?;
    }

    // === ALU, register-register ===
    AddW => {
      let rr = RegReg::from_packed(e.instr);
      let v = (m.cpu.regs.get(rr.rj) as i32).wrapping_add(m.cpu.regs.get(rr.rk) as i32);
      m.cpu.regs.set(rr.rd, v as i64 as u64);
    }
    AddD => {
      let rr = RegReg::from_packed(e.instr);
      let v = m.cpu.regs.get(rr.rj).wrapping_add(m.cpu.regs.get(rr.rk));
      m.cpu.regs.set(rr.rd, v);
    }
    SubW => {
      let rr = RegReg::from_packed(e.instr);
      let v = (m.cpu.regs.get(rr.rj) as i32).wrapping_sub(m.cpu.regs.get(rr.rk) as i32);
      m.cpu.regs.set(rr.rd, v as i64 as u64);
    }
    SubD => {
      let rr = RegReg::from_packed(e.instr);
      let v = m.cpu.regs.get(rr.rj).wrapping_sub(m.cpu.regs.get(rr.rk));
      m.cpu.regs.set(rr.rd, v);
    }
    And => {
      let rr = RegReg::from_packed(e.instr);
      let v = m.cpu.regs.get(rr.rj) & m.cpu.regs.get(rr.rk);
      m.cpu.regs.set(rr.rd, v);
    }
    Or => {
      let rr = RegReg::from_packed(e.instr);
      let v = m.cpu.regs.get(rr.rj) | m.cpu.regs.get(rr.rk);
      m.cpu.regs.set(rr.rd, v);
    }
    Xor => {
      let rr = RegReg::from_packed(e.instr);
      let v = m.cpu.regs.get(rr.rj) ^ m.cpu.regs.get(rr.rk);
      m.cpu.regs.set(rr.rd, v);
    }
    Nor => {
      let rr = RegReg::from_packed(e.instr);
      let v = !(m.cpu.regs.get(rr.rj) | m.cpu.regs.get(rr.rk));
      m.cpu.regs.set(rr.rd, v);
    }
    Slt => {
      let rr = RegReg::from_packed(e.instr);
      let v = (m.cpu.regs.get(rr.rj) as i64) < (m.cpu.regs.get(rr.rk) as i64);
      m.cpu.regs.set(rr.rd, v as u64);
    }
    Sltu => {
      let rr = RegReg::from_packed(e.instr);
      let v = m.cpu.regs.get(rr.rj) < m.cpu.regs.get(rr.rk);
      m.cpu.regs.set(rr.rd, v as u64);
    }
    Maskeqz => {
      let rr = RegReg::from_packed(e.instr);
      let v = if m.cpu.regs.get(rr.rk) == 0 {
        0
      } else {
        m.cpu.regs.get(rr.rj)
      };
      m.cpu.regs.set(rr.rd, v);
    }
    Masknez => {
      let rr = RegReg::from_packed(e.instr);
      let v = if m.cpu.regs.get(rr.rk) != 0 {
        0
      } else {
        m.cpu.regs.get(rr.rj)
      };
      m.cpu.regs.set(rr.rd, v);
    }
    MulD => {
      let rr = RegReg::from_packed(e.instr);
      let v = m.cpu.regs.get(rr.rj).wrapping_mul(m.cpu.regs.get(rr.rk));
      m.cpu.regs.set(rr.rd, v);
    }
    AlslD => {
      let rr = RegReg::from_packed(e.instr);
      let v = (m.cpu.regs.get(rr.rj) << (rr.sa + 1)).wrapping_add(m.cpu.regs.get(rr.rk));
      m.cpu.regs.set(rr.rd, v);
    }
    ExtWB => {
      let rr = RegReg::from_packed(e.instr);
      m.cpu.regs.set(rr.rd, m.cpu.regs.get(rr.rj) as i8 as i64 as u64);
    }
    SllW => {
      let rr = RegReg::from_packed(e.instr);
      let sh = m.cpu.regs.get(rr.rk) as u32 & 0x1f;
      let v = (m.cpu.regs.get(rr.rj) as u32) << sh;
      m.cpu.regs.set(rr.rd, v as i32 as i64 as u64);
    }
    SllD => {
      let rr = RegReg::from_packed(e.instr);
      let sh = m.cpu.regs.get(rr.rk) & 0x3f;
      m.cpu.regs.set(rr.rd, m.cpu.regs.get(rr.rj) << sh);
    }
    SrlD => {
      let rr = RegReg::from_packed(e.instr);
      let sh = m.cpu.regs.get(rr.rk) & 0x3f;
      m.cpu.regs.set(rr.rd, m.cpu.regs.get(rr.rj) >> sh);
    }
    SraD => {
      let rr = RegReg::from_packed(e.instr);
      let sh = m.cpu.regs.get(rr.rk) & 0x3f;
      m.cpu.regs.set(rr.rd, ((m.cpu.regs.get(rr.rj) as i64) >> sh) as u64);
    }

    // === ALU, immediate ===
    AddiW => {
      let ri = RegImm::from_packed(e.instr);
      let v = (m.cpu.regs.get(ri.rj) as i32).wrapping_add(ri.imm as i32);
      m.cpu.regs.set(ri.rd, v as i64 as u64);
    }
    AddiD => {
      let ri = RegImm::from_packed(e.instr);
      let v = m.cpu.regs.get(ri.rj).wrapping_add(ri.imm as i64 as u64);
      m.cpu.regs.set(ri.rd, v);
    }
    Andi => {
      let ri = RegImm::from_packed(e.instr);
      m.cpu.regs.set(ri.rd, m.cpu.regs.get(ri.rj) & ri.uimm());
    }
    Ori => {
      let ri = RegImm::from_packed(e.instr);
      m.cpu.regs.set(ri.rd, m.cpu.regs.get(ri.rj) | ri.uimm());
    }
    Xori => {
      let ri = RegImm::from_packed(e.instr);
      m.cpu.regs.set(ri.rd, m.cpu.regs.get(ri.rj) ^ ri.uimm());
    }
    Slti => {
      let ri = RegImm::from_packed(e.instr);
      let v = (m.cpu.regs.get(ri.rj) as i64) < ri.imm as i64;
      m.cpu.regs.set(ri.rd, v as u64);
    }
    Sltui => {
      let ri = RegImm::from_packed(e.instr);
      let v = m.cpu.regs.get(ri.rj) < ri.imm as i64 as u64;
      m.cpu.regs.set(ri.rd, v as u64);
    }
    SlliW => {
      let rr = RegReg::from_packed(e.instr);
      let v = (m.cpu.regs.get(rr.rj) as u32) << rr.rk;
      m.cpu.regs.set(rr.rd, v as i32 as i64 as u64);
    }
    SlliD => {
      let rr = RegReg::from_packed(e.instr);
      m.cpu.regs.set(rr.rd, m.cpu.regs.get(rr.rj) << rr.rk);
    }
    SrliW => {
      let rr = RegReg::from_packed(e.instr);
      let v = (m.cpu.regs.get(rr.rj) as u32) >> rr.rk;
      m.cpu.regs.set(rr.rd, v as i32 as i64 as u64);
    }
    SrliD => {
      let rr = RegReg::from_packed(e.instr);
      m.cpu.regs.set(rr.rd, m.cpu.regs.get(rr.rj) >> rr.rk);
    }
    SraiW => {
      let rr = RegReg::from_packed(e.instr);
      let v = (m.cpu.regs.get(rr.rj) as i32) >> rr.rk;
      m.cpu.regs.set(rr.rd, v as i64 as u64);
    }
    SraiD => {
      let rr = RegReg::from_packed(e.instr);
      m.cpu.regs.set(rr.rd, ((m.cpu.regs.get(rr.rj) as i64) >> rr.rk) as u64);
    }

    // === Bit fields and upper immediates ===
    BstrpickW => {
      let rr = RegReg::from_packed(e.instr);
      let (lsb, msb) = (rr.rk, rr.sa);
      let width = msb.wrapping_sub(lsb).wrapping_add(1);
      let mask = if width >= 32 { !0 } else { (1u32 << width) - 1 };
      let v = ((m.cpu.regs.get(rr.rj) as u32) >> lsb) & mask;
      m.cpu.regs.set(rr.rd, v as u64);
    }
    BstrpickD => {
      let rr = RegReg::from_packed(e.instr);
      let (lsb, msb) = (rr.rk, rr.sa);
      let width = msb.wrapping_sub(lsb).wrapping_add(1);
      let mask = if width >= 64 { !0 } else { (1u64 << width) - 1 };
      m.cpu.regs.set(rr.rd, (m.cpu.regs.get(rr.rj) >> lsb) & mask);
    }
    BstrinsD => {
      let rr = RegReg::from_packed(e.instr);
      let (lsb, msb) = (rr.rk, rr.sa);
      if msb >= lsb {
        let width = msb - lsb + 1;
        let mask = if width == 64 { !0 } else { ((1u64 << width) - 1) << lsb };
        let src = m.cpu.regs.get(rr.rj);
        let dst = m.cpu.regs.get(rr.rd);
        m.cpu.regs.set(rr.rd, (dst & !mask) | ((src << lsb) & mask));
      }
    }
    Lu12iW => {
      let up = RegUpper::from_packed(e.instr);
      m.cpu.regs.set(up.rd, ((up.imm as i64) << 12) as u64);
    }
    Lu32iD => {
      let up = RegUpper::from_packed(e.instr);
      let lower = m.cpu.regs.get(up.rd) & 0xffff_ffff;
      let upper = (up.imm as u32 as u64) << 32;
      m.cpu.regs.set(up.rd, upper | lower);
    }

    // === Terminators: PC-relative adds (raw bits) ===
    Pcaddi => {
      let i = Instruction(e.instr);
      let v = m.cpu.regs.pc.wrapping_add((i.simm20() << 2) as u64);
      m.cpu.regs.set(i.rd(), v);
    }
    Pcalau12i => {
      let i = Instruction(e.instr);
      let v = (m.cpu.regs.pc & !0xfff).wrapping_add((i.simm20() << 12) as u64);
      m.cpu.regs.set(i.rd(), v);
    }
    Pcaddu12i => {
      let i = Instruction(e.instr);
      let v = m.cpu.regs.pc.wrapping_add((i.simm20() << 12) as u64);
      m.cpu.regs.set(i.rd(), v);
    }

    // === Terminators: branches and jumps (raw bits) ===
    Beqz => {
      let i = Instruction(e.instr);
      if m.cpu.regs.get(i.rj()) == 0 {
        let offset = (i.simm21() << 2).wrapping_sub(4);
        m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
      }
    }
    Bnez => {
      let i = Instruction(e.instr);
      if m.cpu.regs.get(i.rj()) != 0 {
        let offset = (i.simm21() << 2).wrapping_sub(4);
        m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
      }
    }
    Beq => {
      let i = Instruction(e.instr);
      if m.cpu.regs.get(i.rj()) == m.cpu.regs.get(i.rd()) {
        let offset = (i.simm16() << 2).wrapping_sub(4);
        m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
      }
    }
    Bne => {
      let i = Instruction(e.instr);
      if m.cpu.regs.get(i.rj()) != m.cpu.regs.get(i.rd()) {
        let offset = (i.simm16() << 2).wrapping_sub(4);
        m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
      }
    }
    Blt => {
      let i = Instruction(e.instr);
      if (m.cpu.regs.get(i.rj()) as i64) < (m.cpu.regs.get(i.rd()) as i64) {
        let offset = (i.simm16() << 2).wrapping_sub(4);
        m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
      }
    }
    Bge => {
      let i = Instruction(e.instr);
      if (m.cpu.regs.get(i.rj()) as i64) >= (m.cpu.regs.get(i.rd()) as i64) {
        let offset = (i.simm16() << 2).wrapping_sub(4);
        m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
      }
    }
    Bltu => {
      let i = Instruction(e.instr);
      if m.cpu.regs.get(i.rj()) < m.cpu.regs.get(i.rd()) {
        let offset = (i.simm16() << 2).wrapping_sub(4);
        m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
      }
    }
    Bgeu => {
      let i = Instruction(e.instr);
      if m.cpu.regs.get(i.rj()) >= m.cpu.regs.get(i.rd()) {
        let offset = (i.simm16() << 2).wrapping_sub(4);
        m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
      }
    }
    B => {
      let i = Instruction(e.instr);
      let offset = (i.simm26() << 2).wrapping_sub(4);
      m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
    }
    Bl => {
      let i = Instruction(e.instr);
      let link = m.cpu.regs.pc.wrapping_add(4);
      m.cpu.regs.set(REG_RA, link);
      let offset = (i.simm26() << 2).wrapping_sub(4);
      m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
    }
    Jirl => {
      let i = Instruction(e.instr);
      let link = m.cpu.regs.pc.wrapping_add(4);
      let target = m.cpu.regs.get(i.rj()).wrapping_add((i.simm16() << 2) as u64);
      m.cpu.regs.set(i.rd(), link);
      m.cpu.regs.pc = target.wrapping_sub(4);
    }

    // === Generic fallbacks ===
    Function | FuncBlock => {
      handlers[e.handler as usize](m, Instruction(e.instr))?;
    }
    Syscall => {
      let nr = m.cpu.regs.get(REG_A7);
      m.system_call(nr)?;
    }
    SyscallImm => {
      m.system_call(e.instr as u64)?;
    }
    Stop => {
      m.set_max_instructions(0);
    }
    Invalid => {
      return Err(MachineError::IllegalOpcode(m.cpu.regs.pc, e.instr));
    }
  }
  Ok(())
}
