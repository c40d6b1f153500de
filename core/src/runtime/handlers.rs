//! The generic instruction catalog: one handler function per LA64
//! instruction, plus the decode function mapping a 32-bit word to its
//! handler. The dispatch loop only falls back here for instructions the
//! rewriter left generic; the hot subset runs through specialized
//! bytecode arms instead.

use crate::runtime::decoder::Handler;
use crate::runtime::instruction::Instruction;
use crate::runtime::opcode;
use crate::runtime::register::{REG_A7, REG_RA};
use crate::runtime::{Machine, MachineError};

type R = Result<(), MachineError>;

// === Arithmetic ===

fn add_w(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as i32).wrapping_add(m.cpu.regs.get(i.rk()) as i32);
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn add_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn sub_w(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as i32).wrapping_sub(m.cpu.regs.get(i.rk()) as i32);
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn sub_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()).wrapping_sub(m.cpu.regs.get(i.rk()));
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn slt(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as i64) < (m.cpu.regs.get(i.rk()) as i64);
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn sltu(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) < m.cpu.regs.get(i.rk());
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn addi_w(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as i32).wrapping_add(i.simm12() as i32);
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn addi_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn slti(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as i64) < i.simm12();
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn sltui(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) < i.simm12() as u64;
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn alsl_w(m: &mut Machine, i: Instruction) -> R {
  let shift = i.sa2() + 1;
  let v = ((m.cpu.regs.get(i.rj()) as u32) << shift).wrapping_add(m.cpu.regs.get(i.rk()) as u32);
  m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  Ok(())
}

fn alsl_d(m: &mut Machine, i: Instruction) -> R {
  let shift = i.sa2() + 1;
  let v = (m.cpu.regs.get(i.rj()) << shift).wrapping_add(m.cpu.regs.get(i.rk()));
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn bytepick_d(m: &mut Machine, i: Instruction) -> R {
  // Concatenate {rk, rj} and take 8 bytes starting (8 - sa3) bytes in.
  let sa3 = (i.word() >> 15) & 0x7;
  let rj = m.cpu.regs.get(i.rj());
  let rk = m.cpu.regs.get(i.rk());
  let v = if sa3 == 0 {
    rk
  } else {
    (rk << (8 * sa3)) | (rj >> (64 - 8 * sa3))
  };
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

// === Multiply / Divide ===

fn mul_w(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as i32).wrapping_mul(m.cpu.regs.get(i.rk()) as i32);
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn mulh_w(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as i32 as i64) * (m.cpu.regs.get(i.rk()) as i32 as i64);
  m.cpu.regs.set(i.rd(), (v >> 32) as u64);
  Ok(())
}

fn mulh_wu(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as u32 as u64) * (m.cpu.regs.get(i.rk()) as u32 as u64);
  m.cpu.regs.set(i.rd(), (v >> 32) as i32 as i64 as u64);
  Ok(())
}

fn mul_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()).wrapping_mul(m.cpu.regs.get(i.rk()));
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn mulh_d(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as i64 as i128) * (m.cpu.regs.get(i.rk()) as i64 as i128);
  m.cpu.regs.set(i.rd(), (v >> 64) as u64);
  Ok(())
}

fn mulh_du(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as u128) * (m.cpu.regs.get(i.rk()) as u128);
  m.cpu.regs.set(i.rd(), (v >> 64) as u64);
  Ok(())
}

fn div_w(m: &mut Machine, i: Instruction) -> R {
  let a = m.cpu.regs.get(i.rj()) as i32;
  let b = m.cpu.regs.get(i.rk()) as i32;
  let v = if b != 0 { a.wrapping_div(b) as i64 } else { 0 };
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn mod_w(m: &mut Machine, i: Instruction) -> R {
  let a = m.cpu.regs.get(i.rj()) as i32;
  let b = m.cpu.regs.get(i.rk()) as i32;
  let v = if b != 0 { a.wrapping_rem(b) as i64 } else { 0 };
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn div_wu(m: &mut Machine, i: Instruction) -> R {
  let a = m.cpu.regs.get(i.rj()) as u32;
  let b = m.cpu.regs.get(i.rk()) as u32;
  let v = if b != 0 { (a / b) as i32 as i64 } else { 0 };
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn mod_wu(m: &mut Machine, i: Instruction) -> R {
  let a = m.cpu.regs.get(i.rj()) as u32;
  let b = m.cpu.regs.get(i.rk()) as u32;
  let v = if b != 0 { (a % b) as i32 as i64 } else { 0 };
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn div_d(m: &mut Machine, i: Instruction) -> R {
  let a = m.cpu.regs.get(i.rj()) as i64;
  let b = m.cpu.regs.get(i.rk()) as i64;
  let v = if b != 0 { a.wrapping_div(b) } else { 0 };
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn mod_d(m: &mut Machine, i: Instruction) -> R {
  let a = m.cpu.regs.get(i.rj()) as i64;
  let b = m.cpu.regs.get(i.rk()) as i64;
  let v = if b != 0 { a.wrapping_rem(b) } else { 0 };
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn div_du(m: &mut Machine, i: Instruction) -> R {
  let a = m.cpu.regs.get(i.rj());
  let b = m.cpu.regs.get(i.rk());
  m.cpu.regs.set(i.rd(), if b != 0 { a / b } else { 0 });
  Ok(())
}

fn mod_du(m: &mut Machine, i: Instruction) -> R {
  let a = m.cpu.regs.get(i.rj());
  let b = m.cpu.regs.get(i.rk());
  m.cpu.regs.set(i.rd(), if b != 0 { a % b } else { 0 });
  Ok(())
}

// === Logical ===

fn and(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) & m.cpu.regs.get(i.rk());
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn or(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) | m.cpu.regs.get(i.rk());
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn xor(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) ^ m.cpu.regs.get(i.rk());
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn nor(m: &mut Machine, i: Instruction) -> R {
  let v = !(m.cpu.regs.get(i.rj()) | m.cpu.regs.get(i.rk()));
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn orn(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) | !m.cpu.regs.get(i.rk());
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn andn(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) & !m.cpu.regs.get(i.rk());
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn maskeqz(m: &mut Machine, i: Instruction) -> R {
  let v = if m.cpu.regs.get(i.rk()) == 0 {
    0
  } else {
    m.cpu.regs.get(i.rj())
  };
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn masknez(m: &mut Machine, i: Instruction) -> R {
  let v = if m.cpu.regs.get(i.rk()) != 0 {
    0
  } else {
    m.cpu.regs.get(i.rj())
  };
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn andi(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) & i.imm12() as u64;
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn ori(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) | i.imm12() as u64;
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn xori(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) ^ i.imm12() as u64;
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

// === Shifts and rotates ===

fn sll_w(m: &mut Machine, i: Instruction) -> R {
  let sh = m.cpu.regs.get(i.rk()) as u32 & 0x1f;
  let v = (m.cpu.regs.get(i.rj()) as u32) << sh;
  m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  Ok(())
}

fn srl_w(m: &mut Machine, i: Instruction) -> R {
  let sh = m.cpu.regs.get(i.rk()) as u32 & 0x1f;
  let v = (m.cpu.regs.get(i.rj()) as u32) >> sh;
  m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  Ok(())
}

fn sra_w(m: &mut Machine, i: Instruction) -> R {
  let sh = m.cpu.regs.get(i.rk()) as u32 & 0x1f;
  let v = (m.cpu.regs.get(i.rj()) as i32) >> sh;
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn sll_d(m: &mut Machine, i: Instruction) -> R {
  let sh = m.cpu.regs.get(i.rk()) & 0x3f;
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()) << sh);
  Ok(())
}

fn srl_d(m: &mut Machine, i: Instruction) -> R {
  let sh = m.cpu.regs.get(i.rk()) & 0x3f;
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()) >> sh);
  Ok(())
}

fn sra_d(m: &mut Machine, i: Instruction) -> R {
  let sh = m.cpu.regs.get(i.rk()) & 0x3f;
  m.cpu.regs.set(i.rd(), ((m.cpu.regs.get(i.rj()) as i64) >> sh) as u64);
  Ok(())
}

fn rotr_w(m: &mut Machine, i: Instruction) -> R {
  let sh = m.cpu.regs.get(i.rk()) as u32 & 0x1f;
  let v = (m.cpu.regs.get(i.rj()) as u32).rotate_right(sh);
  m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  Ok(())
}

fn rotr_d(m: &mut Machine, i: Instruction) -> R {
  let sh = m.cpu.regs.get(i.rk()) as u32 & 0x3f;
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()).rotate_right(sh));
  Ok(())
}

fn slli_w(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as u32) << i.ui5();
  m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  Ok(())
}

fn slli_d(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()) << i.ui6());
  Ok(())
}

fn srli_w(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as u32) >> i.ui5();
  m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  Ok(())
}

fn srli_d(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()) >> i.ui6());
  Ok(())
}

fn srai_w(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as i32) >> i.ui5();
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn srai_d(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), ((m.cpu.regs.get(i.rj()) as i64) >> i.ui6()) as u64);
  Ok(())
}

fn rotri_w(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as u32).rotate_right(i.ui5());
  m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  Ok(())
}

fn rotri_d(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()).rotate_right(i.ui6()));
  Ok(())
}

// === Bit manipulation ===

fn ext_w_b(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()) as i8 as i64 as u64);
  Ok(())
}

fn ext_w_h(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()) as i16 as i64 as u64);
  Ok(())
}

fn clo_w(m: &mut Machine, i: Instruction) -> R {
  let v = (!(m.cpu.regs.get(i.rj()) as u32)).leading_zeros();
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn clz_w(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), (m.cpu.regs.get(i.rj()) as u32).leading_zeros() as u64);
  Ok(())
}

fn cto_w(m: &mut Machine, i: Instruction) -> R {
  let v = (!(m.cpu.regs.get(i.rj()) as u32)).trailing_zeros();
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn ctz_w(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), (m.cpu.regs.get(i.rj()) as u32).trailing_zeros() as u64);
  Ok(())
}

fn clo_d(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), (!m.cpu.regs.get(i.rj())).leading_zeros() as u64);
  Ok(())
}

fn clz_d(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()).leading_zeros() as u64);
  Ok(())
}

fn cto_d(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), (!m.cpu.regs.get(i.rj())).trailing_zeros() as u64);
  Ok(())
}

fn ctz_d(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()).trailing_zeros() as u64);
  Ok(())
}

fn revb_2h(m: &mut Machine, i: Instruction) -> R {
  let x = m.cpu.regs.get(i.rj()) as u32;
  let v = ((x & 0x00ff_00ff) << 8) | ((x & 0xff00_ff00) >> 8);
  m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  Ok(())
}

fn revb_4h(m: &mut Machine, i: Instruction) -> R {
  let x = m.cpu.regs.get(i.rj());
  let v = ((x & 0x00ff_00ff_00ff_00ff) << 8) | ((x & 0xff00_ff00_ff00_ff00) >> 8);
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn revb_2w(m: &mut Machine, i: Instruction) -> R {
  let x = m.cpu.regs.get(i.rj());
  let lo = (x as u32).swap_bytes() as u64;
  let hi = ((x >> 32) as u32).swap_bytes() as u64;
  m.cpu.regs.set(i.rd(), (hi << 32) | lo);
  Ok(())
}

fn revb_d(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()).swap_bytes());
  Ok(())
}

fn revh_2w(m: &mut Machine, i: Instruction) -> R {
  let x = m.cpu.regs.get(i.rj());
  let v = ((x & 0x0000_ffff_0000_ffff) << 16) | ((x & 0xffff_0000_ffff_0000) >> 16);
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn revh_d(m: &mut Machine, i: Instruction) -> R {
  let x = m.cpu.regs.get(i.rj());
  let v = (x >> 48) | ((x >> 16) & 0xffff_0000) | ((x << 16) & 0xffff_0000_0000) | (x << 48);
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn bitrev_4b(m: &mut Machine, i: Instruction) -> R {
  let x = m.cpu.regs.get(i.rj()) as u32;
  let v = u32::from_le_bytes(x.to_le_bytes().map(|b| b.reverse_bits()));
  m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  Ok(())
}

fn bitrev_8b(m: &mut Machine, i: Instruction) -> R {
  let x = m.cpu.regs.get(i.rj());
  let v = u64::from_le_bytes(x.to_le_bytes().map(|b| b.reverse_bits()));
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn bitrev_w(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.get(i.rj()) as u32).reverse_bits();
  m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  Ok(())
}

fn bitrev_d(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), m.cpu.regs.get(i.rj()).reverse_bits());
  Ok(())
}

fn bstrins_w(m: &mut Machine, i: Instruction) -> R {
  let (msb, lsb) = (i.msbw(), i.lsbw());
  if msb >= lsb {
    let width = msb - lsb + 1;
    let mask = (((1u64 << width) - 1) as u32) << lsb;
    let src = m.cpu.regs.get(i.rj()) as u32;
    let dst = m.cpu.regs.get(i.rd()) as u32;
    let v = (dst & !mask) | ((src << lsb) & mask);
    m.cpu.regs.set(i.rd(), v as i32 as i64 as u64);
  }
  Ok(())
}

fn bstrpick_w(m: &mut Machine, i: Instruction) -> R {
  let (msb, lsb) = (i.msbw(), i.lsbw());
  let width = msb.wrapping_sub(lsb).wrapping_add(1);
  let mask = if width >= 32 { !0 } else { (1u32 << width) - 1 };
  let v = ((m.cpu.regs.get(i.rj()) as u32) >> lsb) & mask;
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn bstrins_d(m: &mut Machine, i: Instruction) -> R {
  let (msb, lsb) = (i.msbd(), i.lsbd());
  if msb >= lsb {
    let width = msb - lsb + 1;
    let mask = if width == 64 { !0 } else { ((1u64 << width) - 1) << lsb };
    let src = m.cpu.regs.get(i.rj());
    let dst = m.cpu.regs.get(i.rd());
    m.cpu.regs.set(i.rd(), (dst & !mask) | ((src << lsb) & mask));
  }
  Ok(())
}

fn bstrpick_d(m: &mut Machine, i: Instruction) -> R {
  let (msb, lsb) = (i.msbd(), i.lsbd());
  let width = msb.wrapping_sub(lsb).wrapping_add(1);
  let mask = if width >= 64 { !0 } else { (1u64 << width) - 1 };
  m.cpu.regs.set(i.rd(), (m.cpu.regs.get(i.rj()) >> lsb) & mask);
  Ok(())
}

// === Loads and stores ===

fn ld_b(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.memory.read::<i8>(addr)?;
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn ld_h(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.memory.read::<i16>(addr)?;
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn ld_w(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.memory.read::<i32>(addr)?;
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn ld_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.memory.read::<u64>(addr)?;
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn ld_bu(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.memory.read::<u8>(addr)?;
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn ld_hu(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.memory.read::<u16>(addr)?;
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn ld_wu(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.memory.read::<u32>(addr)?;
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn st_b(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  m.memory.write::<u8>(addr, m.cpu.regs.get(i.rd()) as u8)
}

fn st_h(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  m.memory.write::<u16>(addr, m.cpu.regs.get(i.rd()) as u16)
}

fn st_w(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  m.memory.write::<u32>(addr, m.cpu.regs.get(i.rd()) as u32)
}

fn st_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  m.memory.write::<u64>(addr, m.cpu.regs.get(i.rd()))
}

fn ldptr_w(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm14_sl2() as u64);
  let v = m.memory.read::<i32>(addr)?;
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn ldptr_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm14_sl2() as u64);
  let v = m.memory.read::<u64>(addr)?;
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn stptr_w(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm14_sl2() as u64);
  m.memory.write::<u32>(addr, m.cpu.regs.get(i.rd()) as u32)
}

fn stptr_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm14_sl2() as u64);
  m.memory.write::<u64>(addr, m.cpu.regs.get(i.rd()))
}

fn ldx_b(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  let v = m.memory.read::<i8>(addr)?;
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn ldx_h(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  let v = m.memory.read::<i16>(addr)?;
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn ldx_w(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  let v = m.memory.read::<i32>(addr)?;
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  Ok(())
}

fn ldx_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  let v = m.memory.read::<u64>(addr)?;
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn ldx_bu(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  let v = m.memory.read::<u8>(addr)?;
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn ldx_hu(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  let v = m.memory.read::<u16>(addr)?;
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn ldx_wu(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  let v = m.memory.read::<u32>(addr)?;
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn stx_b(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  m.memory.write::<u8>(addr, m.cpu.regs.get(i.rd()) as u8)
}

fn stx_h(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  m.memory.write::<u16>(addr, m.cpu.regs.get(i.rd()) as u16)
}

fn stx_w(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  m.memory.write::<u32>(addr, m.cpu.regs.get(i.rd()) as u32)
}

fn stx_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  m.memory.write::<u64>(addr, m.cpu.regs.get(i.rd()))
}

// === Float loads and stores ===

fn fld_s(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.memory.read::<u32>(addr)?;
  let vr = m.cpu.regs.vreg_mut(i.rd());
  vr.set_u64_lane(0, v as u64);
  vr.set_u64_lane(1, 0);
  Ok(())
}

fn fst_s(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.cpu.regs.vreg(i.rd()).u32_lane(0);
  m.memory.write::<u32>(addr, v)
}

fn fld_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.memory.read::<u64>(addr)?;
  let vr = m.cpu.regs.vreg_mut(i.rd());
  vr.set_u64_lane(0, v);
  vr.set_u64_lane(1, 0);
  Ok(())
}

fn fst_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm12() as u64);
  let v = m.cpu.regs.vreg(i.rd()).u64_lane(0);
  m.memory.write::<u64>(addr, v)
}

fn fldx_s(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  let v = m.memory.read::<u32>(addr)?;
  m.cpu.regs.vreg_mut(i.rd()).set_u64_lane(0, v as u64);
  Ok(())
}

fn fldx_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  let v = m.memory.read::<u64>(addr)?;
  m.cpu.regs.vreg_mut(i.rd()).set_u64_lane(0, v);
  Ok(())
}

fn fstx_s(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  m.memory.write::<u32>(addr, m.cpu.regs.vreg(i.rd()).u32_lane(0))
}

fn fstx_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(m.cpu.regs.get(i.rk()));
  m.memory.write::<u64>(addr, m.cpu.regs.vreg(i.rd()).u64_lane(0))
}

// === LL/SC and atomics ===

fn ll_w(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm14_sl2() as u64);
  let v = m.memory.read::<i32>(addr)?;
  m.cpu.regs.set(i.rd(), v as i64 as u64);
  m.cpu.ll_bit = true;
  Ok(())
}

fn ll_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm14_sl2() as u64);
  let v = m.memory.read::<u64>(addr)?;
  m.cpu.regs.set(i.rd(), v);
  m.cpu.ll_bit = true;
  Ok(())
}

fn sc_w(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm14_sl2() as u64);
  if m.cpu.ll_bit {
    m.memory.write::<u32>(addr, m.cpu.regs.get(i.rd()) as u32)?;
    m.cpu.regs.set(i.rd(), 1);
  } else {
    m.cpu.regs.set(i.rd(), 0);
  }
  m.cpu.ll_bit = false;
  Ok(())
}

fn sc_d(m: &mut Machine, i: Instruction) -> R {
  let addr = m.cpu.regs.get(i.rj()).wrapping_add(i.simm14_sl2() as u64);
  if m.cpu.ll_bit {
    m.memory.write::<u64>(addr, m.cpu.regs.get(i.rd()))?;
    m.cpu.regs.set(i.rd(), 1);
  } else {
    m.cpu.regs.set(i.rd(), 0);
  }
  m.cpu.ll_bit = false;
  Ok(())
}

fn am_w(m: &mut Machine, i: Instruction, op: fn(u32, u32) -> u32) -> R {
  let addr = m.cpu.regs.get(i.rj());
  let old = m.memory.read::<u32>(addr)?;
  let new = op(old, m.cpu.regs.get(i.rk()) as u32);
  m.memory.write::<u32>(addr, new)?;
  m.cpu.regs.set(i.rd(), old as i32 as i64 as u64);
  Ok(())
}

fn am_d(m: &mut Machine, i: Instruction, op: fn(u64, u64) -> u64) -> R {
  let addr = m.cpu.regs.get(i.rj());
  let old = m.memory.read::<u64>(addr)?;
  let new = op(old, m.cpu.regs.get(i.rk()));
  m.memory.write::<u64>(addr, new)?;
  m.cpu.regs.set(i.rd(), old);
  Ok(())
}

fn amswap_w(m: &mut Machine, i: Instruction) -> R {
  am_w(m, i, |_, rk| rk)
}

fn amswap_d(m: &mut Machine, i: Instruction) -> R {
  am_d(m, i, |_, rk| rk)
}

fn amadd_w(m: &mut Machine, i: Instruction) -> R {
  am_w(m, i, u32::wrapping_add)
}

fn amadd_d(m: &mut Machine, i: Instruction) -> R {
  am_d(m, i, u64::wrapping_add)
}

fn amand_w(m: &mut Machine, i: Instruction) -> R {
  am_w(m, i, |a, b| a & b)
}

fn amand_d(m: &mut Machine, i: Instruction) -> R {
  am_d(m, i, |a, b| a & b)
}

fn amor_w(m: &mut Machine, i: Instruction) -> R {
  am_w(m, i, |a, b| a | b)
}

fn amor_d(m: &mut Machine, i: Instruction) -> R {
  am_d(m, i, |a, b| a | b)
}

fn amxor_w(m: &mut Machine, i: Instruction) -> R {
  am_w(m, i, |a, b| a ^ b)
}

fn amxor_d(m: &mut Machine, i: Instruction) -> R {
  am_d(m, i, |a, b| a ^ b)
}

// === Branches and jumps ===

fn beqz(m: &mut Machine, i: Instruction) -> R {
  if m.cpu.regs.get(i.rj()) == 0 {
    let offset = (i.simm21() << 2).wrapping_sub(4);
    m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  }
  Ok(())
}

fn bnez(m: &mut Machine, i: Instruction) -> R {
  if m.cpu.regs.get(i.rj()) != 0 {
    let offset = (i.simm21() << 2).wrapping_sub(4);
    m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  }
  Ok(())
}

fn bceqz(m: &mut Machine, i: Instruction) -> R {
  let cj = i.rj() & 0x7;
  if m.cpu.regs.cf(cj) == 0 {
    let offset = (i.simm21() << 2).wrapping_sub(4);
    m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  }
  Ok(())
}

fn bcnez(m: &mut Machine, i: Instruction) -> R {
  let cj = i.rj() & 0x7;
  if m.cpu.regs.cf(cj) != 0 {
    let offset = (i.simm21() << 2).wrapping_sub(4);
    m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  }
  Ok(())
}

fn beq(m: &mut Machine, i: Instruction) -> R {
  if m.cpu.regs.get(i.rj()) == m.cpu.regs.get(i.rd()) {
    let offset = (i.simm16() << 2).wrapping_sub(4);
    m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  }
  Ok(())
}

fn bne(m: &mut Machine, i: Instruction) -> R {
  if m.cpu.regs.get(i.rj()) != m.cpu.regs.get(i.rd()) {
    let offset = (i.simm16() << 2).wrapping_sub(4);
    m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  }
  Ok(())
}

fn blt(m: &mut Machine, i: Instruction) -> R {
  if (m.cpu.regs.get(i.rj()) as i64) < (m.cpu.regs.get(i.rd()) as i64) {
    let offset = (i.simm16() << 2).wrapping_sub(4);
    m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  }
  Ok(())
}

fn bge(m: &mut Machine, i: Instruction) -> R {
  if (m.cpu.regs.get(i.rj()) as i64) >= (m.cpu.regs.get(i.rd()) as i64) {
    let offset = (i.simm16() << 2).wrapping_sub(4);
    m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  }
  Ok(())
}

fn bltu(m: &mut Machine, i: Instruction) -> R {
  if m.cpu.regs.get(i.rj()) < m.cpu.regs.get(i.rd()) {
    let offset = (i.simm16() << 2).wrapping_sub(4);
    m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  }
  Ok(())
}

fn bgeu(m: &mut Machine, i: Instruction) -> R {
  if m.cpu.regs.get(i.rj()) >= m.cpu.regs.get(i.rd()) {
    let offset = (i.simm16() << 2).wrapping_sub(4);
    m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  }
  Ok(())
}

fn b(m: &mut Machine, i: Instruction) -> R {
  let offset = (i.simm26() << 2).wrapping_sub(4);
  m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  Ok(())
}

fn bl(m: &mut Machine, i: Instruction) -> R {
  let link = m.cpu.regs.pc.wrapping_add(4);
  m.cpu.regs.set(REG_RA, link);
  let offset = (i.simm26() << 2).wrapping_sub(4);
  m.cpu.regs.pc = m.cpu.regs.pc.wrapping_add(offset as u64);
  Ok(())
}

fn jirl(m: &mut Machine, i: Instruction) -> R {
  let link = m.cpu.regs.pc.wrapping_add(4);
  let target = m
    .cpu
    .regs
    .get(i.rj())
    .wrapping_add((i.simm16() << 2) as u64);
  m.cpu.regs.set(i.rd(), link);
  m.cpu.regs.pc = target.wrapping_sub(4);
  Ok(())
}

// === Upper immediates and PC-relative ===

fn lu12i_w(m: &mut Machine, i: Instruction) -> R {
  m.cpu.regs.set(i.rd(), ((i.simm20() as i32) << 12) as i64 as u64);
  Ok(())
}

fn lu32i_d(m: &mut Machine, i: Instruction) -> R {
  let lower = m.cpu.regs.get(i.rd()) & 0xffff_ffff;
  let upper = ((i.simm20() as i32) as u32 as u64) << 32;
  m.cpu.regs.set(i.rd(), upper | lower);
  Ok(())
}

fn lu52i_d(m: &mut Machine, i: Instruction) -> R {
  let base = m.cpu.regs.get(i.rj()) & 0x000f_ffff_ffff_ffff;
  let upper = (i.imm12() as u64) << 52;
  m.cpu.regs.set(i.rd(), base | upper);
  Ok(())
}

fn pcaddi(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.pc.wrapping_add((i.simm20() << 2) as u64);
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn pcaddu12i(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.pc.wrapping_add((i.simm20() << 12) as u64);
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn pcalau12i(m: &mut Machine, i: Instruction) -> R {
  let v = (m.cpu.regs.pc & !0xfff).wrapping_add((i.simm20() << 12) as u64);
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn pcaddu18i(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.pc.wrapping_add((i.simm20() << 18) as u64);
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

// === Scalar floating point ===

fn fbin_s(m: &mut Machine, i: Instruction, op: fn(f32, f32) -> f32) -> R {
  let v = op(m.cpu.regs.vreg(i.rj()).f32(), m.cpu.regs.vreg(i.rk()).f32());
  m.cpu.regs.vreg_mut(i.rd()).set_f32(v);
  Ok(())
}

fn fbin_d(m: &mut Machine, i: Instruction, op: fn(f64, f64) -> f64) -> R {
  let v = op(m.cpu.regs.vreg(i.rj()).f64(), m.cpu.regs.vreg(i.rk()).f64());
  m.cpu.regs.vreg_mut(i.rd()).set_f64(v);
  Ok(())
}

fn fadd_s(m: &mut Machine, i: Instruction) -> R {
  fbin_s(m, i, |a, b| a + b)
}

fn fadd_d(m: &mut Machine, i: Instruction) -> R {
  fbin_d(m, i, |a, b| a + b)
}

fn fsub_s(m: &mut Machine, i: Instruction) -> R {
  fbin_s(m, i, |a, b| a - b)
}

fn fsub_d(m: &mut Machine, i: Instruction) -> R {
  fbin_d(m, i, |a, b| a - b)
}

fn fmul_s(m: &mut Machine, i: Instruction) -> R {
  fbin_s(m, i, |a, b| a * b)
}

fn fmul_d(m: &mut Machine, i: Instruction) -> R {
  fbin_d(m, i, |a, b| a * b)
}

fn fdiv_s(m: &mut Machine, i: Instruction) -> R {
  fbin_s(m, i, |a, b| a / b)
}

fn fdiv_d(m: &mut Machine, i: Instruction) -> R {
  fbin_d(m, i, |a, b| a / b)
}

fn fmax_s(m: &mut Machine, i: Instruction) -> R {
  fbin_s(m, i, f32::max)
}

fn fmax_d(m: &mut Machine, i: Instruction) -> R {
  fbin_d(m, i, f64::max)
}

fn fmin_s(m: &mut Machine, i: Instruction) -> R {
  fbin_s(m, i, f32::min)
}

fn fmin_d(m: &mut Machine, i: Instruction) -> R {
  fbin_d(m, i, f64::min)
}

fn fmadd_s(m: &mut Machine, i: Instruction) -> R {
  let v = m
    .cpu
    .regs
    .vreg(i.rj())
    .f32()
    .mul_add(m.cpu.regs.vreg(i.rk()).f32(), m.cpu.regs.vreg(i.ra()).f32());
  m.cpu.regs.vreg_mut(i.rd()).set_f32(v);
  Ok(())
}

fn fmadd_d(m: &mut Machine, i: Instruction) -> R {
  let v = m
    .cpu
    .regs
    .vreg(i.rj())
    .f64()
    .mul_add(m.cpu.regs.vreg(i.rk()).f64(), m.cpu.regs.vreg(i.ra()).f64());
  m.cpu.regs.vreg_mut(i.rd()).set_f64(v);
  Ok(())
}

fn fmsub_s(m: &mut Machine, i: Instruction) -> R {
  let v = m
    .cpu
    .regs
    .vreg(i.rj())
    .f32()
    .mul_add(m.cpu.regs.vreg(i.rk()).f32(), -m.cpu.regs.vreg(i.ra()).f32());
  m.cpu.regs.vreg_mut(i.rd()).set_f32(v);
  Ok(())
}

fn fmsub_d(m: &mut Machine, i: Instruction) -> R {
  let v = m
    .cpu
    .regs
    .vreg(i.rj())
    .f64()
    .mul_add(m.cpu.regs.vreg(i.rk()).f64(), -m.cpu.regs.vreg(i.ra()).f64());
  m.cpu.regs.vreg_mut(i.rd()).set_f64(v);
  Ok(())
}

fn fnmadd_d(m: &mut Machine, i: Instruction) -> R {
  let v = m
    .cpu
    .regs
    .vreg(i.rj())
    .f64()
    .mul_add(m.cpu.regs.vreg(i.rk()).f64(), m.cpu.regs.vreg(i.ra()).f64());
  m.cpu.regs.vreg_mut(i.rd()).set_f64(-v);
  Ok(())
}

fn fnmsub_d(m: &mut Machine, i: Instruction) -> R {
  let v = m
    .cpu
    .regs
    .vreg(i.rj())
    .f64()
    .mul_add(m.cpu.regs.vreg(i.rk()).f64(), -m.cpu.regs.vreg(i.ra()).f64());
  m.cpu.regs.vreg_mut(i.rd()).set_f64(-v);
  Ok(())
}

fn fabs_s(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).f32().abs();
  m.cpu.regs.vreg_mut(i.rd()).set_f32(v);
  Ok(())
}

fn fabs_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).f64().abs();
  m.cpu.regs.vreg_mut(i.rd()).set_f64(v);
  Ok(())
}

fn fneg_s(m: &mut Machine, i: Instruction) -> R {
  let v = -m.cpu.regs.vreg(i.rj()).f32();
  m.cpu.regs.vreg_mut(i.rd()).set_f32(v);
  Ok(())
}

fn fneg_d(m: &mut Machine, i: Instruction) -> R {
  let v = -m.cpu.regs.vreg(i.rj()).f64();
  m.cpu.regs.vreg_mut(i.rd()).set_f64(v);
  Ok(())
}

fn fsqrt_s(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).f32().sqrt();
  m.cpu.regs.vreg_mut(i.rd()).set_f32(v);
  Ok(())
}

fn fsqrt_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).f64().sqrt();
  m.cpu.regs.vreg_mut(i.rd()).set_f64(v);
  Ok(())
}

fn fmov_s(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).u32_lane(0);
  m.cpu.regs.vreg_mut(i.rd()).set_u32_lane(0, v);
  Ok(())
}

fn fmov_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).u64_lane(0);
  m.cpu.regs.vreg_mut(i.rd()).set_u64_lane(0, v);
  Ok(())
}

fn fcvt_s_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).f64() as f32;
  m.cpu.regs.vreg_mut(i.rd()).set_f32(v);
  Ok(())
}

fn fcvt_d_s(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).f32() as f64;
  m.cpu.regs.vreg_mut(i.rd()).set_f64(v);
  Ok(())
}

fn ffint_s_w(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).u32_lane(0) as i32 as f32;
  m.cpu.regs.vreg_mut(i.rd()).set_f32(v);
  Ok(())
}

fn ffint_s_l(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).u64_lane(0) as i64 as f32;
  m.cpu.regs.vreg_mut(i.rd()).set_f32(v);
  Ok(())
}

fn ffint_d_w(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).u32_lane(0) as i32 as f64;
  m.cpu.regs.vreg_mut(i.rd()).set_f64(v);
  Ok(())
}

fn ffint_d_l(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).u64_lane(0) as i64 as f64;
  m.cpu.regs.vreg_mut(i.rd()).set_f64(v);
  Ok(())
}

fn ftintrz_w_s(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).f32() as i32;
  m.cpu.regs.vreg_mut(i.rd()).set_u32_lane(0, v as u32);
  Ok(())
}

fn ftintrz_w_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).f64() as i32;
  m.cpu.regs.vreg_mut(i.rd()).set_u32_lane(0, v as u32);
  Ok(())
}

fn ftintrz_l_s(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).f32() as i64;
  m.cpu.regs.vreg_mut(i.rd()).set_u64_lane(0, v as u64);
  Ok(())
}

fn ftintrz_l_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).f64() as i64;
  m.cpu.regs.vreg_mut(i.rd()).set_u64_lane(0, v as u64);
  Ok(())
}

/// Shared fcmp condition evaluation. The signaling variants (odd cond
/// values) behave like their quiet twins here; trapping FP exceptions
/// are not modeled.
fn fcmp_cond(cond: u32, un: bool, eq: bool, lt: bool) -> bool {
  let gt = !un && !eq && !lt;
  match cond & 0x1e {
    0x00 => false,
    0x02 => lt,
    0x04 => eq,
    0x06 => lt || eq,
    0x08 => un,
    0x0a => lt || un,
    0x0c => eq || un,
    0x0e => lt || eq || un,
    0x10 => lt || gt,
    0x14 => !un,
    0x18 => un || lt || gt,
    _ => false,
  }
}

fn fcmp_s(m: &mut Machine, i: Instruction) -> R {
  let a = m.cpu.regs.vreg(i.rj()).f32();
  let b = m.cpu.regs.vreg(i.rk()).f32();
  let cond = (i.word() >> 15) & 0x1f;
  let cd = i.rd() & 0x7;
  let result = fcmp_cond(cond, a.is_nan() || b.is_nan(), a == b, a < b);
  m.cpu.regs.set_cf(cd, result);
  Ok(())
}

fn fcmp_d(m: &mut Machine, i: Instruction) -> R {
  let a = m.cpu.regs.vreg(i.rj()).f64();
  let b = m.cpu.regs.vreg(i.rk()).f64();
  let cond = (i.word() >> 15) & 0x1f;
  let cd = i.rd() & 0x7;
  let result = fcmp_cond(cond, a.is_nan() || b.is_nan(), a == b, a < b);
  m.cpu.regs.set_cf(cd, result);
  Ok(())
}

fn fsel(m: &mut Machine, i: Instruction) -> R {
  let ca = (i.word() >> 15) & 0x7;
  let v = if m.cpu.regs.cf(ca) != 0 {
    m.cpu.regs.vreg(i.rk()).u64_lane(0)
  } else {
    m.cpu.regs.vreg(i.rj()).u64_lane(0)
  };
  m.cpu.regs.vreg_mut(i.rd()).set_u64_lane(0, v);
  Ok(())
}

// === Transfers between register files ===

fn movgr2fr_w(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) as u32;
  m.cpu.regs.vreg_mut(i.rd()).set_u32_lane(0, v);
  Ok(())
}

fn movgr2fr_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj());
  m.cpu.regs.vreg_mut(i.rd()).set_u64_lane(0, v);
  Ok(())
}

fn movfr2gr_s(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).u32_lane(0) as i32 as i64;
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn movfr2gr_d(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).u64_lane(0);
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

fn movgr2fcsr(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) as u32;
  m.cpu.regs.set_fcsr(v);
  Ok(())
}

fn movfcsr2gr(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.fcsr();
  m.cpu.regs.set(i.rd(), v as u64);
  Ok(())
}

fn movfr2cf(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.vreg(i.rj()).u64_lane(0) & 1;
  m.cpu.regs.set_cf(i.rd() & 0x7, v != 0);
  Ok(())
}

fn movcf2fr(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.cf(i.rj() & 0x7) as u64;
  m.cpu.regs.vreg_mut(i.rd()).set_u64_lane(0, v);
  Ok(())
}

fn movgr2cf(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.get(i.rj()) & 1;
  m.cpu.regs.set_cf(i.rd() & 0x7, v != 0);
  Ok(())
}

fn movcf2gr(m: &mut Machine, i: Instruction) -> R {
  let v = m.cpu.regs.cf(i.rj() & 0x7) as u64;
  m.cpu.regs.set(i.rd(), v);
  Ok(())
}

// === System ===

fn syscall(m: &mut Machine, _i: Instruction) -> R {
  let nr = m.cpu.regs.get(REG_A7);
  m.system_call(nr)
}

fn break_(m: &mut Machine, i: Instruction) -> R {
  Err(MachineError::UnimplementedInstruction(
    m.cpu.regs.pc,
    i.word(),
  ))
}

fn nop(_m: &mut Machine, _i: Instruction) -> R {
  Ok(())
}

fn dbar(_m: &mut Machine, _i: Instruction) -> R {
  // Memory barrier: a no-op under the single linear program order.
  Ok(())
}

fn ibar(_m: &mut Machine, _i: Instruction) -> R {
  Ok(())
}

fn rdtime_d(m: &mut Machine, i: Instruction) -> R {
  let time = m.rdtime();
  m.cpu.regs.set(i.rd(), time);
  // The counter id read alongside; this machine has a single counter 0.
  m.cpu.regs.set(i.rj(), 0);
  Ok(())
}

pub fn invalid(m: &mut Machine, i: Instruction) -> R {
  Err(MachineError::IllegalOpcode(m.cpu.regs.pc, i.word()))
}

pub fn unimplemented(m: &mut Machine, i: Instruction) -> R {
  Err(MachineError::UnimplementedInstruction(
    m.cpu.regs.pc,
    i.word(),
  ))
}

// === Decode ===

/// Map a 32-bit instruction word to its generic handler.
///
/// The decode order follows the encoding structure: exact system matches
/// first, then the primary 6-bit opcode selects a bucket which narrows by
/// progressively longer prefixes. Unknown words fall through to the
/// illegal / unimplemented handlers.
pub fn decode(instr: Instruction) -> Handler {
  let word = instr.word();

  if opcode::op17(word) == opcode::SYSCALL {
    return syscall;
  }
  if opcode::op17(word) == opcode::BREAK {
    return break_;
  }
  if word == 0 {
    return invalid;
  }

  match opcode::op6(word) {
    0x00 => decode_op0(word),
    0x02 => decode_fused(word),
    0x03 => decode_fcmp(word),
    0x05 => match word & 0xfe00_0000 {
      opcode::LU12I_W => lu12i_w,
      opcode::LU32I_D => lu32i_d,
      _ => invalid,
    },
    0x06 => match word & 0xfe00_0000 {
      opcode::PCADDI => pcaddi,
      opcode::PCALAU12I => pcalau12i,
      _ => invalid,
    },
    0x07 => match word & 0xfe00_0000 {
      opcode::PCADDU12I => pcaddu12i,
      opcode::PCADDU18I => pcaddu18i,
      _ => invalid,
    },
    0x08 => match word & 0xff00_0000 {
      opcode::LL_W => ll_w,
      opcode::SC_W => sc_w,
      opcode::LL_D => ll_d,
      opcode::SC_D => sc_d,
      _ => invalid,
    },
    0x09 => match word & 0xff00_0000 {
      opcode::LDPTR_W => ldptr_w,
      opcode::STPTR_W => stptr_w,
      opcode::LDPTR_D => ldptr_d,
      opcode::STPTR_D => stptr_d,
      _ => invalid,
    },
    0x0a => match opcode::op22(word) {
      opcode::LD_B => ld_b,
      opcode::LD_H => ld_h,
      opcode::LD_W => ld_w,
      opcode::LD_D => ld_d,
      opcode::ST_B => st_b,
      opcode::ST_H => st_h,
      opcode::ST_W => st_w,
      opcode::ST_D => st_d,
      opcode::LD_BU => ld_bu,
      opcode::LD_HU => ld_hu,
      opcode::LD_WU => ld_wu,
      opcode::FLD_S => fld_s,
      opcode::FST_S => fst_s,
      opcode::FLD_D => fld_d,
      opcode::FST_D => fst_d,
      _ => invalid,
    },
    // LSX/LASX vector loads; the vector operation set is not emulated.
    0x0b => unimplemented,
    0x0e => decode_indexed(word),
    0x10 => beqz,
    0x11 => bnez,
    0x12 => {
      if word & 0x300 == 0x000 {
        bceqz
      } else if word & 0x300 == 0x100 {
        bcnez
      } else {
        invalid
      }
    }
    0x13 => jirl,
    0x14 => b,
    0x15 => bl,
    0x16 => beq,
    0x17 => bne,
    0x18 => blt,
    0x19 => bge,
    0x1a => bltu,
    0x1b => bgeu,
    // LSX / LASX operations
    0x1c | 0x1d => unimplemented,
    _ => invalid,
  }
}

fn decode_op0(word: u32) -> Handler {
  // BYTEPICK.D and ALSL use bits [31:18] with a shift amount in between.
  match word & 0xfffc_0000 {
    opcode::ALSL_W => return alsl_w,
    opcode::ALSL_D => return alsl_d,
    opcode::BYTEPICK_D => return bytepick_d,
    _ => {}
  }

  match opcode::op17(word) {
    opcode::ADD_W => return add_w,
    opcode::ADD_D => return add_d,
    opcode::SUB_W => return sub_w,
    opcode::SUB_D => return sub_d,
    opcode::SLT => return slt,
    opcode::SLTU => return sltu,
    opcode::MASKEQZ => return maskeqz,
    opcode::MASKNEZ => return masknez,
    opcode::NOR => return nor,
    opcode::AND => return and,
    opcode::OR => return or,
    opcode::XOR => return xor,
    opcode::ORN => return orn,
    opcode::ANDN => return andn,
    opcode::SLL_W => return sll_w,
    opcode::SRL_W => return srl_w,
    opcode::SRA_W => return sra_w,
    opcode::SLL_D => return sll_d,
    opcode::SRL_D => return srl_d,
    opcode::SRA_D => return sra_d,
    opcode::ROTR_W => return rotr_w,
    opcode::ROTR_D => return rotr_d,
    opcode::MUL_W => return mul_w,
    opcode::MULH_W => return mulh_w,
    opcode::MULH_WU => return mulh_wu,
    opcode::MUL_D => return mul_d,
    opcode::MULH_D => return mulh_d,
    opcode::MULH_DU => return mulh_du,
    opcode::DIV_W => return div_w,
    opcode::MOD_W => return mod_w,
    opcode::DIV_WU => return div_wu,
    opcode::MOD_WU => return mod_wu,
    opcode::DIV_D => return div_d,
    opcode::MOD_D => return mod_d,
    opcode::DIV_DU => return div_du,
    opcode::MOD_DU => return mod_du,
    opcode::FADD_S => return fadd_s,
    opcode::FADD_D => return fadd_d,
    opcode::FSUB_S => return fsub_s,
    opcode::FSUB_D => return fsub_d,
    opcode::FMUL_S => return fmul_s,
    opcode::FMUL_D => return fmul_d,
    opcode::FDIV_S => return fdiv_s,
    opcode::FDIV_D => return fdiv_d,
    opcode::FMAX_S => return fmax_s,
    opcode::FMAX_D => return fmax_d,
    opcode::FMIN_S => return fmin_s,
    opcode::FMIN_D => return fmin_d,
    _ => {}
  }

  match opcode::op16(word) {
    opcode::OP16_SLLI_W if word & 0x8000 != 0 => return slli_w,
    opcode::OP16_SLLI_D => return slli_d,
    opcode::OP16_SRLI_W if word & 0x8000 != 0 => return srli_w,
    opcode::OP16_SRLI_D => return srli_d,
    opcode::OP16_SRAI_W if word & 0x8000 != 0 => return srai_w,
    opcode::OP16_SRAI_D => return srai_d,
    opcode::OP16_ROTRI_W if word & 0x8000 != 0 => return rotri_w,
    opcode::OP16_ROTRI_D => return rotri_d,
    _ => {}
  }

  match opcode::op22(word) {
    opcode::SLTI => return slti,
    opcode::SLTUI => return sltui,
    opcode::ADDI_W => return addi_w,
    opcode::ADDI_D => return addi_d,
    opcode::LU52I_D => return lu52i_d,
    opcode::ANDI => return andi,
    opcode::ORI => return ori,
    opcode::XORI => return xori,
    _ => {}
  }

  match opcode::op2r(word) {
    opcode::OP22_CLO_W => return clo_w,
    opcode::OP22_CLZ_W => return clz_w,
    opcode::OP22_CTO_W => return cto_w,
    opcode::OP22_CTZ_W => return ctz_w,
    opcode::OP22_CLO_D => return clo_d,
    opcode::OP22_CLZ_D => return clz_d,
    opcode::OP22_CTO_D => return cto_d,
    opcode::OP22_CTZ_D => return ctz_d,
    opcode::OP22_REVB_2H => return revb_2h,
    opcode::OP22_REVB_4H => return revb_4h,
    opcode::OP22_REVB_2W => return revb_2w,
    opcode::OP22_REVB_D => return revb_d,
    opcode::OP22_REVH_2W => return revh_2w,
    opcode::OP22_REVH_D => return revh_d,
    opcode::OP22_BITREV_4B => return bitrev_4b,
    opcode::OP22_BITREV_8B => return bitrev_8b,
    opcode::OP22_BITREV_W => return bitrev_w,
    opcode::OP22_BITREV_D => return bitrev_d,
    opcode::OP22_EXT_W_H => return ext_w_h,
    opcode::OP22_EXT_W_B => return ext_w_b,
    opcode::OP22_RDTIME_D => return rdtime_d,
    opcode::OP22_FABS_S => return fabs_s,
    opcode::OP22_FABS_D => return fabs_d,
    opcode::OP22_FNEG_S => return fneg_s,
    opcode::OP22_FNEG_D => return fneg_d,
    opcode::OP22_FSQRT_S => return fsqrt_s,
    opcode::OP22_FSQRT_D => return fsqrt_d,
    opcode::OP22_FMOV_S => return fmov_s,
    opcode::OP22_FMOV_D => return fmov_d,
    opcode::OP22_MOVGR2FR_W => return movgr2fr_w,
    opcode::OP22_MOVGR2FR_D => return movgr2fr_d,
    opcode::OP22_MOVFR2GR_S => return movfr2gr_s,
    opcode::OP22_MOVFR2GR_D => return movfr2gr_d,
    opcode::OP22_MOVGR2FCSR => return movgr2fcsr,
    opcode::OP22_MOVFCSR2GR => return movfcsr2gr,
    opcode::OP22_MOVFR2CF => return movfr2cf,
    opcode::OP22_MOVCF2FR => return movcf2fr,
    opcode::OP22_MOVGR2CF => return movgr2cf,
    opcode::OP22_MOVCF2GR => return movcf2gr,
    opcode::OP22_FCVT_S_D => return fcvt_s_d,
    opcode::OP22_FCVT_D_S => return fcvt_d_s,
    opcode::OP22_FTINTRZ_W_S => return ftintrz_w_s,
    opcode::OP22_FTINTRZ_W_D => return ftintrz_w_d,
    opcode::OP22_FTINTRZ_L_S => return ftintrz_l_s,
    opcode::OP22_FTINTRZ_L_D => return ftintrz_l_d,
    opcode::OP22_FFINT_S_W => return ffint_s_w,
    opcode::OP22_FFINT_S_L => return ffint_s_l,
    opcode::OP22_FFINT_D_W => return ffint_d_w,
    opcode::OP22_FFINT_D_L => return ffint_d_l,
    _ => {}
  }

  match (word >> 22) & 0x3ff {
    opcode::OP10_BSTRINS_D => return bstrins_d,
    opcode::OP10_BSTRPICK_D => return bstrpick_d,
    _ => {}
  }
  if (word >> 21) & 0x7ff == opcode::OP11_BSTR_W {
    return if word & 0x8000 != 0 {
      bstrpick_w
    } else {
      bstrins_w
    };
  }

  invalid
}

fn decode_fused(word: u32) -> Handler {
  match (word >> 20) & 0xfff {
    opcode::OP12_FMADD_S => fmadd_s,
    opcode::OP12_FMADD_D => fmadd_d,
    opcode::OP12_FMSUB_S => fmsub_s,
    opcode::OP12_FMSUB_D => fmsub_d,
    opcode::OP12_FNMADD_D => fnmadd_d,
    opcode::OP12_FNMSUB_D => fnmsub_d,
    // Vector fused forms
    _ => unimplemented,
  }
}

fn decode_fcmp(word: u32) -> Handler {
  match (word >> 20) & 0xfff {
    opcode::OP12_FCMP_S => fcmp_s,
    opcode::OP12_FCMP_D => fcmp_d,
    _ => {
      if (word >> 18) & 0x3fff == opcode::OP14_FSEL {
        fsel
      } else {
        invalid
      }
    }
  }
}

fn decode_indexed(word: u32) -> Handler {
  match opcode::op17(word) {
    opcode::DBAR => return dbar,
    opcode::IBAR => return ibar,
    opcode::LDX_B => return ldx_b,
    opcode::LDX_H => return ldx_h,
    opcode::LDX_W => return ldx_w,
    opcode::LDX_D => return ldx_d,
    opcode::LDX_BU => return ldx_bu,
    opcode::LDX_HU => return ldx_hu,
    opcode::LDX_WU => return ldx_wu,
    _ => {}
  }

  match word & 0xfffc_0000 {
    opcode::STX_B => return stx_b,
    opcode::STX_H => return stx_h,
    opcode::STX_W => return stx_w,
    opcode::STX_D => return stx_d,
    opcode::FLDX_S => return fldx_s,
    opcode::FLDX_D => return fldx_d,
    opcode::FSTX_S => return fstx_s,
    opcode::FSTX_D => return fstx_d,
    _ => {}
  }

  // Atomic read-modify-writes: bits [19:16] pick operation and ordering,
  // bit 15 picks word/double. The _db ordering variants start at 9.
  if word & 0xfff0_0000 == opcode::AM_BASE {
    let op_sel = (word >> 16) & 0xf;
    let is_double = word & 0x8000 != 0;
    let op = match op_sel {
      0 | 9 => 0,
      1 | 10 => 1,
      2 | 11 => 2,
      3 | 12 => 3,
      4 | 13 => 4,
      _ => return unimplemented,
    };
    return match (op, is_double) {
      (0, false) => amswap_w,
      (0, true) => amswap_d,
      (1, false) => amadd_w,
      (1, true) => amadd_d,
      (2, false) => amand_w,
      (2, true) => amand_d,
      (3, false) => amor_w,
      (3, true) => amor_d,
      (4, false) => amxor_w,
      (4, true) => amxor_d,
      _ => unimplemented,
    };
  }

  if word & 0xfff0_0000 == opcode::AMXOR_BASE {
    // Remaining am* forms (max/min and their orderings)
    return unimplemented;
  }

  unimplemented
}
