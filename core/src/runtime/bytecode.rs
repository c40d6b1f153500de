use strum_macros::{EnumIter, IntoStaticStr};

use crate::runtime::instruction::Instruction;
use crate::runtime::opcode;

/// Specialized bytecodes for the dispatch loop.
///
/// The decoder assigns the generic `Function` / `FuncBlock` / `Syscall`
/// values; the rewriter refines records whose instruction dominates real
/// workloads into one of the specialized values, with the operand fields
/// pre-extracted into the record's `instr` word (see the `pack_*`
/// helpers). Everything else stays on the generic path through the
/// interned handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, IntoStaticStr)]
#[repr(u8)]
pub enum Bytecode {
  Invalid = 0,

  // Loads and stores, 12-bit immediate
  LdB,
  LdH,
  LdW,
  LdD,
  LdBu,
  LdHu,
  LdWu,
  StB,
  StH,
  StW,
  StD,
  // 14-bit scaled immediate
  LdptrW,
  LdptrD,
  StptrW,
  StptrD,
  // Register-indexed
  LdxW,
  LdxD,
  LdxBu,
  StxW,
  StxD,

  // ALU, register-register
  AddW,
  AddD,
  SubW,
  SubD,
  And,
  Or,
  Xor,
  Nor,
  Slt,
  Sltu,
  Maskeqz,
  Masknez,
  MulD,
  AlslD,
  ExtWB,
  SllW,
  SllD,
  SrlD,
  SraD,

  // ALU, immediate
  AddiW,
  AddiD,
  Andi,
  Ori,
  Xori,
  Slti,
  Sltui,
  SlliW,
  SlliD,
  SrliW,
  SrliD,
  SraiW,
  SraiD,

  // Bit fields and upper immediates
  BstrpickW,
  BstrpickD,
  BstrinsD,
  Lu12iW,
  Lu32iD,

  // Block terminators (specialized but still diverging)
  Pcaddi,
  Pcalau12i,
  Pcaddu12i,
  Beqz,
  Bnez,
  Beq,
  Bne,
  Blt,
  Bge,
  Bltu,
  Bgeu,
  B,
  Bl,
  Jirl,

  // Generic paths
  Function,
  FuncBlock,
  Syscall,
  /// Syscall with the number carried in the record itself; installed by
  /// decoder-cache patching, returns through RA.
  SyscallImm,
  Stop,
}

impl Bytecode {
  pub fn name(self) -> &'static str {
    self.into()
  }
}

/// Packed register-immediate layout: rd, rj and a sign-extended-once
/// 16-bit immediate slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegImm {
  pub rd: u32,
  pub rj: u32,
  pub imm: i16,
}

impl RegImm {
  #[inline]
  pub fn from_packed(packed: u32) -> Self {
    Self {
      rd: packed & 0xff,
      rj: (packed >> 8) & 0xff,
      imm: (packed >> 16) as u16 as i16,
    }
  }

  /// The immediate slot reinterpreted unsigned (ANDI/ORI/XORI).
  #[inline]
  pub fn uimm(self) -> u64 {
    self.imm as u16 as u64
  }
}

#[inline]
fn pack_ri(rd: u32, rj: u32, imm: i16) -> u32 {
  rd | (rj << 8) | ((imm as u16 as u32) << 16)
}

/// Packed three-register layout; the fourth byte carries small extras
/// (ALSL shift amount, shift amounts, bit positions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegReg {
  pub rd: u32,
  pub rj: u32,
  pub rk: u32,
  pub sa: u32,
}

impl RegReg {
  #[inline]
  pub fn from_packed(packed: u32) -> Self {
    Self {
      rd: packed & 0xff,
      rj: (packed >> 8) & 0xff,
      rk: (packed >> 16) & 0xff,
      sa: (packed >> 24) & 0xff,
    }
  }
}

#[inline]
fn pack_rr(rd: u32, rj: u32, rk: u32, sa: u32) -> u32 {
  rd | (rj << 8) | (rk << 16) | (sa << 24)
}

/// Packed 20-bit-upper-immediate layout: rd in the low byte, the signed
/// immediate in the upper 24 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegUpper {
  pub rd: u32,
  pub imm: i32,
}

impl RegUpper {
  #[inline]
  pub fn from_packed(packed: u32) -> Self {
    Self {
      rd: packed & 0xff,
      imm: (packed as i32) >> 8,
    }
  }
}

#[inline]
fn pack_upper(rd: u32, simm20: i64) -> u32 {
  (rd & 0xff) | (((simm20 as i32) << 8) as u32)
}

impl Bytecode {
  /// The rewriter's classification table: map an instruction word to its
  /// specialized bytecode and packed operand layout, or `None` for
  /// instructions that stay generic. Immediates are sign-extended (and
  /// LDPTR/STPTR offsets pre-scaled) here, once, so the dispatch arm does
  /// a plain field read.
  pub fn specialize(word: u32) -> Option<(Bytecode, u32)> {
    let i = Instruction(word);

    let ri = || pack_ri(i.rd(), i.rj(), i.simm12() as i16);
    let ri_ptr = || pack_ri(i.rd(), i.rj(), i.simm14_sl2() as i16);
    let rr = || pack_rr(i.rd(), i.rj(), i.rk(), 0);

    match opcode::op22(word) {
      opcode::LD_B => return Some((Bytecode::LdB, ri())),
      opcode::LD_H => return Some((Bytecode::LdH, ri())),
      opcode::LD_W => return Some((Bytecode::LdW, ri())),
      opcode::LD_D => return Some((Bytecode::LdD, ri())),
      opcode::LD_BU => return Some((Bytecode::LdBu, ri())),
      opcode::LD_HU => return Some((Bytecode::LdHu, ri())),
      opcode::LD_WU => return Some((Bytecode::LdWu, ri())),
      opcode::ST_B => return Some((Bytecode::StB, ri())),
      opcode::ST_H => return Some((Bytecode::StH, ri())),
      opcode::ST_W => return Some((Bytecode::StW, ri())),
      opcode::ST_D => return Some((Bytecode::StD, ri())),
      opcode::ADDI_W => return Some((Bytecode::AddiW, ri())),
      opcode::ADDI_D => return Some((Bytecode::AddiD, ri())),
      opcode::SLTI => return Some((Bytecode::Slti, ri())),
      opcode::SLTUI => return Some((Bytecode::Sltui, ri())),
      opcode::ANDI => return Some((Bytecode::Andi, pack_ri(i.rd(), i.rj(), i.imm12() as i16))),
      opcode::ORI => return Some((Bytecode::Ori, pack_ri(i.rd(), i.rj(), i.imm12() as i16))),
      opcode::XORI => return Some((Bytecode::Xori, pack_ri(i.rd(), i.rj(), i.imm12() as i16))),
      _ => {}
    }

    match word & 0xff00_0000 {
      opcode::LDPTR_W => return Some((Bytecode::LdptrW, ri_ptr())),
      opcode::LDPTR_D => return Some((Bytecode::LdptrD, ri_ptr())),
      opcode::STPTR_W => return Some((Bytecode::StptrW, ri_ptr())),
      opcode::STPTR_D => return Some((Bytecode::StptrD, ri_ptr())),
      _ => {}
    }

    match opcode::op17(word) {
      opcode::ADD_W => return Some((Bytecode::AddW, rr())),
      opcode::ADD_D => return Some((Bytecode::AddD, rr())),
      opcode::SUB_W => return Some((Bytecode::SubW, rr())),
      opcode::SUB_D => return Some((Bytecode::SubD, rr())),
      opcode::AND => return Some((Bytecode::And, rr())),
      opcode::OR => return Some((Bytecode::Or, rr())),
      opcode::XOR => return Some((Bytecode::Xor, rr())),
      opcode::NOR => return Some((Bytecode::Nor, rr())),
      opcode::SLT => return Some((Bytecode::Slt, rr())),
      opcode::SLTU => return Some((Bytecode::Sltu, rr())),
      opcode::MASKEQZ => return Some((Bytecode::Maskeqz, rr())),
      opcode::MASKNEZ => return Some((Bytecode::Masknez, rr())),
      opcode::MUL_D => return Some((Bytecode::MulD, rr())),
      opcode::SLL_W => return Some((Bytecode::SllW, rr())),
      opcode::SLL_D => return Some((Bytecode::SllD, rr())),
      opcode::SRL_D => return Some((Bytecode::SrlD, rr())),
      opcode::SRA_D => return Some((Bytecode::SraD, rr())),
      opcode::LDX_W => return Some((Bytecode::LdxW, rr())),
      opcode::LDX_D => return Some((Bytecode::LdxD, rr())),
      opcode::LDX_BU => return Some((Bytecode::LdxBu, rr())),
      _ => {}
    }

    match word & 0xfffc_0000 {
      opcode::STX_W => return Some((Bytecode::StxW, rr())),
      opcode::STX_D => return Some((Bytecode::StxD, rr())),
      opcode::ALSL_D => {
        return Some((Bytecode::AlslD, pack_rr(i.rd(), i.rj(), i.rk(), i.sa2())))
      }
      _ => {}
    }

    match opcode::op16(word) {
      opcode::OP16_SLLI_W if word & 0x8000 != 0 => {
        return Some((Bytecode::SlliW, pack_rr(i.rd(), i.rj(), i.ui5(), 0)))
      }
      opcode::OP16_SRLI_W if word & 0x8000 != 0 => {
        return Some((Bytecode::SrliW, pack_rr(i.rd(), i.rj(), i.ui5(), 0)))
      }
      opcode::OP16_SRAI_W if word & 0x8000 != 0 => {
        return Some((Bytecode::SraiW, pack_rr(i.rd(), i.rj(), i.ui5(), 0)))
      }
      opcode::OP16_SLLI_D => {
        return Some((Bytecode::SlliD, pack_rr(i.rd(), i.rj(), i.ui6(), 0)))
      }
      opcode::OP16_SRLI_D => {
        return Some((Bytecode::SrliD, pack_rr(i.rd(), i.rj(), i.ui6(), 0)))
      }
      opcode::OP16_SRAI_D => {
        return Some((Bytecode::SraiD, pack_rr(i.rd(), i.rj(), i.ui6(), 0)))
      }
      _ => {}
    }

    if opcode::op2r(word) == opcode::OP22_EXT_W_B {
      return Some((Bytecode::ExtWB, pack_rr(i.rd(), i.rj(), 0, 0)));
    }

    if (word >> 22) & 0x3ff == opcode::OP10_BSTRPICK_D {
      return Some((
        Bytecode::BstrpickD,
        pack_rr(i.rd(), i.rj(), i.lsbd(), i.msbd()),
      ));
    }
    if (word >> 22) & 0x3ff == opcode::OP10_BSTRINS_D {
      return Some((
        Bytecode::BstrinsD,
        pack_rr(i.rd(), i.rj(), i.lsbd(), i.msbd()),
      ));
    }
    if (word >> 21) & 0x7ff == opcode::OP11_BSTR_W && word & 0x8000 != 0 {
      return Some((
        Bytecode::BstrpickW,
        pack_rr(i.rd(), i.rj(), i.lsbw(), i.msbw()),
      ));
    }

    match word & 0xfe00_0000 {
      opcode::LU12I_W => return Some((Bytecode::Lu12iW, pack_upper(i.rd(), i.simm20()))),
      opcode::LU32I_D => return Some((Bytecode::Lu32iD, pack_upper(i.rd(), i.simm20()))),
      // PC-relative adds keep their raw bits; they are terminators and
      // the handler needs the untouched ri20 fields.
      opcode::PCADDI => return Some((Bytecode::Pcaddi, word)),
      opcode::PCALAU12I => return Some((Bytecode::Pcalau12i, word)),
      opcode::PCADDU12I => return Some((Bytecode::Pcaddu12i, word)),
      _ => {}
    }

    // Branches keep raw bits as well: their split offsets do not fit a
    // packed i16 slot.
    let branch = match opcode::op6(word) {
      opcode::OP6_BEQZ => Bytecode::Beqz,
      opcode::OP6_BNEZ => Bytecode::Bnez,
      opcode::OP6_JIRL => Bytecode::Jirl,
      opcode::OP6_B => Bytecode::B,
      opcode::OP6_BL => Bytecode::Bl,
      opcode::OP6_BEQ => Bytecode::Beq,
      opcode::OP6_BNE => Bytecode::Bne,
      opcode::OP6_BLT => Bytecode::Blt,
      opcode::OP6_BGE => Bytecode::Bge,
      opcode::OP6_BLTU => Bytecode::Bltu,
      opcode::OP6_BGEU => Bytecode::Bgeu,
      _ => return None,
    };
    Some((branch, word))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::utils::asm;
  use strum::IntoEnumIterator;

  #[test]
  fn bytecodes_fit_a_byte() {
    assert!(Bytecode::iter().count() <= 256);
  }

  #[test]
  fn packed_ri_round_trip() {
    let packed = pack_ri(4, 31, -16);
    let ri = RegImm::from_packed(packed);
    assert_eq!(4, ri.rd);
    assert_eq!(31, ri.rj);
    assert_eq!(-16, ri.imm);
  }

  #[test]
  fn packed_upper_round_trip() {
    let up = RegUpper::from_packed(pack_upper(7, -0x80000));
    assert_eq!(7, up.rd);
    assert_eq!(-0x80000, up.imm);
    let up = RegUpper::from_packed(pack_upper(31, 0x7ffff));
    assert_eq!(31, up.rd);
    assert_eq!(0x7ffff, up.imm);
  }

  #[test]
  fn specialize_extracts_load_fields() {
    let (bc, packed) = Bytecode::specialize(asm::ld_d(4, 3, -24)).unwrap();
    assert_eq!(Bytecode::LdD, bc);
    let ri = RegImm::from_packed(packed);
    assert_eq!((4, 3, -24), (ri.rd, ri.rj, ri.imm as i64));
  }

  #[test]
  fn specialize_prescales_ldptr_offsets() {
    let (bc, packed) = Bytecode::specialize(asm::ldptr_d(5, 6, 16)).unwrap();
    assert_eq!(Bytecode::LdptrD, bc);
    let ri = RegImm::from_packed(packed);
    // The 14-bit field is scaled by 4 at rewrite time.
    assert_eq!(16, ri.imm);
  }

  #[test]
  fn specialize_keeps_branch_bits_raw() {
    let word = asm::beq(4, 5, -16);
    let (bc, packed) = Bytecode::specialize(word).unwrap();
    assert_eq!(Bytecode::Beq, bc);
    assert_eq!(word, packed);
  }

  #[test]
  fn andi_immediate_is_zero_extended() {
    let (bc, packed) = Bytecode::specialize(asm::andi(4, 4, 0xfff)).unwrap();
    assert_eq!(Bytecode::Andi, bc);
    assert_eq!(0xfff, RegImm::from_packed(packed).uimm());
  }

  #[test]
  fn unknown_instructions_stay_generic() {
    assert!(Bytecode::specialize(asm::dbar()).is_none());
    assert!(Bytecode::specialize(asm::syscall()).is_none());
  }
}
