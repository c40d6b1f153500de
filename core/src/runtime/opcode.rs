//! LA64 opcode constants, grouped by the bit width that identifies them.
//!
//! Decoding proceeds from the primary 6-bit opcode (bits [31:26]) into
//! progressively longer fixed prefixes: op17 (bits [31:15]) for 3R forms,
//! op22 (bits [31:22]) for the 12-bit-immediate forms, op16 (bits [31:16])
//! for shift-immediates, and full bits [31:10] for 2R forms.

// 3R-type (op17 = word & 0xFFFF8000)
pub const ADD_W: u32 = 0x0010_0000;
pub const ADD_D: u32 = 0x0010_8000;
pub const SUB_W: u32 = 0x0011_0000;
pub const SUB_D: u32 = 0x0011_8000;
pub const SLT: u32 = 0x0012_0000;
pub const SLTU: u32 = 0x0012_8000;
pub const MASKEQZ: u32 = 0x0013_0000;
pub const MASKNEZ: u32 = 0x0013_8000;
pub const NOR: u32 = 0x0014_0000;
pub const AND: u32 = 0x0014_8000;
pub const OR: u32 = 0x0015_0000;
pub const XOR: u32 = 0x0015_8000;
pub const ORN: u32 = 0x0016_0000;
pub const ANDN: u32 = 0x0016_8000;
pub const SLL_W: u32 = 0x0017_0000;
pub const SRL_W: u32 = 0x0017_8000;
pub const SRA_W: u32 = 0x0018_0000;
pub const SLL_D: u32 = 0x0018_8000;
pub const SRL_D: u32 = 0x0019_0000;
pub const SRA_D: u32 = 0x0019_8000;
pub const ROTR_W: u32 = 0x001b_0000;
pub const ROTR_D: u32 = 0x001b_8000;
pub const MUL_W: u32 = 0x001c_0000;
pub const MULH_W: u32 = 0x001c_8000;
pub const MULH_WU: u32 = 0x001d_0000;
pub const MUL_D: u32 = 0x001d_8000;
pub const MULH_D: u32 = 0x001e_0000;
pub const MULH_DU: u32 = 0x001e_8000;
pub const DIV_W: u32 = 0x0020_0000;
pub const MOD_W: u32 = 0x0020_8000;
pub const DIV_WU: u32 = 0x0021_0000;
pub const MOD_WU: u32 = 0x0021_8000;
pub const DIV_D: u32 = 0x0022_0000;
pub const MOD_D: u32 = 0x0022_8000;
pub const DIV_DU: u32 = 0x0023_0000;
pub const MOD_DU: u32 = 0x0023_8000;

// Scalar float 3R-type (op17)
pub const FADD_S: u32 = 0x0100_8000;
pub const FADD_D: u32 = 0x0101_0000;
pub const FSUB_S: u32 = 0x0102_8000;
pub const FSUB_D: u32 = 0x0103_0000;
pub const FMUL_S: u32 = 0x0104_8000;
pub const FMUL_D: u32 = 0x0105_0000;
pub const FDIV_S: u32 = 0x0106_8000;
pub const FDIV_D: u32 = 0x0107_0000;
pub const FMAX_S: u32 = 0x0108_8000;
pub const FMAX_D: u32 = 0x0109_0000;
pub const FMIN_S: u32 = 0x010a_8000;
pub const FMIN_D: u32 = 0x010b_0000;

// ALSL / BYTEPICK (bits [31:18], sa in the middle)
pub const ALSL_W: u32 = 0x0004_0000;
pub const BYTEPICK_D: u32 = 0x000c_0000;
pub const ALSL_D: u32 = 0x002c_0000;

// 2RI12-type (op22 = word & 0xFFC00000)
pub const SLTI: u32 = 0x0200_0000;
pub const SLTUI: u32 = 0x0240_0000;
pub const ADDI_W: u32 = 0x0280_0000;
pub const ADDI_D: u32 = 0x02c0_0000;
pub const LU52I_D: u32 = 0x0300_0000;
pub const ANDI: u32 = 0x0340_0000;
pub const ORI: u32 = 0x0380_0000;
pub const XORI: u32 = 0x03c0_0000;

// Loads and stores (op22)
pub const LD_B: u32 = 0x2800_0000;
pub const LD_H: u32 = 0x2840_0000;
pub const LD_W: u32 = 0x2880_0000;
pub const LD_D: u32 = 0x28c0_0000;
pub const ST_B: u32 = 0x2900_0000;
pub const ST_H: u32 = 0x2940_0000;
pub const ST_W: u32 = 0x2980_0000;
pub const ST_D: u32 = 0x29c0_0000;
pub const LD_BU: u32 = 0x2a00_0000;
pub const LD_HU: u32 = 0x2a40_0000;
pub const LD_WU: u32 = 0x2a80_0000;
pub const FLD_S: u32 = 0x2b00_0000;
pub const FST_S: u32 = 0x2b40_0000;
pub const FLD_D: u32 = 0x2b80_0000;
pub const FST_D: u32 = 0x2bc0_0000;

// 14-bit scaled offset forms (op8 = word & 0xFF000000)
pub const LL_W: u32 = 0x2000_0000;
pub const SC_W: u32 = 0x2100_0000;
pub const LL_D: u32 = 0x2200_0000;
pub const SC_D: u32 = 0x2300_0000;
pub const LDPTR_W: u32 = 0x2400_0000;
pub const STPTR_W: u32 = 0x2500_0000;
pub const LDPTR_D: u32 = 0x2600_0000;
pub const STPTR_D: u32 = 0x2700_0000;

// Indexed loads/stores (op17 under the 0x38 primary opcode)
pub const LDX_B: u32 = 0x3800_0000;
pub const LDX_H: u32 = 0x3804_0000;
pub const LDX_W: u32 = 0x3808_0000;
pub const LDX_D: u32 = 0x380c_0000;
pub const STX_B: u32 = 0x3810_0000;
pub const STX_H: u32 = 0x3814_0000;
pub const STX_W: u32 = 0x3818_0000;
pub const STX_D: u32 = 0x381c_0000;
pub const LDX_BU: u32 = 0x3820_0000;
pub const LDX_HU: u32 = 0x3824_0000;
pub const LDX_WU: u32 = 0x3828_0000;
pub const FLDX_S: u32 = 0x3830_0000;
pub const FLDX_D: u32 = 0x3834_0000;
pub const FSTX_S: u32 = 0x3838_0000;
pub const FSTX_D: u32 = 0x383c_0000;

// Barriers (op17)
pub const DBAR: u32 = 0x3872_0000;
pub const IBAR: u32 = 0x3872_8000;

// Atomic read-modify-write base (bits [31:20]); bits [19:16] select the
// operation and ordering, bit [15] selects word/double.
pub const AM_BASE: u32 = 0x3860_0000;
pub const AMXOR_BASE: u32 = 0x3870_0000;

// Branches and jumps (op6 = word >> 26)
pub const OP6_BEQZ: u32 = 0x10;
pub const OP6_BNEZ: u32 = 0x11;
pub const OP6_BCZ: u32 = 0x12;
pub const OP6_JIRL: u32 = 0x13;
pub const OP6_B: u32 = 0x14;
pub const OP6_BL: u32 = 0x15;
pub const OP6_BEQ: u32 = 0x16;
pub const OP6_BNE: u32 = 0x17;
pub const OP6_BLT: u32 = 0x18;
pub const OP6_BGE: u32 = 0x19;
pub const OP6_BLTU: u32 = 0x1a;
pub const OP6_BGEU: u32 = 0x1b;

// Upper-immediate / PC-relative forms (bits [31:25])
pub const LU12I_W: u32 = 0x1400_0000;
pub const LU32I_D: u32 = 0x1600_0000;
pub const PCADDI: u32 = 0x1800_0000;
pub const PCALAU12I: u32 = 0x1a00_0000;
pub const PCADDU12I: u32 = 0x1c00_0000;
pub const PCADDU18I: u32 = 0x1e00_0000;

// Shift immediates (op16 = word >> 16); the 32-bit forms keep bit 15 set.
pub const OP16_SLLI_W: u32 = 0x0040;
pub const OP16_SLLI_D: u32 = 0x0041;
pub const OP16_SRLI_W: u32 = 0x0044;
pub const OP16_SRLI_D: u32 = 0x0045;
pub const OP16_SRAI_W: u32 = 0x0048;
pub const OP16_SRAI_D: u32 = 0x0049;
pub const OP16_ROTRI_W: u32 = 0x004c;
pub const OP16_ROTRI_D: u32 = 0x004d;

// 2R-type (bits [31:10])
pub const OP22_CLO_W: u32 = 0x0000_04;
pub const OP22_CLZ_W: u32 = 0x0000_05;
pub const OP22_CTO_W: u32 = 0x0000_06;
pub const OP22_CTZ_W: u32 = 0x0000_07;
pub const OP22_CLO_D: u32 = 0x0000_08;
pub const OP22_CLZ_D: u32 = 0x0000_09;
pub const OP22_CTO_D: u32 = 0x0000_0a;
pub const OP22_CTZ_D: u32 = 0x0000_0b;
pub const OP22_REVB_2H: u32 = 0x0000_0c;
pub const OP22_REVB_4H: u32 = 0x0000_0d;
pub const OP22_REVB_2W: u32 = 0x0000_0e;
pub const OP22_REVB_D: u32 = 0x0000_0f;
pub const OP22_REVH_2W: u32 = 0x0000_10;
pub const OP22_REVH_D: u32 = 0x0000_11;
pub const OP22_BITREV_4B: u32 = 0x0000_12;
pub const OP22_BITREV_8B: u32 = 0x0000_13;
pub const OP22_BITREV_W: u32 = 0x0000_14;
pub const OP22_BITREV_D: u32 = 0x0000_15;
pub const OP22_EXT_W_H: u32 = 0x0000_16;
pub const OP22_EXT_W_B: u32 = 0x0000_17;
pub const OP22_RDTIME_D: u32 = 0x0000_1a;
pub const OP22_FABS_S: u32 = 0x4501;
pub const OP22_FABS_D: u32 = 0x4502;
pub const OP22_FNEG_S: u32 = 0x4505;
pub const OP22_FNEG_D: u32 = 0x4506;
pub const OP22_FSQRT_S: u32 = 0x4511;
pub const OP22_FSQRT_D: u32 = 0x4512;
pub const OP22_FMOV_S: u32 = 0x4525;
pub const OP22_FMOV_D: u32 = 0x4526;
pub const OP22_MOVGR2FR_W: u32 = 0x4529;
pub const OP22_MOVGR2FR_D: u32 = 0x452a;
pub const OP22_MOVFR2GR_S: u32 = 0x452d;
pub const OP22_MOVFR2GR_D: u32 = 0x452e;
pub const OP22_MOVGR2FCSR: u32 = 0x4530;
pub const OP22_MOVFCSR2GR: u32 = 0x4532;
pub const OP22_MOVFR2CF: u32 = 0x4534;
pub const OP22_MOVCF2FR: u32 = 0x4535;
pub const OP22_MOVGR2CF: u32 = 0x4536;
pub const OP22_MOVCF2GR: u32 = 0x4537;
pub const OP22_FCVT_S_D: u32 = 0x4646;
pub const OP22_FCVT_D_S: u32 = 0x4649;
pub const OP22_FTINTRZ_W_S: u32 = 0x46a1;
pub const OP22_FTINTRZ_W_D: u32 = 0x46a2;
pub const OP22_FTINTRZ_L_S: u32 = 0x46a9;
pub const OP22_FTINTRZ_L_D: u32 = 0x46aa;
pub const OP22_FFINT_S_W: u32 = 0x4744;
pub const OP22_FFINT_S_L: u32 = 0x4746;
pub const OP22_FFINT_D_W: u32 = 0x4748;
pub const OP22_FFINT_D_L: u32 = 0x474a;

// Bit-string forms: the 64-bit variants are identified by bits [31:22],
// the 32-bit variants share bits [31:21] with bit 15 picking ins/pick.
pub const OP10_BSTRINS_D: u32 = 0x002;
pub const OP10_BSTRPICK_D: u32 = 0x003;
pub const OP11_BSTR_W: u32 = 0x003;

// Fused multiply-add (bits [31:20], 4R format)
pub const OP12_FMADD_S: u32 = 0x081;
pub const OP12_FMADD_D: u32 = 0x082;
pub const OP12_FMSUB_S: u32 = 0x085;
pub const OP12_FMSUB_D: u32 = 0x086;
pub const OP12_FNMADD_S: u32 = 0x089;
pub const OP12_FNMADD_D: u32 = 0x08a;
pub const OP12_FNMSUB_S: u32 = 0x08d;
pub const OP12_FNMSUB_D: u32 = 0x08e;

// Float compare (bits [31:20]); the condition lives in bits [19:15].
pub const OP12_FCMP_S: u32 = 0x0c1;
pub const OP12_FCMP_D: u32 = 0x0c2;
// Float select (bits [31:18])
pub const OP14_FSEL: u32 = 0x0340;

// System (op17 identifies; the low 15 bits carry the break/syscall code)
pub const SYSCALL: u32 = 0x002b_0000;
pub const BREAK: u32 = 0x002a_0000;

#[inline]
pub fn op6(word: u32) -> u32 {
  word >> 26
}

#[inline]
pub fn op17(word: u32) -> u32 {
  word & 0xffff_8000
}

#[inline]
pub fn op22(word: u32) -> u32 {
  word & 0xffc0_0000
}

#[inline]
pub fn op16(word: u32) -> u32 {
  word >> 16
}

/// 2R-type identifying bits [31:10].
#[inline]
pub fn op2r(word: u32) -> u32 {
  word >> 10
}
