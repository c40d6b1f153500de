//! Hand assembler for the LA64 encodings used by the test suite, plus a
//! minimal ELF image builder. Together they stand in for a cross
//! toolchain: tests assemble real machine code, wrap it in a synthetic
//! executable and run it through the full load path.

#![allow(dead_code)]

fn r3(op: u32, rd: u32, rj: u32, rk: u32) -> u32 {
  op | (rk << 10) | (rj << 5) | rd
}

fn ri12(op: u32, rd: u32, rj: u32, imm: i32) -> u32 {
  op | (((imm as u32) & 0xfff) << 10) | (rj << 5) | rd
}

fn ri14(op: u32, rd: u32, rj: u32, imm_bytes: i32) -> u32 {
  let imm14 = ((imm_bytes / 4) as u32) & 0x3fff;
  op | (imm14 << 10) | (rj << 5) | rd
}

fn ri16(op: u32, rd: u32, rj: u32, offs_bytes: i64) -> u32 {
  let offs = ((offs_bytes / 4) as u32) & 0xffff;
  op | (offs << 10) | (rj << 5) | rd
}

fn ri20(op: u32, rd: u32, imm: i32) -> u32 {
  op | (((imm as u32) & 0xfffff) << 5) | rd
}

fn ri21(op: u32, rj: u32, offs_bytes: i64) -> u32 {
  let offs = (offs_bytes / 4) as u32;
  op | ((offs & 0xffff) << 10) | (rj << 5) | ((offs >> 16) & 0x1f)
}

fn i26(op: u32, offs_bytes: i64) -> u32 {
  let offs = (offs_bytes / 4) as u32;
  op | ((offs & 0xffff) << 10) | ((offs >> 16) & 0x3ff)
}

// Arithmetic
pub fn add_w(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0010_0000, rd, rj, rk)
}

pub fn add_d(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0010_8000, rd, rj, rk)
}

pub fn sub_w(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0011_0000, rd, rj, rk)
}

pub fn sub_d(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0011_8000, rd, rj, rk)
}

pub fn slt(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0012_0000, rd, rj, rk)
}

pub fn sltu(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0012_8000, rd, rj, rk)
}

pub fn maskeqz(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0013_0000, rd, rj, rk)
}

pub fn nor(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0014_0000, rd, rj, rk)
}

pub fn and_(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0014_8000, rd, rj, rk)
}

pub fn or_(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0015_0000, rd, rj, rk)
}

pub fn xor_(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0015_8000, rd, rj, rk)
}

pub fn sll_d(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0018_8000, rd, rj, rk)
}

pub fn mul_w(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x001c_0000, rd, rj, rk)
}

pub fn mul_d(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x001d_8000, rd, rj, rk)
}

pub fn div_w(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0020_0000, rd, rj, rk)
}

pub fn div_wu(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x0021_0000, rd, rj, rk)
}

pub fn addi_w(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x0280_0000, rd, rj, imm)
}

pub fn addi_d(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x02c0_0000, rd, rj, imm)
}

pub fn slti(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x0200_0000, rd, rj, imm)
}

pub fn sltui(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x0240_0000, rd, rj, imm)
}

pub fn andi(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x0340_0000, rd, rj, imm)
}

pub fn ori(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x0380_0000, rd, rj, imm)
}

pub fn xori(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x03c0_0000, rd, rj, imm)
}

pub fn nop() -> u32 {
  andi(0, 0, 0)
}

// Shifts
pub fn slli_w(rd: u32, rj: u32, ui5: u32) -> u32 {
  0x0040_8000 | (ui5 << 10) | (rj << 5) | rd
}

pub fn slli_d(rd: u32, rj: u32, ui6: u32) -> u32 {
  0x0041_0000 | (ui6 << 10) | (rj << 5) | rd
}

pub fn srli_d(rd: u32, rj: u32, ui6: u32) -> u32 {
  0x0045_0000 | (ui6 << 10) | (rj << 5) | rd
}

pub fn srai_d(rd: u32, rj: u32, ui6: u32) -> u32 {
  0x0049_0000 | (ui6 << 10) | (rj << 5) | rd
}

// Bit manipulation
pub fn ext_w_b(rd: u32, rj: u32) -> u32 {
  (0x17 << 10) | (rj << 5) | rd
}

pub fn clz_w(rd: u32, rj: u32) -> u32 {
  (0x05 << 10) | (rj << 5) | rd
}

pub fn revb_d(rd: u32, rj: u32) -> u32 {
  (0x0f << 10) | (rj << 5) | rd
}

pub fn bstrpick_d(rd: u32, rj: u32, msb: u32, lsb: u32) -> u32 {
  0x00c0_0000 | (msb << 16) | (lsb << 10) | (rj << 5) | rd
}

pub fn bstrins_d(rd: u32, rj: u32, msb: u32, lsb: u32) -> u32 {
  0x0080_0000 | (msb << 16) | (lsb << 10) | (rj << 5) | rd
}

// Loads and stores
pub fn ld_b(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x2800_0000, rd, rj, imm)
}

pub fn ld_w(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x2880_0000, rd, rj, imm)
}

pub fn ld_d(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x28c0_0000, rd, rj, imm)
}

pub fn ld_bu(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x2a00_0000, rd, rj, imm)
}

pub fn st_b(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x2900_0000, rd, rj, imm)
}

pub fn st_w(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x2980_0000, rd, rj, imm)
}

pub fn st_d(rd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x29c0_0000, rd, rj, imm)
}

pub fn ldptr_d(rd: u32, rj: u32, imm_bytes: i32) -> u32 {
  ri14(0x2600_0000, rd, rj, imm_bytes)
}

pub fn stptr_d(rd: u32, rj: u32, imm_bytes: i32) -> u32 {
  ri14(0x2700_0000, rd, rj, imm_bytes)
}

pub fn ldx_d(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x380c_0000, rd, rj, rk)
}

pub fn stx_d(rd: u32, rj: u32, rk: u32) -> u32 {
  r3(0x381c_0000, rd, rj, rk)
}

// LL/SC and atomics
pub fn ll_d(rd: u32, rj: u32, imm_bytes: i32) -> u32 {
  ri14(0x2200_0000, rd, rj, imm_bytes)
}

pub fn sc_d(rd: u32, rj: u32, imm_bytes: i32) -> u32 {
  ri14(0x2300_0000, rd, rj, imm_bytes)
}

pub fn amswap_d(rd: u32, rk: u32, rj: u32) -> u32 {
  r3(0x3860_8000, rd, rj, rk)
}

pub fn amadd_w(rd: u32, rk: u32, rj: u32) -> u32 {
  r3(0x3861_0000, rd, rj, rk)
}

pub fn dbar() -> u32 {
  0x3872_0000
}

// Upper immediates and PC-relative
pub fn lu12i_w(rd: u32, imm20: i32) -> u32 {
  ri20(0x1400_0000, rd, imm20)
}

pub fn lu32i_d(rd: u32, imm20: i32) -> u32 {
  ri20(0x1600_0000, rd, imm20)
}

pub fn pcaddi(rd: u32, imm20: i32) -> u32 {
  ri20(0x1800_0000, rd, imm20)
}

pub fn pcalau12i(rd: u32, imm20: i32) -> u32 {
  ri20(0x1a00_0000, rd, imm20)
}

// Branches and jumps (offsets in bytes)
pub fn beqz(rj: u32, offs: i64) -> u32 {
  ri21(0x4000_0000, rj, offs)
}

pub fn bnez(rj: u32, offs: i64) -> u32 {
  ri21(0x4400_0000, rj, offs)
}

pub fn beq(rj: u32, rd: u32, offs: i64) -> u32 {
  ri16(0x5800_0000, rd, rj, offs)
}

pub fn bne(rj: u32, rd: u32, offs: i64) -> u32 {
  ri16(0x5c00_0000, rd, rj, offs)
}

pub fn blt(rj: u32, rd: u32, offs: i64) -> u32 {
  ri16(0x6000_0000, rd, rj, offs)
}

pub fn bge(rj: u32, rd: u32, offs: i64) -> u32 {
  ri16(0x6400_0000, rd, rj, offs)
}

pub fn b(offs: i64) -> u32 {
  i26(0x5000_0000, offs)
}

pub fn bl(offs: i64) -> u32 {
  i26(0x5400_0000, offs)
}

pub fn jirl(rd: u32, rj: u32, offs: i64) -> u32 {
  ri16(0x4c00_0000, rd, rj, offs)
}

/// Return through RA.
pub fn ret() -> u32 {
  jirl(0, 1, 0)
}

// Float
pub fn fadd_d(fd: u32, fj: u32, fk: u32) -> u32 {
  r3(0x0101_0000, fd, fj, fk)
}

pub fn fld_d(fd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x2b80_0000, fd, rj, imm)
}

pub fn fst_d(fd: u32, rj: u32, imm: i32) -> u32 {
  ri12(0x2bc0_0000, fd, rj, imm)
}

pub fn movgr2fr_d(fd: u32, rj: u32) -> u32 {
  (0x452a << 10) | (rj << 5) | fd
}

pub fn movfr2gr_d(rd: u32, fj: u32) -> u32 {
  (0x452e << 10) | (fj << 5) | rd
}

// System
pub fn syscall() -> u32 {
  0x002b_0000
}

pub fn break_() -> u32 {
  0x002a_0000
}

/// The conventional vmcall exit stub: `li.w $a7, 94; syscall 0`.
pub fn fast_exit_stub() -> [u32; 2] {
  [ori(11, 0, 94), syscall()]
}

/// Build a minimal statically linked LA64 ELF: one RWX load segment at
/// `vaddr` holding `code`, entry at `vaddr`, plus a symbol table with the
/// given `(name, address, size)` entries.
pub fn build_elf(code: &[u32], vaddr: u64, symbols: &[(&str, u64, u64)]) -> Vec<u8> {
  const EHSIZE: usize = 64;
  const PHSIZE: usize = 56;
  const SHSIZE: usize = 64;
  const SYMSIZE: usize = 24;
  const CODE_OFFSET: usize = 128;

  let code_bytes: Vec<u8> = code.iter().flat_map(|w| w.to_le_bytes()).collect();

  // String table: \0 name\0 name\0 ...
  let mut strtab = vec![0u8];
  let mut name_offsets = Vec::new();
  for (name, _, _) in symbols {
    name_offsets.push(strtab.len() as u32);
    strtab.extend_from_slice(name.as_bytes());
    strtab.push(0);
  }

  // Symbol table: null entry plus one global FUNC per symbol.
  let mut symtab = vec![0u8; SYMSIZE];
  for (idx, (_, address, size)) in symbols.iter().enumerate() {
    let mut entry = [0u8; SYMSIZE];
    entry[0..4].copy_from_slice(&name_offsets[idx].to_le_bytes());
    entry[4] = 0x12; // STB_GLOBAL | STT_FUNC
    entry[6..8].copy_from_slice(&0xfff1u16.to_le_bytes()); // SHN_ABS
    entry[8..16].copy_from_slice(&address.to_le_bytes());
    entry[16..24].copy_from_slice(&size.to_le_bytes());
    symtab.extend_from_slice(&entry);
  }

  let shstrtab = b"\0.symtab\0.strtab\0.shstrtab\0".to_vec();
  let symtab_offset = CODE_OFFSET + code_bytes.len();
  let strtab_offset = symtab_offset + symtab.len();
  let shstrtab_offset = strtab_offset + strtab.len();
  let shoff = shstrtab_offset + shstrtab.len();

  let mut image = vec![0u8; EHSIZE];
  // e_ident
  image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
  image[4] = 2; // ELFCLASS64
  image[5] = 1; // ELFDATA2LSB
  image[6] = 1; // EV_CURRENT
  image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
  image[18..20].copy_from_slice(&258u16.to_le_bytes()); // EM_LOONGARCH
  image[20..24].copy_from_slice(&1u32.to_le_bytes());
  image[24..32].copy_from_slice(&vaddr.to_le_bytes()); // e_entry
  image[32..40].copy_from_slice(&(EHSIZE as u64).to_le_bytes()); // e_phoff
  image[40..48].copy_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
  image[52..54].copy_from_slice(&(EHSIZE as u16).to_le_bytes()); // e_ehsize
  image[54..56].copy_from_slice(&(PHSIZE as u16).to_le_bytes()); // e_phentsize
  image[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
  image[58..60].copy_from_slice(&(SHSIZE as u16).to_le_bytes()); // e_shentsize
  image[60..62].copy_from_slice(&4u16.to_le_bytes()); // e_shnum
  image[62..64].copy_from_slice(&3u16.to_le_bytes()); // e_shstrndx

  // Program header: one RWX PT_LOAD for the code.
  let mut phdr = [0u8; PHSIZE];
  phdr[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
  phdr[4..8].copy_from_slice(&7u32.to_le_bytes()); // PF_R | PF_W | PF_X
  phdr[8..16].copy_from_slice(&(CODE_OFFSET as u64).to_le_bytes());
  phdr[16..24].copy_from_slice(&vaddr.to_le_bytes()); // p_vaddr
  phdr[24..32].copy_from_slice(&vaddr.to_le_bytes()); // p_paddr
  phdr[32..40].copy_from_slice(&(code_bytes.len() as u64).to_le_bytes()); // p_filesz
  phdr[40..48].copy_from_slice(&(code_bytes.len() as u64).to_le_bytes()); // p_memsz
  phdr[48..56].copy_from_slice(&0x1000u64.to_le_bytes()); // p_align
  image.extend_from_slice(&phdr);

  image.resize(CODE_OFFSET, 0);
  image.extend_from_slice(&code_bytes);
  image.extend_from_slice(&symtab);
  image.extend_from_slice(&strtab);
  image.extend_from_slice(&shstrtab);

  // Section headers: null, .symtab, .strtab, .shstrtab.
  let shdr = |name: u32, kind: u32, offset: usize, size: usize, link: u32, entsize: u64| {
    let mut sh = [0u8; SHSIZE];
    sh[0..4].copy_from_slice(&name.to_le_bytes());
    sh[4..8].copy_from_slice(&kind.to_le_bytes());
    sh[24..32].copy_from_slice(&(offset as u64).to_le_bytes());
    sh[32..40].copy_from_slice(&(size as u64).to_le_bytes());
    sh[40..44].copy_from_slice(&link.to_le_bytes());
    if kind == 2 {
      sh[44..48].copy_from_slice(&1u32.to_le_bytes()); // sh_info: first global
    }
    sh[56..64].copy_from_slice(&entsize.to_le_bytes());
    sh
  };
  let null_sh = [0u8; SHSIZE];
  let symtab_sh = shdr(1, 2, symtab_offset, symtab.len(), 2, SYMSIZE as u64);
  let strtab_sh = shdr(9, 3, strtab_offset, strtab.len(), 0, 0);
  let shstrtab_sh = shdr(17, 3, shstrtab_offset, shstrtab.len(), 0, 0);
  image.extend_from_slice(&null_sh);
  image.extend_from_slice(&symtab_sh);
  image.extend_from_slice(&strtab_sh);
  image.extend_from_slice(&shstrtab_sh);

  image
}
