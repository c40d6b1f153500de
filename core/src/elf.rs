//! Guest binary parsing: 64-bit little-endian LoongArch ELF images.
//!
//! Parsing is separated from the memory arena so the loader output can be
//! inspected and reused; [`crate::runtime::Memory`] consumes the result.

use ::elf::abi::{EM_LOONGARCH, ET_EXEC, PF_W, PF_X, PT_LOAD, PT_TLS, STT_FUNC, STT_OBJECT};
use ::elf::endian::LittleEndian;
use ::elf::file::Class;
use ::elf::ElfBytes;

use crate::runtime::memory::Symbol;
use crate::runtime::MachineError;

/// One loadable program segment, with its file bytes copied out.
#[derive(Debug, Clone)]
pub struct LoadedSegment {
  pub vaddr: u64,
  pub memsz: u64,
  pub data: Vec<u8>,
  pub writable: bool,
  pub executable: bool,
}

/// The thread-local-storage template segment, recorded for the auxiliary
/// vector; static guests initialize TLS themselves.
#[derive(Debug, Clone, Copy)]
pub struct TlsSegment {
  pub vaddr: u64,
  pub memsz: u64,
}

/// A parsed guest binary: entry point, loadable segments, program-header
/// bookkeeping for auxv and the harvested symbol index.
#[derive(Debug, Clone)]
pub struct LoadedElf {
  pub entry: u64,
  pub phdr_offset: u64,
  pub phentsize: u16,
  pub phnum: u16,
  pub segments: Vec<LoadedSegment>,
  pub tls: Option<TlsSegment>,
  pub symbols: Vec<Symbol>,
}

impl LoadedElf {
  /// Parse a statically linked LA64 ELF executable.
  pub fn parse(input: &[u8]) -> Result<Self, MachineError> {
    let elf = ElfBytes::<LittleEndian>::minimal_parse(input)
      .map_err(|e| MachineError::InvalidProgram(format!("not a parseable ELF: {e}")))?;

    if elf.ehdr.class != Class::ELF64 {
      return Err(MachineError::InvalidProgram("must be a 64-bit ELF".into()));
    }
    if elf.ehdr.e_machine != EM_LOONGARCH {
      return Err(MachineError::InvalidProgram(
        "must be a LoongArch ELF".into(),
      ));
    }
    if elf.ehdr.e_type != ET_EXEC {
      return Err(MachineError::InvalidProgram(
        "must be a statically linked executable".into(),
      ));
    }
    if elf.ehdr.e_entry % 4 != 0 {
      return Err(MachineError::InvalidProgram("entry is misaligned".into()));
    }

    let mut segments = Vec::new();
    let mut tls = None;
    let phdrs = elf
      .segments()
      .ok_or_else(|| MachineError::InvalidProgram("no program headers".into()))?;
    for phdr in phdrs.iter() {
      match phdr.p_type {
        PT_LOAD => {
          let offset = phdr.p_offset as usize;
          let filesz = phdr.p_filesz as usize;
          let data = input
            .get(offset..offset + filesz)
            .ok_or_else(|| MachineError::InvalidProgram("segment outside file".into()))?
            .to_vec();
          segments.push(LoadedSegment {
            vaddr: phdr.p_vaddr,
            memsz: phdr.p_memsz,
            data,
            writable: phdr.p_flags & PF_W != 0,
            executable: phdr.p_flags & PF_X != 0,
          });
        }
        PT_TLS => {
          tls = Some(TlsSegment {
            vaddr: phdr.p_vaddr,
            memsz: phdr.p_memsz,
          });
        }
        // PT_INTERP and PT_DYNAMIC carry nothing a static image needs.
        _ => {}
      }
    }

    let symbols = harvest_symbols(&elf);

    Ok(Self {
      entry: elf.ehdr.e_entry,
      phdr_offset: elf.ehdr.e_phoff,
      phentsize: elf.ehdr.e_phentsize,
      phnum: elf.ehdr.e_phnum,
      segments,
      tls,
      symbols,
    })
  }
}

/// Collect function and object symbols from both the static and the
/// dynamic symbol tables. Missing tables are not an error; stripped
/// binaries simply lose vmcall-by-name.
fn harvest_symbols(elf: &ElfBytes<LittleEndian>) -> Vec<Symbol> {
  let mut symbols = Vec::new();

  let tables = [elf.symbol_table(), elf.dynamic_symbol_table()];
  for table in tables.into_iter().flatten().flatten() {
    let (symtab, strtab) = table;
    for sym in symtab.iter() {
      let kind = sym.st_symtype();
      if (kind != STT_FUNC && kind != STT_OBJECT) || sym.st_value == 0 {
        continue;
      }
      let Ok(name) = strtab.get(sym.st_name as usize) else {
        continue;
      };
      if name.is_empty() {
        continue;
      }
      symbols.push(Symbol {
        name: name.to_string(),
        address: sym.st_value,
        size: sym.st_size,
      });
    }
  }

  tracing::debug!(count = symbols.len(), "harvested guest symbols");
  symbols
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::utils::asm;

  #[test]
  fn parse_synthetic_image() {
    let code = [asm::addi_d(4, 0, 42), asm::syscall()];
    let image = asm::build_elf(&code, 0x12000, &[("main", 0x12000, 8)]);
    let elf = LoadedElf::parse(&image).unwrap();

    assert_eq!(0x12000, elf.entry);
    assert_eq!(1, elf.segments.len());
    assert!(elf.segments[0].executable);
    assert_eq!(0x12000, elf.segments[0].vaddr);
    assert_eq!(Some(0x12000), {
      elf
        .symbols
        .iter()
        .find(|s| s.name == "main")
        .map(|s| s.address)
    });
  }

  #[test]
  fn rejects_foreign_machine_types() {
    let code = [asm::nop()];
    let mut image = asm::build_elf(&code, 0x12000, &[]);
    // Corrupt e_machine.
    image[18] = 0xf3;
    assert!(matches!(
      LoadedElf::parse(&image),
      Err(MachineError::InvalidProgram(_))
    ));
  }

  #[test]
  fn rejects_truncated_input() {
    assert!(LoadedElf::parse(&[0x7f, b'E', b'L', b'F']).is_err());
  }
}
