use std::sync::Mutex;

use crate::runtime::bytecode::Bytecode;
use crate::runtime::handlers;
use crate::runtime::instruction::Instruction;
use crate::runtime::opcode;
use crate::runtime::{Machine, MachineError};

/// Handler signature shared by every generic instruction implementation.
pub type Handler = fn(&mut Machine, Instruction) -> Result<(), MachineError>;

/// One pre-decoded instruction slot.
///
/// `block_bytes` is the distance in bytes from this instruction to the
/// next control-flow-diverging instruction, not counting the diverging
/// instruction itself; zero means this instruction diverges (or touches
/// PC) and must be executed individually. After rewriting, `instr` holds
/// a bytecode-specific packed field layout instead of the raw word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderEntry {
  pub bytecode: Bytecode,
  pub handler: u8,
  pub block_bytes: u16,
  pub instr: u32,
}

impl DecoderEntry {
  pub const fn sentinel() -> Self {
    Self {
      bytecode: Bytecode::Invalid,
      handler: 0,
      block_bytes: 0,
      instr: 0,
    }
  }

  /// Instructions covered by the block starting at this entry, including
  /// the diverging terminator.
  #[inline]
  pub fn instruction_count(&self) -> u64 {
    (self.block_bytes / 4) as u64 + 1
  }
}

// block_bytes saturates below u16::MAX at a multiple of 4.
const BLOCK_BYTES_MAX: u32 = 65500;

static HANDLERS: Mutex<Vec<Handler>> = Mutex::new(Vec::new());

/// Intern a handler pointer into the process-wide dense table, returning
/// its index. The table is bounded to 256 entries; overflowing it means
/// the decode catalog produced more distinct handlers than the record
/// format can index, which is a bug in the catalog.
pub fn intern_handler(handler: Handler) -> u8 {
  let mut table = HANDLERS.lock().unwrap();
  if let Some(idx) = table.iter().position(|&h| h == handler) {
    return idx as u8;
  }
  assert!(table.len() < 256, "generic handler table overflow");
  table.push(handler);
  (table.len() - 1) as u8
}

/// Snapshot of the interned handler table. The dispatch loop refreshes
/// its copy whenever a new execute segment is resolved, the only point at
/// which new handlers can appear.
pub fn handler_table() -> Vec<Handler> {
  HANDLERS.lock().unwrap().clone()
}

/// Whether an instruction writes PC or consumes the current PC value:
/// branches, jumps, the PC-relative-add family, syscall and break. These
/// terminate basic blocks and are always executed individually.
pub fn is_diverging(word: u32) -> bool {
  match opcode::op6(word) {
    // PCADDI / PCALAU12I / PCADDU12I / PCADDU18I
    0x06 | 0x07 => true,
    // Conditional branches, JIRL, B, BL
    0x10..=0x1b => true,
    _ => {
      opcode::op17(word) == opcode::SYSCALL || opcode::op17(word) == opcode::BREAK
    }
  }
}

/// Populate a decoder-cache record array for `code` loaded at `begin`.
///
/// Produces `len/4 + 1` records (rounding an unaligned tail down, which
/// handles .text segments fused with .rodata) with generic bytecodes
/// only; a subsequent [`rewrite`] pass specializes the hot records. The
/// backward scan fills `block_bytes` so dispatch can retire whole blocks
/// per PC check.
pub fn populate(code: &[u8], _begin: u64) -> Vec<DecoderEntry> {
  let aligned = code.len() & !3;
  let count = aligned / 4;
  let mut entries = vec![DecoderEntry::sentinel(); count + 1];

  let mut acc: u32 = 0;
  for i in (0..count).rev() {
    let word = u32::from_le_bytes(code[i * 4..i * 4 + 4].try_into().unwrap());
    let handler = intern_handler(handlers::decode(Instruction(word)));

    let bytecode = if opcode::op17(word) == opcode::SYSCALL {
      Bytecode::Syscall
    } else if word == 0 {
      Bytecode::Invalid
    } else if is_diverging(word) {
      Bytecode::FuncBlock
    } else {
      Bytecode::Function
    };

    let block_bytes = if is_diverging(word) || word == 0 {
      acc = 0;
      0
    } else {
      acc += 4;
      acc.min(BLOCK_BYTES_MAX)
    };

    entries[i] = DecoderEntry {
      bytecode,
      handler,
      block_bytes: block_bytes as u16,
      instr: word,
    };
  }
  entries
}

/// The rewriter pass: replace generic records with specialized bytecodes
/// carrying pre-extracted operand fields. Branches and PC-relative
/// records keep `block_bytes = 0` so the loop still treats them as block
/// terminators.
pub fn rewrite(entries: &mut [DecoderEntry]) {
  for entry in entries.iter_mut() {
    if entry.bytecode == Bytecode::Function || entry.bytecode == Bytecode::FuncBlock {
      if let Some((bytecode, packed)) = Bytecode::specialize(entry.instr) {
        entry.bytecode = bytecode;
        entry.instr = packed;
      }
    }
  }
}
