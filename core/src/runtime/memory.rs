use std::sync::Arc;

use crate::elf::LoadedElf;
use crate::runtime::decoder;
use crate::runtime::segment::{self, DecodedExecuteSegment, SegmentKey};
use crate::runtime::MachineError;
use crate::utils::MachineOptions;

/// Guard bytes past the usable arena so wide accesses near the tail can
/// be bounds-checked against `arena_size` alone without slicing past the
/// allocation.
const GUARD_SIZE: usize = 64;

/// A scalar value that can be read from or written to guest memory.
/// Accesses are little-endian and alignment-free.
pub trait MemValue: Copy {
  const SIZE: usize;
  fn from_le_slice(bytes: &[u8]) -> Self;
  fn write_le(self, bytes: &mut [u8]);
}

macro_rules! mem_value {
  ($($t:ty),*) => {
    $(impl MemValue for $t {
      const SIZE: usize = std::mem::size_of::<$t>();

      fn from_le_slice(bytes: &[u8]) -> Self {
        Self::from_le_bytes(bytes.try_into().unwrap())
      }

      fn write_le(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_le_bytes());
      }
    })*
  };
}

mem_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// A symbol harvested from the guest binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
  pub name: String,
  pub address: u64,
  pub size: u64,
}

/// The guest's flat address space: one contiguous arena indexed directly
/// by guest virtual address, plus the region boundaries, the brk/mmap
/// bump allocators and the decoded execute segments.
///
/// Reads must land in `[rodata_start, arena_size)`, writes additionally
/// past `data_start`. All range arithmetic is checked so wrapped
/// addresses fault instead of aliasing low memory.
pub struct Memory {
  arena: Vec<u8>,
  arena_size: u64,

  rodata_start: u64,
  data_start: u64,

  start_address: u64,
  stack_address: u64,
  exit_address: u64,
  heap_address: u64,
  brk_address: u64,
  brk_base: u64,
  brk_limit: u64,
  mmap_address: u64,

  elf_phdr_addr: u64,
  elf_phentsize: u16,
  elf_phnum: u16,

  main_exec: Option<Arc<DecodedExecuteSegment>>,
  extra_exec: Vec<Arc<DecodedExecuteSegment>>,

  symbols: Vec<Symbol>,
}

impl Memory {
  /// Build the guest address space from a parsed ELF image.
  pub fn new(elf: &LoadedElf, options: &MachineOptions) -> Result<Self, MachineError> {
    let mut min_addr = u64::MAX;
    let mut max_addr = 0u64;
    let mut first_writable = u64::MAX;

    for seg in &elf.segments {
      let end = seg
        .vaddr
        .checked_add(seg.memsz)
        .ok_or_else(|| MachineError::InvalidProgram("segment overflows address space".into()))?;
      min_addr = min_addr.min(seg.vaddr);
      max_addr = max_addr.max(end);
      if seg.writable && seg.vaddr < first_writable {
        first_writable = seg.vaddr;
      }
    }
    if min_addr >= max_addr {
      return Err(MachineError::InvalidProgram(
        "no loadable segments found".into(),
      ));
    }

    // Page-align the end of the image; the heap begins there.
    let max_addr = (max_addr + 4095) & !4095;
    if max_addr >= options.memory_max() as u64 {
      return Err(MachineError::OutOfMemory(
        "not enough memory for image, stack and brk",
      ));
    }

    let mut memory = Self {
      arena: Vec::new(),
      arena_size: 0,
      rodata_start: min_addr,
      data_start: if first_writable != u64::MAX {
        first_writable
      } else {
        max_addr
      },
      start_address: elf.entry,
      stack_address: 0,
      exit_address: 0,
      heap_address: max_addr,
      brk_address: 0,
      brk_base: 0,
      brk_limit: 0,
      mmap_address: max_addr,
      elf_phdr_addr: min_addr + elf.phdr_offset,
      elf_phentsize: elf.phentsize,
      elf_phnum: elf.phnum,
      main_exec: None,
      extra_exec: Vec::new(),
      symbols: elf.symbols.clone(),
    };

    memory.allocate_arena(options.memory_max() as u64)?;

    // Carve the brk area and the stack out of the mmap pool.
    memory.brk_base = memory.mmap_allocate(options.brk_size() as u64);
    memory.brk_address = memory.brk_base;
    memory.brk_limit = memory.brk_base + options.brk_size() as u64;
    let stack_base = memory.mmap_allocate(options.stack_size() as u64);
    memory.stack_address = stack_base + options.stack_size() as u64;

    if options.verbose_loader() {
      tracing::info!(
        rodata_start = memory.rodata_start,
        data_start = memory.data_start,
        heap = memory.heap_address,
        stack = memory.stack_address,
        arena = memory.arena_size,
        "memory layout"
      );
    }

    // Install the load segments and decode the executable ones.
    for seg in &elf.segments {
      if seg.data.is_empty() {
        continue;
      }
      let end = seg.vaddr + seg.data.len() as u64;
      if end > memory.arena_size {
        return Err(MachineError::InvalidProgram(
          "segment exceeds memory arena".into(),
        ));
      }
      memory.arena[seg.vaddr as usize..end as usize].copy_from_slice(&seg.data);
      if seg.executable {
        // .text and .rodata are often fused; under-align to the
        // instruction boundary.
        let aligned_len = seg.data.len() & !3;
        let is_initial = memory.main_exec.is_none();
        memory.create_execute_segment(&seg.data[..aligned_len], seg.vaddr, is_initial)?;
      }
    }

    Ok(memory)
  }

  /// An empty address space with caller-chosen region boundaries. Used
  /// by hosts that feed code and data in by hand rather than from an ELF.
  pub fn uninitialized(
    size: u64,
    rodata_start: u64,
    data_start: u64,
  ) -> Result<Self, MachineError> {
    if rodata_start >= size || data_start >= size || rodata_start > data_start {
      return Err(MachineError::InvalidProgram(
        "invalid arena boundaries".into(),
      ));
    }
    let mut memory = Self {
      arena: Vec::new(),
      arena_size: 0,
      rodata_start,
      data_start,
      start_address: 0,
      stack_address: size,
      exit_address: 0,
      heap_address: data_start,
      brk_address: data_start,
      brk_base: data_start,
      brk_limit: data_start,
      mmap_address: data_start,
      elf_phdr_addr: 0,
      elf_phentsize: 0,
      elf_phnum: 0,
      main_exec: None,
      extra_exec: Vec::new(),
      symbols: Vec::new(),
    };
    memory.allocate_arena(size)?;
    Ok(memory)
  }

  fn allocate_arena(&mut self, size: u64) -> Result<(), MachineError> {
    let total = size as usize + GUARD_SIZE;
    let mut arena = Vec::new();
    arena
      .try_reserve_exact(total)
      .map_err(|_| MachineError::OutOfMemory("failed to allocate memory arena"))?;
    arena.resize(total, 0);
    self.arena = arena;
    self.arena_size = size;
    Ok(())
  }

  // === Typed access ===

  #[inline]
  fn check_read(&self, addr: u64, len: u64) -> Result<(), MachineError> {
    match addr.checked_add(len) {
      Some(end) if addr >= self.rodata_start && end <= self.arena_size => Ok(()),
      _ => Err(MachineError::ProtectionFault(
        addr,
        "read from unmapped memory",
      )),
    }
  }

  #[inline]
  fn check_write(&self, addr: u64, len: u64) -> Result<(), MachineError> {
    match addr.checked_add(len) {
      Some(end) if addr >= self.data_start && end <= self.arena_size => Ok(()),
      _ => Err(MachineError::ProtectionFault(
        addr,
        "write to read-only memory",
      )),
    }
  }

  #[inline]
  pub fn read<T: MemValue>(&self, addr: u64) -> Result<T, MachineError> {
    self.check_read(addr, T::SIZE as u64)?;
    let at = addr as usize;
    Ok(T::from_le_slice(&self.arena[at..at + T::SIZE]))
  }

  #[inline]
  pub fn write<T: MemValue>(&mut self, addr: u64, value: T) -> Result<(), MachineError> {
    self.check_write(addr, T::SIZE as u64)?;
    let at = addr as usize;
    value.write_le(&mut self.arena[at..at + T::SIZE]);
    Ok(())
  }

  // === Bulk access and views ===

  /// Zero-copy read-only view of guest memory.
  pub fn memarray(&self, addr: u64, len: u64) -> Result<&[u8], MachineError> {
    self.check_read(addr, len)?;
    Ok(&self.arena[addr as usize..(addr + len) as usize])
  }

  /// Zero-copy writable view of guest memory.
  pub fn writable_memarray(&mut self, addr: u64, len: u64) -> Result<&mut [u8], MachineError> {
    self.check_write(addr, len)?;
    Ok(&mut self.arena[addr as usize..(addr + len) as usize])
  }

  pub fn copy_to_guest(&mut self, dest: u64, src: &[u8]) -> Result<(), MachineError> {
    self
      .writable_memarray(dest, src.len() as u64)?
      .copy_from_slice(src);
    Ok(())
  }

  pub fn copy_from_guest(&self, dest: &mut [u8], src: u64) -> Result<(), MachineError> {
    dest.copy_from_slice(self.memarray(src, dest.len() as u64)?);
    Ok(())
  }

  pub fn memset(&mut self, dest: u64, value: u8, len: u64) -> Result<(), MachineError> {
    self.writable_memarray(dest, len)?.fill(value);
    Ok(())
  }

  pub fn memcmp(&self, addr1: u64, addr2: u64, len: u64) -> Result<std::cmp::Ordering, MachineError> {
    let a = self.memarray(addr1, len)?;
    let b = self.memarray(addr2, len)?;
    Ok(a.cmp(b))
  }

  /// Length of the zero-terminated string at `addr`, capped at `maxlen`.
  pub fn strlen(&self, addr: u64, maxlen: u64) -> Result<u64, MachineError> {
    let end = (addr.saturating_add(maxlen)).min(self.arena_size);
    if end <= addr {
      return Ok(0);
    }
    let view = self.memarray(addr, end - addr)?;
    Ok(view.iter().position(|&b| b == 0).unwrap_or(view.len()) as u64)
  }

  /// Copy out the zero-terminated string at `addr`.
  pub fn memstring(&self, addr: u64, maxlen: u64) -> Result<String, MachineError> {
    let len = self.strlen(addr, maxlen)?;
    let bytes = self.memarray(addr, len)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
  }

  /// Loader-path installation: copy bytes into the arena checked against
  /// its size only, ignoring the read-only region boundaries. Guest code
  /// never reaches this; it exists for image loading and hosts feeding
  /// raw code.
  pub fn install_image(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MachineError> {
    match addr.checked_add(bytes.len() as u64) {
      Some(end) if end <= self.arena_size => {
        self.arena[addr as usize..end as usize].copy_from_slice(bytes);
        Ok(())
      }
      _ => Err(MachineError::ProtectionFault(
        addr,
        "write to out-of-bounds memory",
      )),
    }
  }

  // === Region bookkeeping ===

  pub fn arena_size(&self) -> u64 {
    self.arena_size
  }

  pub fn rodata_start(&self) -> u64 {
    self.rodata_start
  }

  pub fn data_start(&self) -> u64 {
    self.data_start
  }

  pub fn start_address(&self) -> u64 {
    self.start_address
  }

  pub fn set_start_address(&mut self, addr: u64) {
    self.start_address = addr;
  }

  pub fn stack_address(&self) -> u64 {
    self.stack_address
  }

  pub fn set_stack_address(&mut self, addr: u64) {
    self.stack_address = addr;
  }

  pub fn exit_address(&self) -> u64 {
    self.exit_address
  }

  pub fn set_exit_address(&mut self, addr: u64) {
    self.exit_address = addr;
  }

  pub fn heap_address(&self) -> u64 {
    self.heap_address
  }

  /// The current program break.
  pub fn brk_address(&self) -> u64 {
    self.brk_address
  }

  pub fn set_brk_address(&mut self, addr: u64) {
    self.brk_address = addr;
  }

  /// The bounds of the brk area carved out at construction.
  pub fn brk_range(&self) -> (u64, u64) {
    (self.brk_base, self.brk_limit)
  }

  pub fn mmap_address(&self) -> u64 {
    self.mmap_address
  }

  pub fn elf_phdr_addr(&self) -> u64 {
    self.elf_phdr_addr
  }

  pub fn elf_phentsize(&self) -> u16 {
    self.elf_phentsize
  }

  pub fn elf_phnum(&self) -> u16 {
    self.elf_phnum
  }

  /// Bump-allocate from the mmap pool, page-aligned.
  pub fn mmap_allocate(&mut self, size: u64) -> u64 {
    let size = (size + 4095) & !4095;
    let result = self.mmap_address;
    self.mmap_address += size;
    result
  }

  /// Release an mmap range. Only a trailing range moves the pool pointer
  /// back; interior holes are forgotten.
  pub fn mmap_deallocate(&mut self, addr: u64, size: u64) {
    let size = (size + 4095) & !4095;
    if addr + size == self.mmap_address {
      self.mmap_address = addr;
    }
  }

  // === Execute segments ===

  /// Decode `code` at `addr` into an execute segment, consulting the
  /// process-wide shared cache so machines loading the same binary share
  /// one decoded copy.
  pub fn create_execute_segment(
    &mut self,
    code: &[u8],
    addr: u64,
    is_initial: bool,
  ) -> Result<Arc<DecodedExecuteSegment>, MachineError> {
    if addr % 4 != 0 {
      return Err(MachineError::InvalidProgram(
        "execute segment is not 4-byte aligned".into(),
      ));
    }
    let len = code.len() & !3;
    let key = SegmentKey::compute(addr, &code[..len], self.arena_size);
    let segment = segment::lookup_or_insert(key, || {
      let mut entries = decoder::populate(&code[..len], addr);
      decoder::rewrite(&mut entries);
      Ok::<_, MachineError>(DecodedExecuteSegment::new(addr, addr + len as u64, entries))
    })?;
    if is_initial {
      self.main_exec = Some(segment.clone());
    } else {
      self.extra_exec.push(segment.clone());
    }
    Ok(segment)
  }

  /// Find the execute segment containing `pc`, rebuilding it from the
  /// arena bytes first if guest writes marked it stale.
  pub fn exec_segment_for(&mut self, pc: u64) -> Result<Arc<DecodedExecuteSegment>, MachineError> {
    let found = if self
      .main_exec
      .as_ref()
      .is_some_and(|seg| seg.contains(pc))
    {
      self.main_exec.clone()
    } else {
      self
        .extra_exec
        .iter()
        .find(|seg| seg.contains(pc))
        .cloned()
    };

    let segment = found.ok_or(MachineError::ExecSpaceProtectionFault(pc))?;
    if !segment.is_stale() {
      return Ok(segment);
    }

    let begin = segment.exec_begin();
    let len = segment.size_bytes() as usize;
    let code: Vec<u8> = self.arena[begin as usize..begin as usize + len].to_vec();
    let mut entries = decoder::populate(&code, begin);
    decoder::rewrite(&mut entries);
    let rebuilt = Arc::new(DecodedExecuteSegment::new(begin, begin + len as u64, entries));
    self.replace_segment(&segment, rebuilt.clone());
    Ok(rebuilt)
  }

  /// Mark execute segments overlapping `[addr, addr+len)` stale; the next
  /// dispatch entry into them re-decodes from the arena bytes.
  pub fn invalidate_code_range(&self, addr: u64, len: u64) {
    let end = addr.saturating_add(len);
    for seg in self.main_exec.iter().chain(self.extra_exec.iter()) {
      if addr < seg.exec_end() && end > seg.exec_begin() {
        seg.set_stale(true);
      }
    }
  }

  /// Swap a machine-local replacement in for `old` (patched or rebuilt
  /// segments).
  pub fn replace_segment(
    &mut self,
    old: &Arc<DecodedExecuteSegment>,
    new: Arc<DecodedExecuteSegment>,
  ) {
    if self.main_exec.as_ref().is_some_and(|seg| Arc::ptr_eq(seg, old)) {
      self.main_exec = Some(new);
      return;
    }
    for seg in self.extra_exec.iter_mut() {
      if Arc::ptr_eq(seg, old) {
        *seg = new;
        return;
      }
    }
  }

  pub fn execute_segment_count(&self) -> usize {
    self.extra_exec.len() + usize::from(self.main_exec.is_some())
  }

  pub fn execute_segments(&self) -> impl Iterator<Item = &Arc<DecodedExecuteSegment>> {
    self.main_exec.iter().chain(self.extra_exec.iter())
  }

  // === Symbols ===

  pub fn symbols(&self) -> &[Symbol] {
    &self.symbols
  }

  pub fn address_of(&self, name: &str) -> Option<u64> {
    self
      .symbols
      .iter()
      .find(|sym| sym.name == name)
      .map(|sym| sym.address)
  }

  pub fn lookup_symbol(&self, addr: u64) -> Option<&Symbol> {
    self
      .symbols
      .iter()
      .find(|sym| addr >= sym.address && addr < sym.address + sym.size.max(1))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_memory() -> Memory {
    // 64 KiB arena: first page unmapped, rodata at 0x1000, data at 0x4000.
    Memory::uninitialized(0x10000, 0x1000, 0x4000).unwrap()
  }

  #[test]
  fn read_write_round_trip() {
    let mut mem = test_memory();
    mem.write::<u64>(0x4000, 0xdead_beef_cafe_f00d).unwrap();
    assert_eq!(0xdead_beef_cafe_f00d, mem.read::<u64>(0x4000).unwrap());
    assert_eq!(0xf00d, mem.read::<u16>(0x4000).unwrap());
  }

  #[test]
  fn unaligned_access_is_allowed() {
    let mut mem = test_memory();
    mem.write::<u32>(0x4001, 0x01020304).unwrap();
    assert_eq!(0x01020304, mem.read::<u32>(0x4001).unwrap());
  }

  #[test]
  fn write_below_data_start_faults() {
    let mut mem = test_memory();
    let err = mem.write::<u32>(0x4000 - 4, 0xdeadbeef).unwrap_err();
    assert!(matches!(err, MachineError::ProtectionFault(addr, _) if addr == 0x3ffc));
    // Reads of the same address are fine: it is rodata.
    assert_eq!(0, mem.read::<u32>(0x3ffc).unwrap());
  }

  #[test]
  fn read_below_rodata_start_faults() {
    let mem = test_memory();
    assert!(mem.read::<u8>(0xfff).is_err());
    assert!(mem.read::<u8>(0x1000).is_ok());
  }

  #[test]
  fn access_past_arena_end_faults() {
    let mut mem = test_memory();
    assert!(mem.read::<u64>(0x10000 - 4).is_err());
    assert!(mem.read::<u32>(0x10000 - 4).is_ok());
    assert!(mem.write::<u64>(u64::MAX - 2, 1).is_err());
  }

  #[test]
  fn address_wrap_faults_instead_of_aliasing() {
    let mem = test_memory();
    assert!(mem.read::<u64>(u64::MAX - 7).is_err());
  }

  #[test]
  fn memstring_stops_at_terminator() {
    let mut mem = test_memory();
    mem.copy_to_guest(0x5000, b"hello\0world").unwrap();
    assert_eq!("hello", mem.memstring(0x5000, 4096).unwrap());
    assert_eq!(5, mem.strlen(0x5000, 4096).unwrap());
  }

  #[test]
  fn mmap_is_a_page_aligned_bump_pool() {
    let mut mem = test_memory();
    let base = mem.mmap_address();
    let first = mem.mmap_allocate(100);
    assert_eq!(base, first);
    let second = mem.mmap_allocate(8192);
    assert_eq!(base + 4096, second);
    // Only the trailing range can be released.
    mem.mmap_deallocate(second, 8192);
    assert_eq!(base + 4096, mem.mmap_address());
  }

  #[test]
  fn memcmp_views() {
    let mut mem = test_memory();
    mem.copy_to_guest(0x5000, b"abcd").unwrap();
    mem.copy_to_guest(0x6000, b"abcd").unwrap();
    mem.copy_to_guest(0x7000, b"abce").unwrap();
    assert_eq!(
      std::cmp::Ordering::Equal,
      mem.memcmp(0x5000, 0x6000, 4).unwrap()
    );
    assert_eq!(
      std::cmp::Ordering::Less,
      mem.memcmp(0x5000, 0x7000, 4).unwrap()
    );
  }

  #[test]
  fn uninitialized_rejects_bad_boundaries() {
    assert!(Memory::uninitialized(0x1000, 0x2000, 0x3000).is_err());
    assert!(Memory::uninitialized(0x10000, 0x2000, 0x1000).is_err());
  }
}
