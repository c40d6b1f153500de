use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::runtime::decoder::DecoderEntry;

/// A region of guest code decoded once into a dense per-instruction record
/// array. Segments are immutable after decoding (apart from the stale
/// flag) and may be shared between machines through the process-wide
/// cache below.
#[derive(Debug)]
pub struct DecodedExecuteSegment {
  exec_begin: u64,
  exec_end: u64,
  entries: Vec<DecoderEntry>,
  stale: AtomicBool,
}

impl DecodedExecuteSegment {
  pub fn new(exec_begin: u64, exec_end: u64, entries: Vec<DecoderEntry>) -> Self {
    debug_assert_eq!(entries.len() as u64, (exec_end - exec_begin) / 4 + 1);
    Self {
      exec_begin,
      exec_end,
      entries,
      stale: AtomicBool::new(false),
    }
  }

  /// The empty sentinel segment a fresh CPU points at before any code is
  /// loaded. Contains nothing; every PC misses it.
  pub fn empty() -> Self {
    Self {
      exec_begin: 0,
      exec_end: 0,
      entries: vec![DecoderEntry::sentinel()],
      stale: AtomicBool::new(false),
    }
  }

  #[inline]
  pub fn exec_begin(&self) -> u64 {
    self.exec_begin
  }

  #[inline]
  pub fn exec_end(&self) -> u64 {
    self.exec_end
  }

  /// Whether `[addr, addr+len)` lies inside the segment, with the address
  /// arithmetic checked against wrap-around.
  #[inline]
  pub fn is_within(&self, addr: u64, len: u64) -> bool {
    match addr.checked_add(len) {
      Some(end) => addr >= self.exec_begin && end <= self.exec_end && end > self.exec_begin,
      None => false,
    }
  }

  #[inline]
  pub fn contains(&self, pc: u64) -> bool {
    self.is_within(pc, 4)
  }

  /// The decoder record for an in-segment PC.
  #[inline]
  pub fn entry_at(&self, pc: u64) -> &DecoderEntry {
    &self.entries[((pc - self.exec_begin) >> 2) as usize]
  }

  pub fn entries(&self) -> &[DecoderEntry] {
    &self.entries
  }

  pub fn size_bytes(&self) -> u64 {
    self.exec_end - self.exec_begin
  }

  pub fn is_empty(&self) -> bool {
    self.exec_begin >= self.exec_end
  }

  pub fn is_stale(&self) -> bool {
    self.stale.load(Ordering::Acquire)
  }

  pub fn set_stale(&self, stale: bool) {
    self.stale.store(stale, Ordering::Release);
  }

  /// Copy of this segment with one record replaced, for machine-local
  /// decoder-cache patching. The shared original is left untouched.
  pub fn with_patched_entry(&self, addr: u64, entry: DecoderEntry) -> Self {
    let mut entries = self.entries.clone();
    entries[((addr - self.exec_begin) >> 2) as usize] = entry;
    Self {
      exec_begin: self.exec_begin,
      exec_end: self.exec_end,
      entries,
      stale: AtomicBool::new(false),
    }
  }
}

/// Key identifying one decoded segment across machines: load address,
/// content checksum and arena size (segments decode identically only when
/// all three match).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentKey {
  pub begin: u64,
  pub crc: u32,
  pub arena_size: u64,
}

impl SegmentKey {
  pub fn compute(begin: u64, code: &[u8], arena_size: u64) -> Self {
    Self {
      begin,
      crc: crc32(code),
      arena_size,
    }
  }
}

type SegmentMap = HashMap<SegmentKey, Weak<DecodedExecuteSegment>>;

fn shared_segments() -> &'static Mutex<SegmentMap> {
  static CACHE: OnceLock<Mutex<SegmentMap>> = OnceLock::new();
  CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Look up a previously decoded segment for `key`, or decode one with
/// `build` and publish it. The cache holds weak references only; a
/// segment dies with its last machine.
pub fn lookup_or_insert<E>(
  key: SegmentKey,
  build: impl FnOnce() -> Result<DecodedExecuteSegment, E>,
) -> Result<Arc<DecodedExecuteSegment>, E> {
  let mut map = shared_segments().lock().unwrap();
  if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
    if !existing.is_stale() {
      return Ok(existing);
    }
  }
  let segment = Arc::new(build()?);
  map.retain(|_, weak| weak.strong_count() > 0);
  map.insert(key, Arc::downgrade(&segment));
  Ok(segment)
}

/// Number of live entries in the shared cache, for tests and statistics.
pub fn shared_segment_count() -> usize {
  let map = shared_segments().lock().unwrap();
  map.values().filter(|weak| weak.strong_count() > 0).count()
}

/// CRC-32 (IEEE) over the segment bytes, bitwise variant. Only runs at
/// decode time so a lookup table is not worth carrying.
pub fn crc32(data: &[u8]) -> u32 {
  let mut crc = !0u32;
  for &byte in data {
    crc ^= byte as u32;
    for _ in 0..8 {
      let mask = (crc & 1).wrapping_neg();
      crc = (crc >> 1) ^ (0xedb8_8320 & mask);
    }
  }
  !crc
}
