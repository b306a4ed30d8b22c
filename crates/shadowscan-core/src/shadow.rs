//! Shadow memory for the monitored window.
//!
//! One shadow byte describes one granule of real memory:
//! - `0x00`: every byte of the granule is addressable.
//! - `0x01..granule`: only the first `n` bytes are addressable. This keeps
//!   bounds byte-accurate when an object size is not a granule multiple.
//! - `0xF1..=0xFE`: redzone of a specific kind (see [`RedzoneKind`]).
//!
//! In tag mode a parallel array holds one memory tag per granule. Pointers
//! carry their tag in the top byte.
//!
//! Storage is a flat `Box<[AtomicU8]>`. Reads and writes are relaxed: the
//! allocator events that write shadow state are already ordered with the
//! accesses they describe by the allocator's own synchronization.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::config::{DetectorConfig, valid_granule};
use crate::error::DetectorError;

/// Shadow encoding for a fully addressable granule.
pub const SHADOW_VALID: u8 = 0x00;

/// Shift of the pointer tag inside an address.
pub const TAG_SHIFT: u32 = 56;

/// Pointer tag that matches every memory tag.
pub const MATCH_ALL_TAG: u8 = 0xFF;

/// Why a granule is unaddressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedzoneKind {
    StackLeft,
    StackMid,
    StackRight,
    StackUseAfterScope,
    GlobalRedzone,
    HeapFreed,
    HeapRedzone,
    /// Never handed out. Also used for anything outside the window.
    Unallocated,
}

impl RedzoneKind {
    /// The shadow byte written for this redzone kind.
    #[must_use]
    pub const fn encoding(self) -> u8 {
        match self {
            Self::StackLeft => 0xF1,
            Self::StackMid => 0xF2,
            Self::StackRight => 0xF3,
            Self::StackUseAfterScope => 0xF8,
            Self::GlobalRedzone => 0xFA,
            Self::HeapFreed => 0xFB,
            Self::HeapRedzone => 0xFC,
            Self::Unallocated => 0xFE,
        }
    }

    #[must_use]
    pub const fn from_encoding(raw: u8) -> Option<Self> {
        match raw {
            0xF1 => Some(Self::StackLeft),
            0xF2 => Some(Self::StackMid),
            0xF3 => Some(Self::StackRight),
            0xF8 => Some(Self::StackUseAfterScope),
            0xFA => Some(Self::GlobalRedzone),
            0xFB => Some(Self::HeapFreed),
            0xFC => Some(Self::HeapRedzone),
            0xFE => Some(Self::Unallocated),
            _ => None,
        }
    }
}

/// Decoded state of one granule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ShadowByte {
    FullyValid,
    /// The first `n` bytes are valid, the rest are not.
    PartiallyValid(u8),
    Redzone(RedzoneKind),
}

impl ShadowByte {
    /// Decode a raw shadow byte for the given granule size.
    ///
    /// Unrecognized encodings decode as `Redzone(Unallocated)`.
    #[must_use]
    pub fn decode(raw: u8, granule: usize) -> Self {
        if raw == SHADOW_VALID {
            Self::FullyValid
        } else if usize::from(raw) < granule {
            Self::PartiallyValid(raw)
        } else {
            Self::Redzone(RedzoneKind::from_encoding(raw).unwrap_or(RedzoneKind::Unallocated))
        }
    }

    #[must_use]
    pub const fn encode(self) -> u8 {
        match self {
            Self::FullyValid => SHADOW_VALID,
            Self::PartiallyValid(n) => n,
            Self::Redzone(kind) => kind.encoding(),
        }
    }

    /// Number of leading addressable bytes in the granule.
    #[must_use]
    pub fn valid_prefix(self, granule: usize) -> usize {
        match self {
            Self::FullyValid => granule,
            Self::PartiallyValid(n) => usize::from(n),
            Self::Redzone(_) => 0,
        }
    }
}

/// Requested state for a range passed to [`ShadowMemory::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marking {
    /// Addressable. A trailing partial granule becomes `PartiallyValid`.
    Valid,
    /// Unaddressable. Every touched granule becomes a redzone.
    Invalid(RedzoneKind),
}

/// Geometry of the shadow window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowConfig {
    pub base: usize,
    pub len: usize,
    pub granule: usize,
    pub tag_mode: bool,
}

impl From<&DetectorConfig> for ShadowConfig {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            base: config.shadow_base,
            len: config.shadow_len,
            granule: config.granule_size,
            tag_mode: config.tag_mode,
        }
    }
}

/// Per-granule validity (and optionally tag) state of the monitored window.
pub struct ShadowMemory {
    base: usize,
    len: usize,
    granule: usize,
    granule_shift: u32,
    cells: Box<[AtomicU8]>,
    tags: Option<Box<[AtomicU8]>>,
}

impl ShadowMemory {
    /// Create a shadow for the window. Every granule starts `Unallocated`.
    pub fn new(config: &ShadowConfig) -> Result<Self, DetectorError> {
        if !valid_granule(config.granule) {
            return Err(DetectorError::InvalidGranule(config.granule));
        }
        if config.len == 0 {
            return Err(DetectorError::EmptyWindow);
        }
        if config.base % config.granule != 0 {
            return Err(DetectorError::Misaligned {
                addr: config.base,
                granule: config.granule,
            });
        }
        if config.base.checked_add(config.len).is_none() {
            return Err(DetectorError::OutOfWindow {
                addr: config.base,
                len: config.len,
            });
        }

        let count = config.len.div_ceil(config.granule);
        let fill = RedzoneKind::Unallocated.encoding();
        let cells: Vec<AtomicU8> = (0..count).map(|_| AtomicU8::new(fill)).collect();
        let tags = config.tag_mode.then(|| {
            let tags: Vec<AtomicU8> = (0..count).map(|_| AtomicU8::new(MATCH_ALL_TAG)).collect();
            tags.into_boxed_slice()
        });

        Ok(Self {
            base: config.base,
            len: config.len,
            granule: config.granule,
            granule_shift: config.granule.trailing_zeros(),
            cells: cells.into_boxed_slice(),
            tags,
        })
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last monitored byte.
    #[must_use]
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    #[must_use]
    pub fn granule(&self) -> usize {
        self.granule
    }

    #[must_use]
    pub fn granule_count(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn tag_mode(&self) -> bool {
        self.tags.is_some()
    }

    /// Whether `addr` has shadow state.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Shadow index of the granule holding `addr`.
    #[must_use]
    pub fn shadow_index(&self, addr: usize) -> Option<usize> {
        self.contains(addr)
            .then(|| (addr - self.base) >> self.granule_shift)
    }

    /// First real address described by shadow index `idx`.
    ///
    /// Negative or out-of-range indices are extrapolated from the window base.
    #[must_use]
    pub fn address_of_index(&self, idx: isize) -> usize {
        self.base
            .wrapping_add_signed(idx.wrapping_mul(self.granule as isize))
    }

    /// Mark `[addr, addr + len)` with the given state.
    ///
    /// `addr` must be granule-aligned and the range must lie in the window.
    pub fn encode(&self, addr: usize, len: usize, marking: Marking) -> Result<(), DetectorError> {
        if len == 0 {
            return Ok(());
        }
        let start = self.checked_range(addr, len)?;
        match marking {
            Marking::Valid => {
                let full = len >> self.granule_shift;
                let rem = len & (self.granule - 1);
                for cell in &self.cells[start..start + full] {
                    cell.store(SHADOW_VALID, Ordering::Relaxed);
                }
                if rem != 0 {
                    // rem < granule <= 64, so it fits below the redzone encodings.
                    self.cells[start + full].store(rem as u8, Ordering::Relaxed);
                }
            }
            Marking::Invalid(kind) => {
                let count = len.div_ceil(self.granule);
                for cell in &self.cells[start..start + count] {
                    cell.store(kind.encoding(), Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Mark `[addr, addr + len)` addressable.
    pub fn unpoison(&self, addr: usize, len: usize) -> Result<(), DetectorError> {
        self.encode(addr, len, Marking::Valid)
    }

    /// Mark the granules covering `[addr, addr + len)` as a redzone.
    pub fn poison(&self, addr: usize, len: usize, kind: RedzoneKind) -> Result<(), DetectorError> {
        self.encode(addr, len, Marking::Invalid(kind))
    }

    /// Decoded state of the granule holding `addr`.
    #[must_use]
    pub fn classify(&self, addr: usize) -> ShadowByte {
        match self.shadow_index(addr) {
            Some(idx) => ShadowByte::decode(self.cells[idx].load(Ordering::Relaxed), self.granule),
            None => ShadowByte::Redzone(RedzoneKind::Unallocated),
        }
    }

    /// Offset of the first unaddressable byte in `[addr, addr + len)`.
    ///
    /// Always the smallest such offset, so a footprint straddling a
    /// valid/invalid boundary reports the boundary itself. Bytes outside the
    /// window are unaddressable.
    #[must_use]
    pub fn first_invalid_byte(&self, addr: usize, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let end = addr.saturating_add(len);
        let window_end = self.end();
        let mut cur = addr;

        while cur < end {
            let Some(idx) = self.shadow_index(cur) else {
                return Some(cur - addr);
            };
            let granule_start = self.base + (idx << self.granule_shift);
            let granule_end = granule_start.saturating_add(self.granule);
            let prefix = ShadowByte::decode(self.cells[idx].load(Ordering::Relaxed), self.granule)
                .valid_prefix(self.granule);

            if cur - granule_start >= prefix {
                return Some(cur - addr);
            }
            let valid_end = (granule_start + prefix).min(window_end);
            if valid_end < end && valid_end < granule_end {
                return Some(valid_end - addr);
            }
            cur = granule_end;
        }
        None
    }

    /// Memory tag of the granule holding `addr` (tag mode only).
    #[must_use]
    pub fn tag_of(&self, addr: usize) -> Option<u8> {
        let tags = self.tags.as_ref()?;
        let idx = self.shadow_index(addr)?;
        Some(tags[idx].load(Ordering::Relaxed))
    }

    /// Assign `tag` to the granules covering `[addr, addr + len)`.
    ///
    /// A no-op outside tag mode.
    pub fn set_tag(&self, addr: usize, len: usize, tag: u8) -> Result<(), DetectorError> {
        let Some(tags) = self.tags.as_ref() else {
            return Ok(());
        };
        if len == 0 {
            return Ok(());
        }
        let start = self.checked_range(addr, len)?;
        for cell in &tags[start..start + len.div_ceil(self.granule)] {
            cell.store(tag, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Offset of the first byte whose granule tag differs from `tag`.
    ///
    /// Granules outside the window are skipped; bounds checks cover them.
    #[must_use]
    pub fn first_tag_mismatch(&self, addr: usize, len: usize, tag: u8) -> Option<usize> {
        let tags = self.tags.as_ref()?;
        if tag == MATCH_ALL_TAG || len == 0 {
            return None;
        }
        let end = addr.saturating_add(len);
        let mut cur = addr;
        while cur < end {
            let Some(idx) = self.shadow_index(cur) else {
                cur = cur.saturating_add(self.granule);
                continue;
            };
            if tags[idx].load(Ordering::Relaxed) != tag {
                return Some(cur - addr);
            }
            cur = (self.base + ((idx + 1) << self.granule_shift)).max(cur + 1);
        }
        None
    }

    /// Copy raw shadow bytes starting at index `first` into `out`.
    ///
    /// Indices outside the window read as `Unallocated`. The copy keeps the
    /// report from formatting straight out of live shadow cells.
    pub fn copy_row(&self, first: isize, out: &mut [u8]) {
        let fill = RedzoneKind::Unallocated.encoding();
        for (i, slot) in out.iter_mut().enumerate() {
            let idx = first.wrapping_add(i as isize);
            *slot = usize::try_from(idx)
                .ok()
                .and_then(|idx| self.cells.get(idx))
                .map_or(fill, |cell| cell.load(Ordering::Relaxed));
        }
    }

    /// Fail the way [`encode`](Self::encode) would for `[addr, addr + len)`.
    pub fn check_range(&self, addr: usize, len: usize) -> Result<(), DetectorError> {
        if len == 0 {
            return Ok(());
        }
        self.checked_range(addr, len).map(|_| ())
    }

    fn checked_range(&self, addr: usize, len: usize) -> Result<usize, DetectorError> {
        if addr & (self.granule - 1) != 0 {
            return Err(DetectorError::Misaligned {
                addr,
                granule: self.granule,
            });
        }
        let in_window = addr >= self.base
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.end());
        if !in_window {
            return Err(DetectorError::OutOfWindow { addr, len });
        }
        Ok((addr - self.base) >> self.granule_shift)
    }
}

/// Tag carried in the top byte of `addr`.
#[must_use]
pub fn pointer_tag(addr: usize) -> u8 {
    ((addr as u64) >> TAG_SHIFT) as u8
}

/// `addr` with its tag byte cleared.
#[must_use]
pub fn untag(addr: usize) -> usize {
    ((addr as u64) & !(0xFFu64 << TAG_SHIFT)) as usize
}

/// `addr` carrying `tag` in its top byte.
#[must_use]
pub fn with_tag(addr: usize, tag: u8) -> usize {
    (untag(addr) as u64 | (u64::from(tag) << TAG_SHIFT)) as usize
}
