//! Two-level heap page ownership map.
//!
//! Level 1 is a hash map keyed by 16 MiB chunk number. Level 2 is an on-demand
//! array of per-page object counts for that chunk. A page is heap-owned while
//! at least one tracked object (live or quarantined) overlaps it.
//!
//! The region resolver asks this map first, so "is this address on a heap
//! page?" never has to scan the object arena.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::RwLock;

/// Page size assumed for heap ownership.
pub const PAGE_SIZE: usize = 4096;

/// Pages per level-2 table (4096 pages = 16 MiB).
const PAGES_PER_CHUNK: usize = 4096;

/// Heap page ownership oracle.
pub struct PageOracle {
    chunks: RwLock<HashMap<usize, PageCounts>>,
}

/// Object counts for the pages of one chunk.
struct PageCounts {
    counts: Box<[AtomicU16]>,
}

impl PageCounts {
    fn new() -> Self {
        let counts: Vec<AtomicU16> = (0..PAGES_PER_CHUNK).map(|_| AtomicU16::new(0)).collect();
        Self {
            counts: counts.into_boxed_slice(),
        }
    }

    fn acquire(&self, page: usize) {
        // Saturated pages stay owned for good.
        let _ = self.counts[page].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(x.saturating_add(1))
        });
    }

    fn release(&self, page: usize) {
        let _ = self.counts[page].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            match x {
                0 | u16::MAX => None,
                _ => Some(x - 1),
            }
        });
    }

    fn count(&self, page: usize) -> u16 {
        self.counts[page].load(Ordering::Relaxed)
    }
}

impl PageOracle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
        }
    }

    /// Record an object covering `[base, base + size)`.
    pub fn insert(&self, base: usize, size: usize) {
        for page in page_span(base, size) {
            let (chunk, slot) = split(page);
            {
                let chunks = self.chunks.read();
                if let Some(counts) = chunks.get(&chunk) {
                    counts.acquire(slot);
                    continue;
                }
            }
            let mut chunks = self.chunks.write();
            chunks
                .entry(chunk)
                .or_insert_with(PageCounts::new)
                .acquire(slot);
        }
    }

    /// Forget an object previously passed to [`insert`](Self::insert).
    pub fn remove(&self, base: usize, size: usize) {
        let chunks = self.chunks.read();
        for page in page_span(base, size) {
            let (chunk, slot) = split(page);
            if let Some(counts) = chunks.get(&chunk) {
                counts.release(slot);
            }
        }
    }

    /// Whether the page holding `addr` carries a tracked heap object.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.owns_page(addr / PAGE_SIZE)
    }

    /// Same as [`owns`](Self::owns), by page number.
    #[must_use]
    pub fn owns_page(&self, page: usize) -> bool {
        self.objects_on_page(page) > 0
    }

    /// Tracked objects (live or quarantined) overlapping page number `page`.
    /// Saturates at `u16::MAX`.
    #[must_use]
    pub fn objects_on_page(&self, page: usize) -> usize {
        let (chunk, slot) = split(page);
        self.chunks
            .read()
            .get(&chunk)
            .map_or(0, |counts| usize::from(counts.count(slot)))
    }
}

impl Default for PageOracle {
    fn default() -> Self {
        Self::new()
    }
}

/// Page numbers covered by `[base, base + size)`. Zero-sized objects still
/// pin the page holding their base.
pub(crate) fn page_span(base: usize, size: usize) -> std::ops::RangeInclusive<usize> {
    let last = base.saturating_add(size.max(1) - 1);
    (base / PAGE_SIZE)..=(last / PAGE_SIZE)
}

fn split(page: usize) -> (usize, usize) {
    (page / PAGES_PER_CHUNK, page % PAGES_PER_CHUNK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_query() {
        let oracle = PageOracle::new();
        oracle.insert(0x1000_0040, 16);
        assert!(oracle.owns(0x1000_0000));
        assert!(oracle.owns(0x1000_0FFF));
        assert!(!oracle.owns(0x1000_1000));
        assert!(!oracle.owns(0x0FFF_FFFF));
    }

    #[test]
    fn objects_spanning_pages_own_every_page() {
        let oracle = PageOracle::new();
        oracle.insert(0x2000_0F00, 3 * PAGE_SIZE);
        for page in 0..4 {
            assert!(oracle.owns(0x2000_0000 + page * PAGE_SIZE), "page {page}");
        }
        assert!(!oracle.owns(0x2000_0000 + 4 * PAGE_SIZE));
    }

    #[test]
    fn shared_page_stays_owned_until_last_object_leaves() {
        let oracle = PageOracle::new();
        oracle.insert(0x3000_0000, 64);
        oracle.insert(0x3000_0100, 64);
        assert_eq!(oracle.objects_on_page(0x3000_0000 / PAGE_SIZE), 2);
        oracle.remove(0x3000_0000, 64);
        assert!(oracle.owns(0x3000_0000));
        assert_eq!(oracle.objects_on_page(0x3000_0000 / PAGE_SIZE), 1);
        oracle.remove(0x3000_0100, 64);
        assert!(!oracle.owns(0x3000_0000));
    }

    #[test]
    fn unbalanced_remove_is_harmless() {
        let oracle = PageOracle::new();
        oracle.remove(0x4000_0000, 64);
        assert!(!oracle.owns(0x4000_0000));
        oracle.insert(0x4000_0000, 64);
        assert!(oracle.owns(0x4000_0000));
    }

    #[test]
    fn zero_sized_object_pins_its_page() {
        assert_eq!(page_span(0x5000_0010, 0), 0x50000..=0x50000);
        let oracle = PageOracle::new();
        oracle.insert(0x5000_0010, 0);
        assert!(oracle.owns(0x5000_0010));
    }
}
