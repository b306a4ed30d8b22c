//! Allocation tracker: per-object metadata and alloc/free history.
//!
//! Objects live in a sharded arena and are addressed by [`ObjectId`]
//! (shard, slot, generation), never by reference. Freed objects keep their
//! metadata in a FIFO quarantine so use-after-free reports can still show
//! both tracks. Once evicted, the slot is recycled and stale ids stop
//! resolving because the generation no longer matches.
//!
//! Every heap page an object overlaps carries an ordered `base -> ObjectId`
//! index. That index is the anchor for the nearest-enclosing search the
//! region resolver runs on a faulting address.
//!
//! Thread-safe via sharded `parking_lot::Mutex`. No operation holds two
//! shard locks at once.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::context::ContextId;
use crate::error::DetectorError;
use crate::page_oracle::{PAGE_SIZE, PageOracle, page_span};
use crate::stack::{StackHandle, StackTraceProvider};

/// Number of shards for tracker locks (power of 2).
const NUM_SHARDS: usize = 16;

/// Maximum bytes of freed objects kept resolvable.
const QUARANTINE_MAX_BYTES: usize = 64 * 1024 * 1024; // 64 MB

/// How far a fault may land from an object on a neighbouring page and still
/// be attributed to it.
pub const NEIGHBOUR_REACH: usize = 128;

/// Frames dropped from captured tracks (the tracker and detector themselves).
const TRACK_SKIP_FRAMES: usize = 3;

/// Stable identity of an object record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectId {
    pub shard: u16,
    pub slot: u32,
    pub generation: u32,
}

/// Who allocated or freed an object, and from where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackRecord {
    pub context: ContextId,
    pub stack: Option<StackHandle>,
}

impl TrackRecord {
    /// Snapshot the calling thread.
    #[must_use]
    pub fn capture(stacks: &dyn StackTraceProvider) -> Self {
        Self {
            context: ContextId::current(),
            stack: stacks.capture(TRACK_SKIP_FRAMES),
        }
    }
}

/// Metadata of one tracked heap object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMetadata {
    pub id: ObjectId,
    /// Allocator cache (or allocation kind) the object came from.
    pub cache: String,
    pub base: usize,
    pub size: usize,
    pub tag: u8,
    pub alloc_track: TrackRecord,
    /// Absent until the object is freed.
    pub free_track: Option<TrackRecord>,
}

impl ObjectMetadata {
    #[must_use]
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.free_track.is_some()
    }
}

/// Result of feeding a deallocation into the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreeResult {
    /// The object was live. Its snapshot now carries the free track.
    Freed(ObjectMetadata),
    /// The object at this base was already freed and is still quarantined.
    DoubleFree(ObjectMetadata),
    /// No tracked object starts at this address.
    InvalidFree,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    object: Option<ObjectMetadata>,
}

#[derive(Debug, Clone, Copy)]
struct QuarantineEntry {
    id: ObjectId,
    base: usize,
    size: usize,
}

#[derive(Default)]
struct TrackerShard {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    /// Live objects owned by this shard, keyed by base.
    live: HashMap<usize, u32>,
    /// Quarantined objects owned by this shard, keyed by base.
    freed: HashMap<usize, u32>,
    /// Per-page anchor index for pages that map to this shard.
    pages: HashMap<usize, BTreeMap<usize, ObjectId>>,
}

#[derive(Default)]
struct Quarantine {
    queue: VecDeque<QuarantineEntry>,
    bytes: usize,
}

/// Thread-safe allocation tracker.
pub struct AllocationTracker {
    shards: Box<[Mutex<TrackerShard>]>,
    quarantine: Mutex<Quarantine>,
    quarantine_limit: usize,
    next_generation: AtomicU32,
    pages: PageOracle,
}

impl AllocationTracker {
    /// Create a tracker keeping up to `quarantine_limit` freed records.
    #[must_use]
    pub fn new(quarantine_limit: usize) -> Self {
        let shards: Vec<Mutex<TrackerShard>> = (0..NUM_SHARDS)
            .map(|_| Mutex::new(TrackerShard::default()))
            .collect();
        Self {
            shards: shards.into_boxed_slice(),
            quarantine: Mutex::new(Quarantine::default()),
            quarantine_limit,
            next_generation: AtomicU32::new(1),
            pages: PageOracle::new(),
        }
    }

    /// Record an allocation event.
    pub fn record_alloc(
        &self,
        base: usize,
        size: usize,
        cache: &str,
        tag: u8,
        track: TrackRecord,
    ) -> Result<ObjectId, DetectorError> {
        let owner = shard_for(base);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let id = {
            let mut shard = self.shards[owner].lock();
            if shard.live.contains_key(&base) {
                return Err(DetectorError::DuplicateObject(base));
            }
            let slot_idx = match shard.free_list.pop() {
                Some(idx) => idx,
                None => {
                    shard.slots.push(Slot {
                        generation: 0,
                        object: None,
                    });
                    (shard.slots.len() - 1) as u32
                }
            };
            let id = ObjectId {
                shard: owner as u16,
                slot: slot_idx,
                generation,
            };
            shard.slots[slot_idx as usize] = Slot {
                generation,
                object: Some(ObjectMetadata {
                    id,
                    cache: cache.to_string(),
                    base,
                    size,
                    tag,
                    alloc_track: track,
                    free_track: None,
                }),
            };
            shard.live.insert(base, slot_idx);
            id
        };

        for page in page_span(base, size) {
            self.shards[page % NUM_SHARDS]
                .lock()
                .pages
                .entry(page)
                .or_default()
                .insert(base, id);
        }
        self.pages.insert(base, size);
        Ok(id)
    }

    /// Record a deallocation event for the object starting at `base`.
    pub fn record_free(&self, base: usize, track: TrackRecord) -> FreeResult {
        let owner = shard_for(base);
        let freed = {
            let mut shard = self.shards[owner].lock();
            if let Some(slot_idx) = shard.live.remove(&base) {
                shard.freed.insert(base, slot_idx);
                let Some(object) = shard.slots[slot_idx as usize].object.as_mut() else {
                    return FreeResult::InvalidFree;
                };
                object.free_track = Some(track);
                object.clone()
            } else {
                let previous = shard
                    .freed
                    .get(&base)
                    .and_then(|&idx| shard.slots[idx as usize].object.clone());
                return previous.map_or(FreeResult::InvalidFree, FreeResult::DoubleFree);
            }
        };

        let evicted = {
            let mut quarantine = self.quarantine.lock();
            quarantine.queue.push_back(QuarantineEntry {
                id: freed.id,
                base: freed.base,
                size: freed.size,
            });
            quarantine.bytes += freed.size;
            let mut evicted = Vec::new();
            while quarantine.queue.len() > self.quarantine_limit
                || quarantine.bytes > QUARANTINE_MAX_BYTES
            {
                let Some(entry) = quarantine.queue.pop_front() else {
                    break;
                };
                quarantine.bytes -= entry.size;
                evicted.push(entry);
            }
            evicted
        };
        for entry in evicted {
            self.recycle(entry);
        }

        FreeResult::Freed(freed)
    }

    /// Metadata for `id`, if the record has not been recycled.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<ObjectMetadata> {
        let shard = self.shards.get(usize::from(id.shard))?.lock();
        let slot = shard.slots.get(id.slot as usize)?;
        slot.object.as_ref().filter(|o| o.id == id).cloned()
    }

    /// Whether a tracked object overlaps the page holding `addr`.
    #[must_use]
    pub fn owns_page(&self, addr: usize) -> bool {
        self.pages.owns(addr)
    }

    /// The object nearest to `addr` on `addr`'s page.
    ///
    /// Picks the greatest base `<= addr`, so addresses past an object's end
    /// resolve to that object. Addresses before the first object on the page
    /// resolve to the first object.
    #[must_use]
    pub fn nearest_object(&self, addr: usize) -> Option<ObjectMetadata> {
        let page = addr / PAGE_SIZE;
        let id = self.with_page(page, |index| {
            index
                .range(..=addr)
                .next_back()
                .or_else(|| index.iter().next())
                .map(|(_, id)| *id)
        })?;
        self.get(id)
    }

    /// An object on an adjacent page within [`NEIGHBOUR_REACH`] of `addr`.
    ///
    /// Covers faults that cross a page boundary: an overflow past an object
    /// ending at the boundary, or an underflow before a page-aligned object.
    /// When both sides qualify the closer one wins, ties going left.
    #[must_use]
    pub fn nearest_neighbour(&self, addr: usize) -> Option<ObjectMetadata> {
        let page = addr / PAGE_SIZE;
        let before = page
            .checked_sub(1)
            .and_then(|p| self.with_page(p, |index| index.values().next_back().copied()))
            .and_then(|id| self.get(id))
            .filter(|o| o.end() <= addr && addr - o.end() < NEIGHBOUR_REACH);
        let after = page
            .checked_add(1)
            .and_then(|p| self.with_page(p, |index| index.values().next().copied()))
            .and_then(|id| self.get(id))
            .filter(|o| o.base > addr && o.base - addr <= NEIGHBOUR_REACH);

        match (before, after) {
            (Some(b), Some(a)) => Some(if addr - b.end() <= a.base - addr { b } else { a }),
            (b, a) => b.or(a),
        }
    }

    /// Tracked objects overlapping the page that holds `addr`.
    #[must_use]
    pub fn objects_on_page(&self, addr: usize) -> usize {
        self.pages.objects_on_page(addr / PAGE_SIZE)
    }

    /// Number of live objects.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().live.len()).sum()
    }

    /// Number of freed objects still resolvable.
    #[must_use]
    pub fn quarantined(&self) -> usize {
        self.quarantine.lock().queue.len()
    }

    /// Run `pick` over one page's anchor index under its shard lock.
    fn with_page<T>(
        &self,
        page: usize,
        pick: impl FnOnce(&BTreeMap<usize, ObjectId>) -> Option<T>,
    ) -> Option<T> {
        if !self.pages.owns_page(page) {
            return None;
        }
        let shard = self.shards[page % NUM_SHARDS].lock();
        pick(shard.pages.get(&page)?)
    }

    fn recycle(&self, entry: QuarantineEntry) {
        {
            let mut shard = self.shards[usize::from(entry.id.shard)].lock();
            let slot_idx = entry.id.slot;
            let matches = shard
                .slots
                .get(slot_idx as usize)
                .is_some_and(|s| s.generation == entry.id.generation && s.object.is_some());
            if !matches {
                return;
            }
            shard.slots[slot_idx as usize].object = None;
            shard.free_list.push(slot_idx);
            if shard.freed.get(&entry.base) == Some(&slot_idx) {
                shard.freed.remove(&entry.base);
            }
        }

        for page in page_span(entry.base, entry.size) {
            let mut shard = self.shards[page % NUM_SHARDS].lock();
            if let Some(index) = shard.pages.get_mut(&page) {
                if index.get(&entry.base) == Some(&entry.id) {
                    index.remove(&entry.base);
                }
                if index.is_empty() {
                    shard.pages.remove(&page);
                }
            }
        }
        self.pages.remove(entry.base, entry.size);
    }
}

fn shard_for(base: usize) -> usize {
    (base / PAGE_SIZE) % NUM_SHARDS
}
