//! Region resolution for faulting addresses.
//!
//! Precedence is fixed: heap objects on the faulting page, then static image,
//! then task stacks, then heap objects just across a page boundary, then
//! `Unknown`. Every hit carries an owned snapshot so the report never holds
//! a lock while it formats.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::context::ContextId;
use crate::page_oracle::PAGE_SIZE;
use crate::tracker::{AllocationTracker, ObjectMetadata};

/// Where an address sits relative to a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Left,
    Right,
    Inside,
}

/// Relation plus byte distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Relation {
    pub kind: RelationKind,
    pub distance: usize,
}

impl Relation {
    /// Locate `access` against `[base, base + size)`.
    #[must_use]
    pub fn compute(access: usize, base: usize, size: usize) -> Self {
        let end = base.saturating_add(size);
        if access < base {
            Self {
                kind: RelationKind::Left,
                distance: base - access,
            }
        } else if access >= end {
            Self {
                kind: RelationKind::Right,
                distance: access - end,
            }
        } else {
            Self {
                kind: RelationKind::Inside,
                distance: access - base,
            }
        }
    }

    /// Phrase used in "located N bytes ... of" lines.
    #[must_use]
    pub fn phrase(&self) -> &'static str {
        match self.kind {
            RelationKind::Left => "to the left",
            RelationKind::Right => "to the right",
            RelationKind::Inside => "inside",
        }
    }
}

/// A registered static variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalSymbol {
    pub name: String,
    pub base: usize,
    pub size: usize,
    /// Bytes of redzone following the variable.
    pub redzone: usize,
}

impl GlobalSymbol {
    fn covers(&self, addr: usize) -> bool {
        let end = self
            .base
            .saturating_add(self.size)
            .saturating_add(self.redzone);
        addr >= self.base && addr < end
    }
}

/// A registered task stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackRegion {
    pub context: ContextId,
    pub base: usize,
    pub size: usize,
}

/// The heap page holding a faulting address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub number: usize,
    pub base: usize,
    /// Tracked objects (live or quarantined) overlapping the page.
    pub objects: usize,
}

impl PageInfo {
    #[must_use]
    pub fn of(addr: usize, objects: usize) -> Self {
        let number = addr / PAGE_SIZE;
        Self {
            number,
            base: number * PAGE_SIZE,
            objects,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapHit {
    pub object: ObjectMetadata,
    pub relation: Relation,
    pub page: PageInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalHit {
    pub symbol: GlobalSymbol,
    pub relation: Relation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackHit {
    pub region: StackRegion,
    pub relation: Relation,
}

/// What a faulting address belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RegionClassification {
    HeapObject(HeapHit),
    GlobalSymbol(GlobalHit),
    TaskStack(StackHit),
    Unknown,
}

/// Static-image symbol table.
#[derive(Default)]
pub struct GlobalTable {
    inner: RwLock<GlobalsInner>,
}

#[derive(Default)]
struct GlobalsInner {
    symbols: BTreeMap<usize, GlobalSymbol>,
    /// `[start, end)` of every registered symbol plus redzones.
    image: Option<(usize, usize)>,
}

impl GlobalTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, symbol: GlobalSymbol) {
        let start = symbol.base;
        let end = symbol
            .base
            .saturating_add(symbol.size)
            .saturating_add(symbol.redzone);
        let mut inner = self.inner.write();
        inner.image = Some(match inner.image {
            Some((lo, hi)) => (lo.min(start), hi.max(end)),
            None => (start, end),
        });
        inner.symbols.insert(symbol.base, symbol);
    }

    /// Whether `addr` falls inside the image bounds.
    #[must_use]
    pub fn in_image(&self, addr: usize) -> bool {
        self.inner
            .read()
            .image
            .is_some_and(|(lo, hi)| addr >= lo && addr < hi)
    }

    /// The global whose `[base, base + size + redzone)` covers `addr`.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<GlobalSymbol> {
        let inner = self.inner.read();
        let (_, symbol) = inner.symbols.range(..=addr).next_back()?;
        symbol.covers(addr).then(|| symbol.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().symbols.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry of live task stacks.
#[derive(Default)]
pub struct StackRegistry {
    regions: RwLock<Vec<StackRegion>>,
}

impl StackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stack, replacing any earlier one for the same context.
    pub fn register(&self, region: StackRegion) {
        let mut regions = self.regions.write();
        regions.retain(|r| r.context != region.context);
        regions.push(region);
    }

    /// Forget the stack of `context`. Returns it if present.
    pub fn unregister(&self, context: &ContextId) -> Option<StackRegion> {
        let mut regions = self.regions.write();
        let pos = regions.iter().position(|r| &r.context == context)?;
        Some(regions.swap_remove(pos))
    }

    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<StackRegion> {
        self.regions
            .read()
            .iter()
            .find(|r| addr >= r.base && addr < r.base.saturating_add(r.size))
            .cloned()
    }
}

/// Read-only view over the three region sources.
pub struct RegionResolver<'a> {
    tracker: &'a AllocationTracker,
    globals: &'a GlobalTable,
    stacks: &'a StackRegistry,
}

impl<'a> RegionResolver<'a> {
    #[must_use]
    pub fn new(
        tracker: &'a AllocationTracker,
        globals: &'a GlobalTable,
        stacks: &'a StackRegistry,
    ) -> Self {
        Self {
            tracker,
            globals,
            stacks,
        }
    }

    /// Classify an untagged address.
    #[must_use]
    pub fn classify(&self, addr: usize) -> RegionClassification {
        if let Some(object) = self.tracker.nearest_object(addr) {
            return self.heap_hit(object, addr);
        }

        if self.globals.in_image(addr)
            && let Some(symbol) = self.globals.lookup(addr)
        {
            let relation = Relation::compute(addr, symbol.base, symbol.size);
            return RegionClassification::GlobalSymbol(GlobalHit { symbol, relation });
        }

        if let Some(region) = self.stacks.lookup(addr) {
            let relation = Relation::compute(addr, region.base, region.size);
            return RegionClassification::TaskStack(StackHit { region, relation });
        }

        if let Some(object) = self.tracker.nearest_neighbour(addr) {
            return self.heap_hit(object, addr);
        }

        RegionClassification::Unknown
    }

    fn heap_hit(&self, object: ObjectMetadata, addr: usize) -> RegionClassification {
        let relation = Relation::compute(addr, object.base, object.size);
        let page = PageInfo::of(addr, self.tracker.objects_on_page(addr));
        RegionClassification::HeapObject(HeapHit {
            object,
            relation,
            page,
        })
    }
}
