//! Fault classification and report composition.
//!
//! A report is rendered into a single pre-reserved `String` and handed to a
//! sink as a whole. Lookup failures degrade to placeholder text. Only a
//! failure to reserve the buffer aborts the report.
//!
//! Layout:
//!
//! ```text
//! ==================================================================
//! BUG: shadowscan: slab-out-of-bounds in 0x401234
//! Write of size 1 at addr 0x10000050 by task main/1
//!
//! Allocated by task main/1:
//!  ...
//!
//! Memory state around the buggy address:
//!  0000000010000000: fe fe fe ...
//! >0000000010000080: fe fe 00 00 fc ...
//!                          ^
//! ==================================================================
//! ```

use std::fmt::Write as _;

use serde::Serialize;

use crate::context::ContextId;
use crate::error::ReportError;
use crate::region::{GlobalHit, HeapHit, RegionClassification, Relation, RelationKind, StackHit};
use crate::shadow::{RedzoneKind, ShadowByte, ShadowMemory};
use crate::stack::{Frame, StackTraceProvider};
use crate::tracker::TrackRecord;
use crate::validator::{AccessDirection, AccessInfo};

/// Shadow bytes per dump row.
pub const SHADOW_BYTES_PER_ROW: usize = 16;

/// Shadow bytes printed between separating spaces.
pub const SHADOW_BYTES_PER_BLOCK: usize = 1;

/// Opening and closing banner.
pub const BANNER: &str = "==================================================================";

/// Placeholder for a track whose stack cannot be expanded.
pub const STACK_UNAVAILABLE: &str = "(stack is not available)";

/// Addresses below this are reported as null dereferences.
pub const NULL_GUARD: usize = 4096;

/// Upper bound on the reserved report buffer.
pub const MAX_REPORT_BYTES: usize = 64 * 1024;

/// Frames printed per trace.
const MAX_PRINTED_FRAMES: usize = 32;

/// Frames dropped from a trace captured while reporting.
const REPORT_SKIP_FRAMES: usize = 4;

/// Region family named in out-of-bounds bug types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultRegion {
    Heap,
    Global,
    Stack,
    Unknown,
}

/// Why an access faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FaultKind {
    UseAfterFree,
    DoubleFree,
    InvalidFree,
    NullDeref,
    WildPointer,
    TagMismatch,
    UseAfterScope,
    OutOfBounds {
        direction: AccessDirection,
        region: FaultRegion,
    },
}

impl FaultKind {
    /// Short bug-type string printed on the `BUG:` line.
    #[must_use]
    pub fn bug_type(&self) -> &'static str {
        match self {
            Self::UseAfterFree => "use-after-free",
            Self::DoubleFree => "double-free",
            Self::InvalidFree => "invalid-free",
            Self::NullDeref => "null-ptr-deref",
            Self::WildPointer => "wild-memory-access",
            Self::TagMismatch => "invalid-access",
            Self::UseAfterScope => "use-after-scope",
            Self::OutOfBounds { region, .. } => match region {
                FaultRegion::Heap => "slab-out-of-bounds",
                FaultRegion::Global => "global-out-of-bounds",
                FaultRegion::Stack => "stack-out-of-bounds",
                FaultRegion::Unknown => "out-of-bounds",
            },
        }
    }
}

/// Decide the fault kind. First matching rule wins.
#[must_use]
pub fn classify_fault(
    info: &AccessInfo,
    region: &RegionClassification,
    shadow: &ShadowMemory,
) -> FaultKind {
    if info.direction == AccessDirection::Free {
        return match region {
            RegionClassification::HeapObject(hit)
                if hit.object.is_freed() && hit.object.base == info.untagged =>
            {
                FaultKind::DoubleFree
            }
            _ => FaultKind::InvalidFree,
        };
    }

    let redzone = match shadow.classify(info.first_bad_address) {
        ShadowByte::Redzone(kind) if shadow.contains(info.first_bad_address) => Some(kind),
        _ => None,
    };

    if let RegionClassification::HeapObject(hit) = region
        && hit.object.is_freed()
        && (hit.relation.kind == RelationKind::Inside || redzone == Some(RedzoneKind::HeapFreed))
    {
        return FaultKind::UseAfterFree;
    }
    if redzone == Some(RedzoneKind::HeapFreed) {
        return FaultKind::UseAfterFree;
    }
    if info.untagged < NULL_GUARD {
        return FaultKind::NullDeref;
    }
    if *region == RegionClassification::Unknown && !shadow.contains(info.first_bad_address) {
        return FaultKind::WildPointer;
    }
    if info.tag_mismatch && shadow.first_invalid_byte(info.untagged, info.len).is_none() {
        return FaultKind::TagMismatch;
    }
    if redzone == Some(RedzoneKind::StackUseAfterScope) {
        return FaultKind::UseAfterScope;
    }

    let family = match region {
        RegionClassification::HeapObject(_) => FaultRegion::Heap,
        RegionClassification::GlobalSymbol(_) => FaultRegion::Global,
        RegionClassification::TaskStack(_) => FaultRegion::Stack,
        RegionClassification::Unknown => match redzone {
            Some(RedzoneKind::HeapRedzone) => FaultRegion::Heap,
            Some(RedzoneKind::GlobalRedzone) => FaultRegion::Global,
            Some(RedzoneKind::StackLeft | RedzoneKind::StackMid | RedzoneKind::StackRight) => {
                FaultRegion::Stack
            }
            _ => FaultRegion::Unknown,
        },
    };
    FaultKind::OutOfBounds {
        direction: info.direction,
        region: family,
    }
}

/// Width of a dump row prefix: marker, address digits, `": "`.
#[must_use]
pub const fn header_width() -> usize {
    1 + 2 * std::mem::size_of::<usize>() + 2
}

/// Column of the caret under shadow byte `k` of the current row.
#[must_use]
pub const fn caret_column(k: usize) -> usize {
    caret_column_with(header_width(), k, SHADOW_BYTES_PER_BLOCK)
}

/// Caret column for an arbitrary header width and block size.
#[must_use]
pub const fn caret_column_with(header_width: usize, k: usize, block: usize) -> usize {
    header_width + 2 * k + k / block
}

/// A composed report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub kind: FaultKind,
    pub bug_type: &'static str,
    pub access: AccessInfo,
    pub context: ContextId,
    pub text: String,
}

/// Composes report text from a classified fault.
pub struct ReportBuilder<'a> {
    shadow: &'a ShadowMemory,
    stacks: &'a dyn StackTraceProvider,
    dump_radius: usize,
    max_bytes: usize,
}

impl<'a> ReportBuilder<'a> {
    #[must_use]
    pub fn new(shadow: &'a ShadowMemory, stacks: &'a dyn StackTraceProvider, dump_radius: usize) -> Self {
        Self {
            shadow,
            stacks,
            dump_radius,
            max_bytes: MAX_REPORT_BYTES,
        }
    }

    /// Override the buffer ceiling.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Bytes reserved up front for one report.
    #[must_use]
    pub fn estimated_len(&self) -> usize {
        let rows = 2 * self.dump_radius + 1;
        let row_len = header_width() + 3 * SHADOW_BYTES_PER_ROW + 1;
        2048 + (rows + 1) * row_len
    }

    /// Classify and render. `context` is the faulting thread.
    pub fn build(
        &self,
        info: &AccessInfo,
        region: &RegionClassification,
        context: &ContextId,
    ) -> Result<Report, ReportError> {
        let kind = classify_fault(info, region, self.shadow);
        let estimate = self.estimated_len();
        if estimate > self.max_bytes {
            return Err(ReportError::Exhausted(estimate));
        }
        let mut out = String::new();
        out.try_reserve(estimate)
            .map_err(|_| ReportError::Exhausted(estimate))?;

        writeln!(out, "{BANNER}")?;
        writeln!(
            out,
            "BUG: shadowscan: {} in {:#x}",
            kind.bug_type(),
            info.fault_pc
        )?;
        writeln!(
            out,
            "{} of size {} at addr {:#x} by task {context}",
            info.direction.label(),
            info.len,
            info.address
        )?;
        if info.tag_mismatch
            && let (Some(ptr), Some(mem)) = (info.pointer_tag, info.memory_tag)
        {
            writeln!(out, "Pointer tag: [{ptr:02x}], memory tag: [{mem:02x}]")?;
        }
        out.push('\n');

        match region {
            RegionClassification::HeapObject(hit) => self.write_heap(&mut out, hit)?,
            RegionClassification::GlobalSymbol(hit) => write_global(&mut out, hit, info.untagged)?,
            RegionClassification::TaskStack(hit) => write_stack(&mut out, hit)?,
            RegionClassification::Unknown => {
                writeln!(out, "Call trace:")?;
                let frames = self
                    .stacks
                    .capture(REPORT_SKIP_FRAMES)
                    .and_then(|h| self.stacks.expand(h));
                write_frames(&mut out, frames.as_deref())?;
            }
        }
        out.push('\n');

        self.write_shadow_dump(&mut out, info.first_bad_address)?;
        writeln!(out, "{BANNER}")?;

        Ok(Report {
            kind,
            bug_type: kind.bug_type(),
            access: *info,
            context: context.clone(),
            text: out,
        })
    }

    fn write_heap(&self, out: &mut String, hit: &HeapHit) -> Result<(), ReportError> {
        let object = &hit.object;
        self.write_track(out, "Allocated", &object.alloc_track)?;
        out.push('\n');
        match &object.free_track {
            Some(track) => self.write_track(out, "Freed", track)?,
            None => writeln!(out, "Freed: not available")?,
        }
        out.push('\n');

        writeln!(
            out,
            "The buggy address belongs to the object at {:#x}",
            object.base
        )?;
        writeln!(
            out,
            " which belongs to the cache {} of size {}",
            object.cache, object.size
        )?;
        write_location(out, &hit.relation, object.base, object.size)?;
        out.push('\n');
        writeln!(out, "The buggy address belongs to the page:")?;
        writeln!(
            out,
            " page:{:#x} addr:{:#x} objects:{}",
            hit.page.number, hit.page.base, hit.page.objects
        )?;
        Ok(())
    }

    fn write_track(&self, out: &mut String, prefix: &str, track: &TrackRecord) -> Result<(), ReportError> {
        writeln!(out, "{prefix} by task {}:", track.context)?;
        let frames = track.stack.and_then(|h| self.stacks.expand(h));
        write_frames(out, frames.as_deref())
    }

    fn write_shadow_dump(&self, out: &mut String, addr: usize) -> Result<(), ReportError> {
        const ROW: i128 = SHADOW_BYTES_PER_ROW as i128;
        let granule = self.shadow.granule() as i128;
        let base = self.shadow.base() as i128;
        let width = 2 * std::mem::size_of::<usize>();

        // Indices are extrapolated for addresses outside the window.
        let idx = (addr as i128 - base).div_euclid(granule);
        let row_start = idx - idx.rem_euclid(ROW);
        let k = (idx - row_start) as usize;
        let radius = self.dump_radius as i128;

        writeln!(out, "Memory state around the buggy address:")?;
        let mut row = [0u8; SHADOW_BYTES_PER_ROW];
        for i in -radius..=radius {
            let first = row_start + i * ROW;
            self.shadow
                .copy_row(isize::try_from(first).unwrap_or(isize::MIN), &mut row);
            let row_addr = (base + first * granule) as usize;
            let marker = if i == 0 { '>' } else { ' ' };
            write!(out, "{marker}{row_addr:0width$x}: ")?;
            for (j, byte) in row.iter().enumerate() {
                write!(out, "{byte:02x}")?;
                if (j + 1) % SHADOW_BYTES_PER_BLOCK == 0 && j + 1 < SHADOW_BYTES_PER_ROW {
                    out.push(' ');
                }
            }
            out.push('\n');
            if i == 0 {
                writeln!(out, "{:col$}^", "", col = caret_column(k))?;
            }
        }
        Ok(())
    }
}

fn write_frames(out: &mut String, frames: Option<&[Frame]>) -> Result<(), ReportError> {
    match frames {
        Some(frames) if !frames.is_empty() => {
            for frame in frames.iter().take(MAX_PRINTED_FRAMES) {
                writeln!(out, " {frame}")?;
            }
        }
        _ => writeln!(out, "{STACK_UNAVAILABLE}")?,
    }
    Ok(())
}

fn write_location(out: &mut String, relation: &Relation, base: usize, size: usize) -> Result<(), ReportError> {
    writeln!(
        out,
        "The buggy address is located {} bytes {} of",
        relation.distance,
        relation.phrase()
    )?;
    writeln!(
        out,
        " {size}-byte region [{base:#x}, {:#x})",
        base.saturating_add(size)
    )?;
    Ok(())
}

fn write_global(out: &mut String, hit: &GlobalHit, addr: usize) -> Result<(), ReportError> {
    let symbol = &hit.symbol;
    writeln!(out, "The buggy address belongs to the variable:")?;
    writeln!(
        out,
        " {}+{:#x}/{:#x}",
        symbol.name,
        addr.wrapping_sub(symbol.base),
        symbol.size
    )?;
    write_location(out, &hit.relation, symbol.base, symbol.size)
}

fn write_stack(out: &mut String, hit: &StackHit) -> Result<(), ReportError> {
    writeln!(
        out,
        "The buggy address belongs to stack of task {}",
        hit.region.context
    )?;
    write_location(out, &hit.relation, hit.region.base, hit.region.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{GlobalSymbol, PageInfo, StackRegion};
    use crate::shadow::ShadowConfig;
    use crate::stack::{NoStacks, StackDepot};
    use crate::tracker::{ObjectId, ObjectMetadata};
    use crate::validator::AccessValidator;

    const BASE: usize = 0x1000_0000;

    fn shadow() -> ShadowMemory {
        ShadowMemory::new(&ShadowConfig {
            base: BASE,
            len: 64 * 1024,
            granule: 8,
            tag_mode: false,
        })
        .unwrap()
    }

    fn object(base: usize, size: usize, freed: bool) -> ObjectMetadata {
        let track = TrackRecord {
            context: ContextId::new("main", 1),
            stack: None,
        };
        ObjectMetadata {
            id: ObjectId {
                shard: 0,
                slot: 0,
                generation: 1,
            },
            cache: "kmalloc-16".into(),
            base,
            size,
            tag: 0,
            alloc_track: track.clone(),
            free_track: freed.then_some(track),
        }
    }

    fn heap(base: usize, size: usize, freed: bool, addr: usize) -> RegionClassification {
        RegionClassification::HeapObject(HeapHit {
            object: object(base, size, freed),
            relation: Relation::compute(addr, base, size),
            page: PageInfo::of(addr, 1),
        })
    }

    fn caret_offset(text: &str) -> (usize, usize) {
        let lines: Vec<&str> = text.lines().collect();
        let current = lines.iter().position(|l| l.starts_with('>')).unwrap();
        let caret = lines[current + 1].find('^').unwrap();
        (current, caret)
    }

    #[test]
    fn bug_type_strings() {
        assert_eq!(FaultKind::UseAfterFree.bug_type(), "use-after-free");
        assert_eq!(FaultKind::TagMismatch.bug_type(), "invalid-access");
        assert_eq!(
            FaultKind::OutOfBounds {
                direction: AccessDirection::Read,
                region: FaultRegion::Global
            }
            .bug_type(),
            "global-out-of-bounds"
        );
    }

    #[test]
    fn caret_formula() {
        assert_eq!(header_width(), 1 + 2 * std::mem::size_of::<usize>() + 2);
        assert_eq!(caret_column_with(19, 0, 1), 19);
        assert_eq!(caret_column_with(19, 5, 1), 34);
        assert_eq!(caret_column_with(19, 15, 1), 64);
        assert_eq!(caret_column_with(19, 5, 4), 30);
    }

    #[test]
    fn heap_right_overflow_report() {
        let s = shadow();
        let b = BASE + 0x40;
        s.unpoison(b, 16).unwrap();
        s.poison(b + 16, 16, RedzoneKind::HeapRedzone).unwrap();
        let info = AccessValidator::new(&s)
            .validate(b + 16, 1, true, 0x401234)
            .unwrap();
        let region = heap(b, 16, false, b + 16);
        let report = ReportBuilder::new(&s, &NoStacks, 2)
            .build(&info, &region, &ContextId::new("main", 1))
            .unwrap();

        assert_eq!(report.bug_type, "slab-out-of-bounds");
        let lines: Vec<&str> = report.text.lines().collect();
        assert_eq!(lines[0], BANNER);
        assert_eq!(lines[1], "BUG: shadowscan: slab-out-of-bounds in 0x401234");
        assert_eq!(
            lines[2],
            format!("Write of size 1 at addr {:#x} by task main/1", b + 16)
        );
        assert_eq!(*lines.last().unwrap(), BANNER);
        assert!(report.text.contains("Allocated by task main/1:\n(stack is not available)"));
        assert!(report.text.contains("Freed: not available"));
        assert!(report.text.contains("The buggy address is located 0 bytes to the right of\n 16-byte region"));
        assert!(report.text.contains(&format!(
            "The buggy address belongs to the page:\n page:{:#x} addr:{:#x} objects:1\n",
            BASE / 4096,
            BASE
        )));
        assert!(!report.text.contains("Pointer tag"));
        assert_eq!(report.text.matches('>').count(), 1);
    }

    #[test]
    fn page_section_names_the_faulting_page() {
        let s = shadow();
        let b = BASE + 0x1000;
        s.poison(b - 16, 16, RedzoneKind::HeapRedzone).unwrap();
        s.unpoison(b, 16).unwrap();
        let info = AccessValidator::new(&s).validate(b - 1, 1, false, 0).unwrap();
        let region = RegionClassification::HeapObject(HeapHit {
            object: object(b, 16, false),
            relation: Relation::compute(b - 1, b, 16),
            page: PageInfo::of(b - 1, 0),
        });
        let text = ReportBuilder::new(&s, &NoStacks, 1)
            .build(&info, &region, &ContextId::new("t", 2))
            .unwrap()
            .text;
        assert!(text.contains("located 1 bytes to the left of"));
        assert!(text.contains(&format!(
            " page:{:#x} addr:{:#x} objects:0\n",
            BASE / 4096,
            BASE
        )));
    }

    #[test]
    fn match_all_pointer_prints_no_tag_line() {
        let s = ShadowMemory::new(&ShadowConfig {
            base: BASE,
            len: 64 * 1024,
            granule: 8,
            tag_mode: true,
        })
        .unwrap();
        let b = BASE + 0x40;
        s.unpoison(b, 16).unwrap();
        s.set_tag(b, 16, 0x2A).unwrap();
        s.poison(b + 16, 16, RedzoneKind::HeapRedzone).unwrap();
        let v = AccessValidator::new(&s);

        let bounds = v
            .validate(crate::shadow::with_tag(b + 16, crate::shadow::MATCH_ALL_TAG), 1, false, 0)
            .unwrap();
        assert!(!bounds.tag_mismatch);
        let text = ReportBuilder::new(&s, &NoStacks, 0)
            .build(&bounds, &heap(b, 16, false, b + 16), &ContextId::new("t", 2))
            .unwrap()
            .text;
        assert!(text.contains("slab-out-of-bounds"));
        assert!(!text.contains("Pointer tag"));

        let stale = v
            .validate(crate::shadow::with_tag(b, 0x17), 8, false, 0)
            .unwrap();
        let text = ReportBuilder::new(&s, &NoStacks, 0)
            .build(&stale, &heap(b, 16, false, b), &ContextId::new("t", 2))
            .unwrap()
            .text;
        assert!(text.contains("Pointer tag: [17], memory tag: [2a]"));
    }

    #[test]
    fn caret_points_at_faulting_granule() {
        let s = shadow();
        for granule_in_row in [0usize, 7, 15] {
            let addr = BASE + 0x100 + granule_in_row * 8;
            let info = AccessValidator::new(&s).validate(addr, 1, false, 0).unwrap();
            let report = ReportBuilder::new(&s, &NoStacks, 1)
                .build(&info, &RegionClassification::Unknown, &ContextId::new("t", 2))
                .unwrap();
            let (_, caret) = caret_offset(&report.text);
            assert_eq!(caret, caret_column(granule_in_row), "k={granule_in_row}");
        }
    }

    #[test]
    fn dump_has_two_r_plus_one_rows() {
        let s = shadow();
        let info = AccessValidator::new(&s).validate(BASE + 0x400, 1, false, 0).unwrap();
        let report = ReportBuilder::new(&s, &NoStacks, 3)
            .build(&info, &RegionClassification::Unknown, &ContextId::new("t", 2))
            .unwrap();
        let rows = report
            .text
            .lines()
            .filter(|l| l.len() > header_width() && l.as_bytes()[header_width() - 2] == b':')
            .count();
        assert_eq!(rows, 7);
    }

    #[test]
    fn dump_outside_window_reads_unallocated() {
        let s = shadow();
        let info = AccessValidator::new(&s).validate(BASE, 1, false, 0).unwrap();
        let report = ReportBuilder::new(&s, &NoStacks, 1)
            .build(&info, &RegionClassification::Unknown, &ContextId::new("t", 2))
            .unwrap();
        let first_row = report
            .text
            .lines()
            .find(|l| l.starts_with(' ') && l.contains(": fe"))
            .unwrap();
        assert!(first_row.ends_with("fe fe fe fe"));
    }

    #[test]
    fn classification_rules() {
        let s = shadow();
        let b = BASE + 0x80;
        s.poison(b, 16, RedzoneKind::HeapFreed).unwrap();
        let v = AccessValidator::new(&s);

        let uaf = v.validate(b + 4, 4, false, 0).unwrap();
        assert_eq!(
            classify_fault(&uaf, &heap(b, 16, true, b + 4), &s),
            FaultKind::UseAfterFree
        );

        let free = AccessInfo::deallocation(&s, b, 16, 0);
        assert_eq!(
            classify_fault(&free, &heap(b, 16, true, b), &s),
            FaultKind::DoubleFree
        );
        assert_eq!(
            classify_fault(&free, &RegionClassification::Unknown, &s),
            FaultKind::InvalidFree
        );

        let null = v.validate(0x10, 8, false, 0).unwrap();
        assert_eq!(
            classify_fault(&null, &RegionClassification::Unknown, &s),
            FaultKind::NullDeref
        );

        let wild = v.validate(0xDEAD_0000_0000, 8, true, 0).unwrap();
        assert_eq!(
            classify_fault(&wild, &RegionClassification::Unknown, &s),
            FaultKind::WildPointer
        );

        s.poison(BASE + 0x200, 32, RedzoneKind::StackUseAfterScope).unwrap();
        let scope = v.validate(BASE + 0x208, 8, false, 0).unwrap();
        assert_eq!(
            classify_fault(&scope, &RegionClassification::Unknown, &s),
            FaultKind::UseAfterScope
        );

        s.poison(BASE + 0x300, 32, RedzoneKind::StackLeft).unwrap();
        let stack = v.validate(BASE + 0x300, 8, true, 0).unwrap();
        assert_eq!(
            classify_fault(&stack, &RegionClassification::Unknown, &s).bug_type(),
            "stack-out-of-bounds"
        );
    }

    #[test]
    fn global_and_stack_sections() {
        let s = shadow();
        let info = AccessValidator::new(&s).validate(BASE + 0x24, 1, false, 0).unwrap();
        let global = RegionClassification::GlobalSymbol(GlobalHit {
            symbol: GlobalSymbol {
                name: "table".into(),
                base: BASE + 0x20,
                size: 4,
                redzone: 28,
            },
            relation: Relation::compute(BASE + 0x24, BASE + 0x20, 4),
        });
        let text = ReportBuilder::new(&s, &NoStacks, 0)
            .build(&info, &global, &ContextId::new("t", 2))
            .unwrap()
            .text;
        assert!(text.contains("global-out-of-bounds"));
        assert!(text.contains("The buggy address belongs to the variable:\n table+0x4/0x4"));

        let stack = RegionClassification::TaskStack(StackHit {
            region: StackRegion {
                context: ContextId::new("worker", 9),
                base: BASE + 0x20,
                size: 64,
            },
            relation: Relation::compute(BASE + 0x24, BASE + 0x20, 64),
        });
        let text = ReportBuilder::new(&s, &NoStacks, 0)
            .build(&info, &stack, &ContextId::new("t", 2))
            .unwrap()
            .text;
        assert!(text.contains("belongs to stack of task worker/9"));
        assert!(text.contains("located 4 bytes inside of"));
    }

    #[test]
    fn saved_frames_are_expanded() {
        let s = shadow();
        let depot = StackDepot::new();
        let handle = depot.save(&[Frame::new("alloc_widget")]).unwrap();
        let mut obj = object(BASE + 0x40, 16, false);
        obj.alloc_track.stack = Some(handle);
        let region = RegionClassification::HeapObject(HeapHit {
            relation: Relation::compute(BASE + 0x50, obj.base, obj.size),
            object: obj,
            page: PageInfo::of(BASE + 0x50, 1),
        });
        let info = AccessValidator::new(&s).validate(BASE + 0x50, 1, false, 0).unwrap();
        let text = ReportBuilder::new(&s, &depot, 0)
            .build(&info, &region, &ContextId::new("t", 2))
            .unwrap()
            .text;
        assert!(text.contains("Allocated by task main/1:\n alloc_widget\n"));
    }

    #[test]
    fn exhausted_buffer_aborts_report() {
        let s = shadow();
        let info = AccessValidator::new(&s).validate(BASE, 1, false, 0).unwrap();
        let result = ReportBuilder::new(&s, &NoStacks, 2)
            .with_max_bytes(128)
            .build(&info, &RegionClassification::Unknown, &ContextId::new("t", 2));
        assert!(matches!(result, Err(ReportError::Exhausted(_))));
    }
}
