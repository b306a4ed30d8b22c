//! Deterministic fault scenarios.
//!
//! Each scenario builds a fresh detector over the configured window, drives
//! one faulting sequence through it, and checks the bug type of the report
//! that comes out. Stack traces are disabled so report text is stable.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use shadowscan_core::shadow::{RedzoneKind, with_tag};
use shadowscan_core::{
    AllocationEvent, CheckOutcome, ContextId, Detector, DetectorConfig, DetectorError, MemorySink,
    MetricsSnapshot, NoStacks,
};

use crate::error::HarnessError;

/// Program counter attributed to every scenario access.
pub const SCENARIO_PC: usize = 0x40_1000;

/// Offset of the scenario object from the start of the window. Page-aligned,
/// so `heap-oob-left` faults on the page before the object.
const OBJECT_OFFSET: usize = 0x1000;

type Trigger = fn(&Detector, usize) -> Result<CheckOutcome, DetectorError>;

/// One named fault sequence.
pub struct Scenario {
    pub name: &'static str,
    /// Bug type the report must carry.
    pub bug_type: &'static str,
    pub summary: &'static str,
    /// Whether the detector must run with pointer tagging.
    pub tag_mode: bool,
    trigger: Trigger,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("bug_type", &self.bug_type)
            .field("tag_mode", &self.tag_mode)
            .finish_non_exhaustive()
    }
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "heap-oob-right",
        bug_type: "slab-out-of-bounds",
        summary: "1-byte write just past a 16-byte object",
        tag_mode: false,
        trigger: heap_oob_right,
    },
    Scenario {
        name: "heap-oob-left",
        bug_type: "slab-out-of-bounds",
        summary: "1-byte read just before a 16-byte object",
        tag_mode: false,
        trigger: heap_oob_left,
    },
    Scenario {
        name: "use-after-free",
        bug_type: "use-after-free",
        summary: "read inside a freed object",
        tag_mode: false,
        trigger: use_after_free,
    },
    Scenario {
        name: "double-free",
        bug_type: "double-free",
        summary: "second free of the same base",
        tag_mode: false,
        trigger: double_free,
    },
    Scenario {
        name: "invalid-free",
        bug_type: "invalid-free",
        summary: "free of a pointer into the middle of an object",
        tag_mode: false,
        trigger: invalid_free,
    },
    Scenario {
        name: "global-oob",
        bug_type: "global-out-of-bounds",
        summary: "read in the redzone after a registered global",
        tag_mode: false,
        trigger: global_oob,
    },
    Scenario {
        name: "stack-oob",
        bug_type: "stack-out-of-bounds",
        summary: "write into a mid-frame stack redzone",
        tag_mode: false,
        trigger: stack_oob,
    },
    Scenario {
        name: "use-after-scope",
        bug_type: "use-after-scope",
        summary: "read of a stack variable whose scope ended",
        tag_mode: false,
        trigger: use_after_scope,
    },
    Scenario {
        name: "null-deref",
        bug_type: "null-ptr-deref",
        summary: "8-byte read from the first page",
        tag_mode: false,
        trigger: null_deref,
    },
    Scenario {
        name: "wild-access",
        bug_type: "wild-memory-access",
        summary: "read far outside the monitored window",
        tag_mode: false,
        trigger: wild_access,
    },
    Scenario {
        name: "tag-mismatch",
        bug_type: "invalid-access",
        summary: "read through a pointer carrying a stale tag",
        tag_mode: true,
        trigger: tag_mismatch,
    },
];

/// Look a scenario up by name.
#[must_use]
pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

/// Outcome of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub expected: String,
    /// Bug type actually reported, if any.
    pub observed: Option<String>,
    pub passed: bool,
    pub outcome: CheckOutcome,
    pub report: Option<String>,
    pub duration_ms: u64,
    pub metrics: MetricsSnapshot,
}

impl Scenario {
    /// Run against a fresh detector derived from `base_config`.
    ///
    /// Halting is always turned off. The window must span at least two pages.
    pub fn run(&self, base_config: &DetectorConfig) -> Result<ScenarioResult, HarnessError> {
        let config = DetectorConfig {
            halt_on_report: false,
            tag_mode: self.tag_mode,
            ..base_config.clone()
        };
        let base = config.shadow_base + OBJECT_OFFSET;
        let sink = Arc::new(MemorySink::new());
        let detector = Detector::new(config)?
            .with_sink(sink.clone())
            .with_stack_provider(Arc::new(NoStacks));

        let started = Instant::now();
        let outcome = (self.trigger)(&detector, base)?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let report = sink.reports().into_iter().next();
        let observed = report.as_ref().map(|r| r.bug_type.to_string());
        Ok(ScenarioResult {
            scenario: self.name.to_string(),
            expected: self.bug_type.to_string(),
            passed: observed.as_deref() == Some(self.bug_type),
            observed,
            outcome,
            report: report.map(|r| r.text),
            duration_ms,
            metrics: detector.metrics().snapshot(),
        })
    }
}

/// Run every scenario in catalog order.
pub fn run_all(config: &DetectorConfig) -> Result<Vec<ScenarioResult>, HarnessError> {
    SCENARIOS.iter().map(|s| s.run(config)).collect()
}

fn heap_oob_right(d: &Detector, base: usize) -> Result<CheckOutcome, DetectorError> {
    d.on_alloc(AllocationEvent::new(base, 16, "kmalloc-16"))?;
    Ok(d.check_access(base + 16, 1, true, SCENARIO_PC))
}

fn heap_oob_left(d: &Detector, base: usize) -> Result<CheckOutcome, DetectorError> {
    d.on_alloc(AllocationEvent::new(base, 16, "kmalloc-16"))?;
    Ok(d.check_access(base - 1, 1, false, SCENARIO_PC))
}

fn use_after_free(d: &Detector, base: usize) -> Result<CheckOutcome, DetectorError> {
    d.on_alloc(AllocationEvent::new(base, 64, "kmalloc-64"))?;
    d.on_free(base, SCENARIO_PC);
    Ok(d.check_access(base + 8, 4, false, SCENARIO_PC))
}

fn double_free(d: &Detector, base: usize) -> Result<CheckOutcome, DetectorError> {
    d.on_alloc(AllocationEvent::new(base, 32, "kmalloc-32"))?;
    d.on_free(base, SCENARIO_PC);
    Ok(d.on_free(base, SCENARIO_PC))
}

fn invalid_free(d: &Detector, base: usize) -> Result<CheckOutcome, DetectorError> {
    d.on_alloc(AllocationEvent::new(base, 32, "kmalloc-32"))?;
    Ok(d.on_free(base + 8, SCENARIO_PC))
}

fn global_oob(d: &Detector, base: usize) -> Result<CheckOutcome, DetectorError> {
    d.register_global("scenario_table", base, 20, 44)?;
    Ok(d.check_access(base + 24, 4, false, SCENARIO_PC))
}

fn stack_oob(d: &Detector, base: usize) -> Result<CheckOutcome, DetectorError> {
    d.register_stack(ContextId::new("scenario", 1), base, 0x200)?;
    d.shadow().poison(base + 0x40, 32, RedzoneKind::StackMid)?;
    Ok(d.check_access(base + 0x40, 8, true, SCENARIO_PC))
}

fn use_after_scope(d: &Detector, base: usize) -> Result<CheckOutcome, DetectorError> {
    d.register_stack(ContextId::new("scenario", 1), base, 0x200)?;
    d.shadow()
        .poison(base + 0x80, 16, RedzoneKind::StackUseAfterScope)?;
    Ok(d.check_access(base + 0x80, 8, false, SCENARIO_PC))
}

fn null_deref(d: &Detector, _base: usize) -> Result<CheckOutcome, DetectorError> {
    Ok(d.check_access(0x10, 8, false, SCENARIO_PC))
}

fn wild_access(d: &Detector, _base: usize) -> Result<CheckOutcome, DetectorError> {
    let far = d.shadow().end().saturating_add(0x100_0000);
    Ok(d.check_access(far, 8, false, SCENARIO_PC))
}

fn tag_mismatch(d: &Detector, base: usize) -> Result<CheckOutcome, DetectorError> {
    d.on_alloc(AllocationEvent::new(base, 32, "kmalloc-32").tagged(0x2A))?;
    Ok(d.check_access(with_tag(base, 0x17), 8, false, SCENARIO_PC))
}
