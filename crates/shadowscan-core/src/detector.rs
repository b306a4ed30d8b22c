//! The detector: one explicit state object behind every entry point.
//!
//! ```no_run
//! use shadowscan_core::{AllocationEvent, Detector, DetectorConfig};
//!
//! let detector = Detector::new(DetectorConfig::default())?;
//! let base = 0x1000_0040;
//! detector.on_alloc(AllocationEvent::new(base, 16, "kmalloc-16"))?;
//! detector.check_access(base + 16, 1, true, 0x401234); // slab-out-of-bounds
//! # Ok::<(), shadowscan_core::DetectorError>(())
//! ```

use std::sync::Arc;

use serde::Serialize;

use crate::config::{DetectorConfig, HaltPolicy, global_config};
use crate::context::ContextId;
use crate::error::DetectorError;
use crate::gate::{self, GateState, Refusal, ReportGate};
use crate::metrics::DetectorMetrics;
use crate::region::{GlobalSymbol, GlobalTable, RegionResolver, StackRegion, StackRegistry};
use crate::report::{FaultKind, ReportBuilder};
use crate::shadow::{RedzoneKind, ShadowConfig, ShadowMemory, untag};
use crate::sink::{ReportSink, StderrSink};
use crate::stack::{StackDepot, StackTraceProvider};
use crate::tracker::{AllocationTracker, FreeResult, ObjectId, TrackRecord};
use crate::validator::{AccessInfo, AccessValidator};

/// Memory tag written over freed objects in tag mode.
const FREED_TAG: u8 = 0xFE;

/// An allocator handing out `[base, base + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationEvent<'a> {
    pub base: usize,
    pub size: usize,
    pub cache: &'a str,
    /// Memory tag for the object (tag mode only).
    pub tag: Option<u8>,
    /// Bytes of slab redzone following the object.
    pub redzone: usize,
}

impl<'a> AllocationEvent<'a> {
    #[must_use]
    pub fn new(base: usize, size: usize, cache: &'a str) -> Self {
        Self {
            base,
            size,
            cache,
            tag: None,
            redzone: 0,
        }
    }

    #[must_use]
    pub fn tagged(mut self, tag: u8) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Poison `redzone` bytes past the object as slab redzone. The granule
    /// holding the object's tail stays partial.
    #[must_use]
    pub fn with_redzone(mut self, redzone: usize) -> Self {
        self.redzone = redzone;
        self
    }
}

/// What happened to a checked access or free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckOutcome {
    Clean,
    /// A report was composed (or its composition was attempted).
    Reported(FaultKind),
    /// A fault was detected but the gate refused to report it.
    Suppressed(Refusal),
}

impl CheckOutcome {
    #[must_use]
    pub fn is_fault(&self) -> bool {
        !matches!(self, Self::Clean)
    }
}

pub struct Detector {
    config: DetectorConfig,
    shadow: ShadowMemory,
    tracker: AllocationTracker,
    globals: GlobalTable,
    stacks: StackRegistry,
    gate: ReportGate,
    metrics: DetectorMetrics,
    stack_provider: Arc<dyn StackTraceProvider>,
    sink: Arc<dyn ReportSink>,
}

impl Detector {
    /// Build a detector with a [`StackDepot`] and a [`StderrSink`].
    pub fn new(config: DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;
        let shadow = ShadowMemory::new(&ShadowConfig::from(&config))?;
        Ok(Self {
            shadow,
            tracker: AllocationTracker::new(config.quarantine_entries),
            globals: GlobalTable::new(),
            stacks: StackRegistry::new(),
            gate: ReportGate::new(config.multi_shot),
            metrics: DetectorMetrics::new(),
            stack_provider: Arc::new(StackDepot::new()),
            sink: Arc::new(StderrSink),
            config,
        })
    }

    /// Build from `SHADOWSCAN_OPTIONS`.
    pub fn from_env() -> Result<Self, DetectorError> {
        Self::new(global_config().clone())
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_stack_provider(mut self, provider: Arc<dyn StackTraceProvider>) -> Self {
        self.stack_provider = provider;
        self
    }

    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    #[must_use]
    pub fn shadow(&self) -> &ShadowMemory {
        &self.shadow
    }

    #[must_use]
    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    #[must_use]
    pub fn gate(&self) -> &ReportGate {
        &self.gate
    }

    #[must_use]
    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    #[must_use]
    pub fn metrics(&self) -> &DetectorMetrics {
        &self.metrics
    }

    /// Record an allocation: track the object, then unpoison and tag it and
    /// poison its redzone. A rejected allocation leaves the shadow untouched.
    pub fn on_alloc(&self, event: AllocationEvent<'_>) -> Result<ObjectId, DetectorError> {
        let base = self.untag(event.base);
        let tag = event
            .tag
            .unwrap_or_else(|| crate::shadow::pointer_tag(event.base));
        let out_of_window = DetectorError::OutOfWindow { addr: base, len: event.size };
        let (end, rz_start) = base
            .checked_add(event.size)
            .and_then(|end| Some((end, end.checked_next_multiple_of(self.shadow.granule())?)))
            .ok_or(out_of_window)?;
        let rz_len = end.saturating_add(event.redzone).saturating_sub(rz_start);

        // Shadow is only marked once the tracker has accepted the object.
        self.shadow.check_range(base, event.size)?;
        self.shadow.check_range(rz_start, rz_len)?;
        let track = TrackRecord::capture(self.stack_provider.as_ref());
        let id = self
            .tracker
            .record_alloc(base, event.size, event.cache, tag, track)?;

        self.shadow.unpoison(base, event.size)?;
        self.shadow.set_tag(base, event.size, tag)?;
        self.shadow.poison(rz_start, rz_len, RedzoneKind::HeapRedzone)?;
        DetectorMetrics::inc(&self.metrics.allocations);
        Ok(id)
    }

    /// Record a deallocation of the object at `addr`.
    ///
    /// Double and invalid frees are reported like any other fault.
    pub fn on_free(&self, addr: usize, fault_pc: usize) -> CheckOutcome {
        let base = self.untag(addr);
        let track = TrackRecord::capture(self.stack_provider.as_ref());
        match self.tracker.record_free(base, track) {
            FreeResult::Freed(object) => {
                let footprint = object.size.next_multiple_of(self.shadow.granule());
                // The object was unpoisoned on alloc, so the range is valid.
                let _ = self.shadow.poison(base, footprint, RedzoneKind::HeapFreed);
                let _ = self.shadow.set_tag(base, footprint, FREED_TAG);
                DetectorMetrics::inc(&self.metrics.frees);
                CheckOutcome::Clean
            }
            FreeResult::DoubleFree(object) => {
                DetectorMetrics::inc(&self.metrics.double_frees);
                self.report(AccessInfo::deallocation(&self.shadow, addr, object.size, fault_pc))
            }
            FreeResult::InvalidFree => {
                DetectorMetrics::inc(&self.metrics.invalid_frees);
                self.report(AccessInfo::deallocation(&self.shadow, addr, 1, fault_pc))
            }
        }
    }

    /// Instrumentation entry point for a read or write.
    pub fn check_access(&self, addr: usize, len: usize, is_write: bool, fault_pc: usize) -> CheckOutcome {
        DetectorMetrics::inc(&self.metrics.accesses_checked);
        if gate::checking_disabled() {
            DetectorMetrics::inc(&self.metrics.checks_skipped);
            return CheckOutcome::Clean;
        }
        match AccessValidator::new(&self.shadow).validate(addr, len, is_write, fault_pc) {
            None => CheckOutcome::Clean,
            Some(info) => self.report(info),
        }
    }

    /// Report a fault the caller has already validated.
    pub fn report(&self, info: AccessInfo) -> CheckOutcome {
        DetectorMetrics::inc(&self.metrics.faults_detected);
        let guard = match self.gate.enter() {
            Ok(guard) => guard,
            Err(refusal) => {
                let counter = match refusal {
                    Refusal::Recursion => &self.metrics.suppressed_recursion,
                    Refusal::Latched => &self.metrics.suppressed_latched,
                };
                DetectorMetrics::inc(counter);
                return CheckOutcome::Suppressed(refusal);
            }
        };

        let region = RegionResolver::new(&self.tracker, &self.globals, &self.stacks)
            .classify(info.untagged);
        let builder = ReportBuilder::new(
            &self.shadow,
            self.stack_provider.as_ref(),
            self.config.dump_radius,
        );
        let kind = match builder.build(&info, &region, &ContextId::current()) {
            Ok(report) => {
                if self.sink.write_report(&report).is_err() {
                    DetectorMetrics::inc(&self.metrics.sink_failures);
                }
                DetectorMetrics::inc(&self.metrics.reports_emitted);
                report.kind
            }
            Err(_) => {
                DetectorMetrics::inc(&self.metrics.reports_aborted);
                crate::report::classify_fault(&info, &region, &self.shadow)
            }
        };
        drop(guard);

        if self.config.halt_on_report {
            halt(self.config.halt_policy, kind);
        }
        CheckOutcome::Reported(kind)
    }

    /// Register a static variable followed by `redzone` bytes of redzone.
    pub fn register_global(
        &self,
        name: &str,
        base: usize,
        size: usize,
        redzone: usize,
    ) -> Result<(), DetectorError> {
        self.shadow.unpoison(base, size)?;
        let granule = self.shadow.granule();
        let rz_start = base
            .checked_add(size)
            .map(|end| end.next_multiple_of(granule))
            .ok_or(DetectorError::OutOfWindow { addr: base, len: size })?;
        let rz_end = base.saturating_add(size).saturating_add(redzone);
        if rz_end > rz_start {
            self.shadow
                .poison(rz_start, rz_end - rz_start, RedzoneKind::GlobalRedzone)?;
        }
        self.globals.register(GlobalSymbol {
            name: name.to_string(),
            base,
            size,
            redzone,
        });
        Ok(())
    }

    /// Register a task stack as addressable memory.
    pub fn register_stack(&self, context: ContextId, base: usize, size: usize) -> Result<(), DetectorError> {
        self.shadow.unpoison(base, size)?;
        self.stacks.register(StackRegion {
            context,
            base,
            size,
        });
        Ok(())
    }

    /// Forget a task stack and mark it unallocated again.
    pub fn unregister_stack(&self, context: &ContextId) -> Option<StackRegion> {
        let region = self.stacks.unregister(context)?;
        let _ = self
            .shadow
            .poison(region.base, region.size, RedzoneKind::Unallocated);
        Some(region)
    }

    fn untag(&self, addr: usize) -> usize {
        if self.shadow.tag_mode() { untag(addr) } else { addr }
    }
}

fn halt(policy: HaltPolicy, kind: FaultKind) {
    match policy {
        HaltPolicy::Abort => std::process::abort(),
        HaltPolicy::Panic => panic!("shadowscan: halting after {} report", kind.bug_type()),
    }
}
