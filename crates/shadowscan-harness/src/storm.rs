//! Concurrent report storms.
//!
//! Many threads overflow their own objects at once through one shared
//! detector. The gate must let exactly one report out in single-shot mode
//! and must never interleave reports in multi-shot mode.

use std::sync::{Arc, Barrier};

use serde::Serialize;

use shadowscan_core::{
    AllocationEvent, CheckOutcome, Detector, DetectorConfig, MemorySink, MetricsSnapshot, NoStacks,
};

use crate::error::HarnessError;
use crate::scenario::SCENARIO_PC;

/// Distance between per-thread objects.
const THREAD_STRIDE: usize = 0x100;
const OBJECT_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StormConfig {
    pub threads: usize,
    /// Overflowing accesses per thread.
    pub faults_per_thread: usize,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            faults_per_thread: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StormResult {
    pub threads: usize,
    pub faults_per_thread: usize,
    pub multi_shot: bool,
    pub reported: usize,
    pub suppressed: usize,
    /// Opening banners across everything the sink captured.
    pub banners: usize,
    pub passed: bool,
    pub metrics: MetricsSnapshot,
}

/// Run a storm with the multi-shot setting taken from `config`.
pub fn run_storm(config: &DetectorConfig, storm: StormConfig) -> Result<StormResult, HarnessError> {
    if storm.threads == 0 {
        return Err(HarnessError::NoThreads);
    }
    let config = DetectorConfig {
        halt_on_report: false,
        tag_mode: false,
        ..config.clone()
    };
    let multi_shot = config.multi_shot;
    let first = config.shadow_base + THREAD_STRIDE;
    let sink = Arc::new(MemorySink::new());
    let detector = Detector::new(config)?
        .with_sink(sink.clone())
        .with_stack_provider(Arc::new(NoStacks));

    for t in 0..storm.threads {
        let base = first + t * THREAD_STRIDE;
        detector.on_alloc(AllocationEvent::new(base, OBJECT_SIZE, "kmalloc-32"))?;
    }

    let barrier = Barrier::new(storm.threads);
    let outcomes = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..storm.threads)
            .map(|t| {
                let detector = &detector;
                let barrier = &barrier;
                scope.spawn(move || {
                    let base = first + t * THREAD_STRIDE;
                    barrier.wait();
                    (0..storm.faults_per_thread)
                        .map(|i| detector.check_access(base + OBJECT_SIZE + i, 1, true, SCENARIO_PC))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| HarnessError::WorkerPanicked))
            .collect::<Result<Vec<_>, _>>()
    })?;

    let outcomes: Vec<CheckOutcome> = outcomes.into_iter().flatten().collect();
    let reported = outcomes
        .iter()
        .filter(|o| matches!(o, CheckOutcome::Reported(_)))
        .count();
    let suppressed = outcomes
        .iter()
        .filter(|o| matches!(o, CheckOutcome::Suppressed(_)))
        .count();
    let banners = sink.banner_count();
    let total = storm.threads * storm.faults_per_thread;
    let expected = if multi_shot { total } else { total.min(1) };

    Ok(StormResult {
        threads: storm.threads,
        faults_per_thread: storm.faults_per_thread,
        multi_shot,
        reported,
        suppressed,
        banners,
        passed: banners == expected && reported == expected && reported + suppressed == total,
        metrics: detector.metrics().snapshot(),
    })
}
