//! Report gate behavior observed through the detector: serialization,
//! recursion refusal, one-shot latching and quiet counting.

use std::sync::{Arc, Barrier, OnceLock, Weak};

use parking_lot::Mutex;
use shadowscan_core::report::Report;
use shadowscan_core::{
    AllocationEvent, CheckOutcome, Detector, DetectorConfig, GateState, MemorySink, NoStacks,
    Refusal, ReportSink,
};

const BASE: usize = 0x1000_0000;

fn config(multi_shot: bool) -> DetectorConfig {
    DetectorConfig {
        multi_shot,
        ..DetectorConfig::default()
    }
}

fn detector(multi_shot: bool) -> (Arc<Detector>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let detector = Detector::new(config(multi_shot))
        .expect("valid config")
        .with_sink(sink.clone())
        .with_stack_provider(Arc::new(NoStacks));
    (Arc::new(detector), sink)
}

#[test]
fn concurrent_faults_emit_exactly_one_banner() {
    const THREADS: usize = 8;
    let (detector, sink) = detector(false);
    for i in 0..THREADS {
        detector
            .on_alloc(AllocationEvent::new(BASE + i * 0x100, 16, "kmalloc-16"))
            .unwrap();
    }

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let detector = Arc::clone(&detector);
            let barrier = Arc::clone(&barrier);
            std::thread::Builder::new()
                .name(format!("faulter-{i}"))
                .spawn(move || {
                    barrier.wait();
                    detector.check_access(BASE + i * 0x100 + 16, 4, true, 0x40_1000 + i)
                })
                .unwrap()
        })
        .collect();
    let outcomes: Vec<CheckOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(sink.banner_count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, CheckOutcome::Reported(_)))
            .count(),
        1
    );
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o, CheckOutcome::Reported(_) | CheckOutcome::Suppressed(Refusal::Latched)))
    );
    let snap = detector.metrics().snapshot();
    assert_eq!(snap.faults_detected, THREADS as u64);
    assert_eq!(snap.suppressed_latched, THREADS as u64 - 1);
    assert_eq!(detector.gate_state(), GateState::Suppressed);
}

#[test]
fn multi_shot_concurrent_reports_do_not_interleave() {
    const THREADS: usize = 6;
    let (detector, sink) = detector(true);
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let detector = Arc::clone(&detector);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                detector.check_access(BASE + 0x4000 + i * 0x80, 8, false, 0)
            })
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap().is_fault());
    }
    let reports = sink.reports();
    assert_eq!(reports.len(), THREADS);
    for report in &reports {
        let banners = report
            .text
            .lines()
            .filter(|l| *l == shadowscan_core::report::BANNER)
            .count();
        assert_eq!(banners, 2, "each report carries its own banners");
        assert_eq!(report.text.matches("BUG: shadowscan:").count(), 1);
    }
    assert_eq!(detector.gate_state(), GateState::Idle);
}

/// Sink that faults again while the outer report is being written.
struct ReentrantSink {
    detector: OnceLock<Weak<Detector>>,
    inner: MemorySink,
    nested: Mutex<Vec<CheckOutcome>>,
}

impl ReportSink for ReentrantSink {
    fn write_report(&self, report: &Report) -> std::io::Result<()> {
        if let Some(detector) = self.detector.get().and_then(Weak::upgrade) {
            let mut nested = self.nested.lock();
            nested.push(detector.check_access(0xDEAD_0000_0000, 8, false, 0));
            nested.push(detector.report(report.access));
        }
        self.inner.write_report(report)
    }
}

#[test]
fn fault_inside_report_produces_no_nested_report() {
    let sink = Arc::new(ReentrantSink {
        detector: OnceLock::new(),
        inner: MemorySink::new(),
        nested: Mutex::new(Vec::new()),
    });
    let detector = Arc::new(
        Detector::new(config(true))
            .unwrap()
            .with_sink(sink.clone())
            .with_stack_provider(Arc::new(NoStacks)),
    );
    sink.detector.set(Arc::downgrade(&detector)).unwrap();

    assert!(detector.check_access(BASE + 0x200, 1, true, 0).is_fault());

    assert_eq!(sink.inner.banner_count(), 1);
    assert_eq!(
        *sink.nested.lock(),
        vec![
            CheckOutcome::Clean,
            CheckOutcome::Suppressed(Refusal::Recursion)
        ]
    );
    assert_eq!(detector.gate_state(), GateState::Idle);
    let snap = detector.metrics().snapshot();
    assert_eq!(snap.checks_skipped, 1);
    assert_eq!(snap.suppressed_recursion, 1);
    assert_eq!(snap.reports_emitted, 1);

    // Checking works again once the report is done.
    assert!(detector.check_access(BASE + 0x300, 1, true, 0).is_fault());
    assert_eq!(sink.inner.banner_count(), 2);
}

#[test]
fn quiet_faults_are_still_counted() {
    let (detector, sink) = detector(false);
    for i in 0..5 {
        assert!(detector.check_access(BASE + i * 8, 1, false, 0).is_fault());
    }
    assert_eq!(sink.len(), 1);
    let snap = detector.metrics().snapshot();
    assert_eq!(snap.faults_detected, 5);
    assert_eq!(snap.reports_emitted, 1);
    assert_eq!(snap.suppressed(), 4);
}

#[test]
fn temporary_multi_shot_reopens_the_latch() {
    let (detector, sink) = detector(false);
    assert!(detector.check_access(BASE, 1, false, 0).is_fault());
    assert_eq!(
        detector.check_access(BASE, 1, false, 0),
        CheckOutcome::Suppressed(Refusal::Latched)
    );

    let previous = detector.gate().enable_multi_shot();
    assert!(matches!(
        detector.check_access(BASE, 1, false, 0),
        CheckOutcome::Reported(_)
    ));
    detector.gate().restore_multi_shot(previous);

    assert_eq!(
        detector.check_access(BASE, 1, false, 0),
        CheckOutcome::Suppressed(Refusal::Latched)
    );
    assert_eq!(sink.len(), 2);
    assert!(detector.gate().is_latched());
}
