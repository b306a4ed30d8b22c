//! Report gate: one report at a time, never a report inside a report.
//!
//! Admission is a three-step check:
//! 1. the calling thread must not already be reporting (thread-local depth);
//! 2. outside multi-shot mode, the one-shot latch must win a test-and-set;
//! 3. the process-wide report lock is taken.
//!
//! The depth counter goes up before the lock is taken, so a thread waiting
//! for the lock already has its own checks disabled. [`ReportGuard`] undoes
//! everything on drop, including during unwinding.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

thread_local! {
    static REPORT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the calling thread is composing a report.
///
/// Accesses made while this is true are not validated.
#[must_use]
pub fn checking_disabled() -> bool {
    REPORT_DEPTH.with(Cell::get) > 0
}

/// Observable gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GateState {
    Idle,
    Reporting,
    /// Single-shot mode after the first report: nothing more gets through.
    Suppressed,
}

/// Why the gate turned a report away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Refusal {
    /// The thread is already inside a report.
    Recursion,
    /// A report was already emitted and multi-shot is off.
    Latched,
}

pub struct ReportGate {
    multi_shot: AtomicBool,
    latch: AtomicBool,
    active: AtomicBool,
    lock: Mutex<()>,
}

impl ReportGate {
    #[must_use]
    pub fn new(multi_shot: bool) -> Self {
        Self {
            multi_shot: AtomicBool::new(multi_shot),
            latch: AtomicBool::new(false),
            active: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    /// Try to start a report.
    pub fn enter(&self) -> Result<ReportGuard<'_>, Refusal> {
        if checking_disabled() {
            return Err(Refusal::Recursion);
        }
        if self.multi_shot.load(Ordering::Acquire) {
            self.latch.store(true, Ordering::Release);
        } else if self.latch.swap(true, Ordering::AcqRel) {
            return Err(Refusal::Latched);
        }

        REPORT_DEPTH.with(|d| d.set(d.get() + 1));
        let lock = self.lock.lock();
        self.active.store(true, Ordering::Release);
        Ok(ReportGuard {
            gate: self,
            lock: Some(lock),
        })
    }

    #[must_use]
    pub fn state(&self) -> GateState {
        if self.active.load(Ordering::Acquire) {
            GateState::Reporting
        } else if self.is_latched() && !self.multi_shot() {
            GateState::Suppressed
        } else {
            GateState::Idle
        }
    }

    /// Whether a report has ever been admitted. Never cleared.
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.latch.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn multi_shot(&self) -> bool {
        self.multi_shot.load(Ordering::Acquire)
    }

    /// Turn multi-shot on. Returns the previous setting.
    pub fn enable_multi_shot(&self) -> bool {
        self.multi_shot.swap(true, Ordering::AcqRel)
    }

    /// Undo [`enable_multi_shot`](Self::enable_multi_shot).
    pub fn restore_multi_shot(&self, previous: bool) {
        if !previous {
            self.multi_shot.store(false, Ordering::Release);
        }
    }
}

/// Proof of admission. Dropping it ends the report.
pub struct ReportGuard<'a> {
    gate: &'a ReportGate,
    lock: Option<MutexGuard<'a, ()>>,
}

impl Drop for ReportGuard<'_> {
    fn drop(&mut self) {
        self.gate.active.store(false, Ordering::Release);
        drop(self.lock.take());
        REPORT_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}
