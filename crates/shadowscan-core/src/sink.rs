//! Report destinations.
//!
//! Sinks are best-effort: the detector counts a failed write and moves on.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::report::{BANNER, Report};
use crate::structured_log::{LogEmitter, LogEntry};

/// Receives every admitted report.
pub trait ReportSink: Send + Sync {
    fn write_report(&self, report: &Report) -> std::io::Result<()>;
}

/// Writes report text to standard error in one locked write.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl ReportSink for StderrSink {
    fn write_report(&self, report: &Report) -> std::io::Result<()> {
        let mut err = std::io::stderr().lock();
        err.write_all(report.text.as_bytes())?;
        err.flush()
    }
}

/// Keeps reports in memory. Used by tests and the harness.
#[derive(Default)]
pub struct MemorySink {
    reports: Mutex<Vec<Report>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opening banners across all captured reports.
    #[must_use]
    pub fn banner_count(&self) -> usize {
        self.reports
            .lock()
            .iter()
            .map(|r| r.text.lines().filter(|l| *l == BANNER).count() / 2)
            .sum()
    }

    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

impl ReportSink for MemorySink {
    fn write_report(&self, report: &Report) -> std::io::Result<()> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

/// Emits one `fault_report` JSONL entry per report, text in `details`.
pub struct JsonlSink {
    emitter: Mutex<LogEmitter>,
}

impl JsonlSink {
    #[must_use]
    pub fn new(emitter: LogEmitter) -> Self {
        Self {
            emitter: Mutex::new(emitter),
        }
    }
}

impl ReportSink for JsonlSink {
    fn write_report(&self, report: &Report) -> std::io::Result<()> {
        let entry = LogEntry::for_report(report).with_details(serde_json::json!({
            "kind": report.kind,
            "pointer_tag": report.access.pointer_tag,
            "memory_tag": report.access.memory_tag,
            "text": report.text,
        }));
        let mut emitter = self.emitter.lock();
        emitter.emit_entry(entry)?;
        emitter.flush()
    }
}

/// Forwards to several sinks. The first error wins, but every sink is tried.
pub struct TeeSink {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl TeeSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn ReportSink>>) -> Self {
        Self { sinks }
    }
}

impl ReportSink for TeeSink {
    fn write_report(&self, report: &Report) -> std::io::Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.write_report(report) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextId;
    use crate::report::FaultKind;
    use crate::validator::{AccessDirection, AccessInfo};

    fn report() -> Report {
        Report {
            kind: FaultKind::UseAfterFree,
            bug_type: "use-after-free",
            access: AccessInfo {
                address: 0x1000_0040,
                untagged: 0x1000_0040,
                len: 8,
                direction: AccessDirection::Read,
                fault_pc: 0x401000,
                first_bad_address: 0x1000_0040,
                tag_mismatch: false,
                pointer_tag: None,
                memory_tag: None,
            },
            context: ContextId::new("main", 1),
            text: format!("{BANNER}\nBUG: shadowscan: use-after-free in 0x401000\n{BANNER}\n"),
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FailingSink;

    impl ReportSink for FailingSink {
        fn write_report(&self, _report: &Report) -> std::io::Result<()> {
            Err(std::io::Error::other("disk full"))
        }
    }

    #[test]
    fn memory_sink_counts_banners() {
        let sink = MemorySink::new();
        sink.write_report(&report()).unwrap();
        sink.write_report(&report()).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.banner_count(), 2);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn jsonl_sink_writes_valid_fault_entry() {
        let buf = SharedBuf::default();
        let sink = JsonlSink::new(LogEmitter::to_writer(buf.clone(), "shadowscan", "t1"));
        sink.write_report(&report()).unwrap();

        let written = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let entry = crate::structured_log::validate_log_line(written.trim(), 1).unwrap();
        assert_eq!(entry.event, "fault_report");
        assert_eq!(entry.bug_type.as_deref(), Some("use-after-free"));
        assert_eq!(entry.address.as_deref(), Some("0x10000040"));
        assert_eq!(entry.task.as_deref(), Some("main/1"));
        assert_eq!(entry.details.unwrap()["kind"], "UseAfterFree");
    }

    #[test]
    fn tee_tries_every_sink() {
        let memory = Arc::new(MemorySink::new());
        let sinks: Vec<Arc<dyn ReportSink>> = vec![Arc::new(FailingSink), memory.clone()];
        let tee = TeeSink::new(sinks);
        assert!(tee.write_report(&report()).is_err());
        assert_eq!(memory.len(), 1);
    }
}
