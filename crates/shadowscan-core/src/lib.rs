//! Shadow-memory access violation detector and diagnostic reporter.
//!
//! Given a proposed memory access the detector decides, from shadow state
//! alone, whether it is safe. Unsafe accesses are classified and rendered
//! as a report with allocation history and a shadow-memory dump.
//!
//! # Architecture
//!
//! - **Shadow memory** (`shadow`): per-granule validity and tag state
//! - **Allocation tracker** (`tracker`): object metadata, alloc/free tracks, quarantine
//! - **Page oracle** (`page_oracle`): "is this a heap page?" in O(1)
//! - **Access validator** (`validator`): the per-access hot path
//! - **Region resolver** (`region`): heap object, global, task stack, or unknown
//! - **Report builder** (`report`): fault classification and report text
//! - **Report gate** (`gate`): one report at a time, no nested reports
//! - **Detector** (`detector`): owns all of the above
//! - **Sinks** (`sink`) and **structured logs** (`structured_log`)
//! - **Configuration** (`config`): `SHADOWSCAN_OPTIONS` and JSON
//! - **Metrics** (`metrics`): atomic counters

pub mod config;
pub mod context;
pub mod detector;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod page_oracle;
pub mod region;
pub mod report;
pub mod shadow;
pub mod sink;
pub mod stack;
pub mod structured_log;
pub mod tracker;
pub mod validator;

pub use config::{DetectorConfig, HaltPolicy};
pub use context::ContextId;
pub use detector::{AllocationEvent, CheckOutcome, Detector};
pub use error::{ConfigError, DetectorError, ReportError};
pub use gate::{GateState, Refusal, ReportGate};
pub use metrics::{DetectorMetrics, MetricsSnapshot};
pub use region::{RegionClassification, Relation, RelationKind};
pub use report::{FaultKind, FaultRegion, Report, ReportBuilder};
pub use shadow::{RedzoneKind, ShadowByte, ShadowMemory};
pub use sink::{JsonlSink, MemorySink, ReportSink, StderrSink};
pub use stack::{Frame, NoStacks, StackDepot, StackHandle, StackTraceProvider};
pub use validator::{AccessDirection, AccessInfo, AccessValidator};
