//! Error types for detector construction, configuration and reporting.
//!
//! Detected access violations are never surfaced through these types. They
//! travel as values (`Option<AccessInfo>`, `CheckOutcome`) so the faulting
//! path keeps running.

use thiserror::Error;

/// Failures raised while building the detector or feeding it events.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetectorError {
    #[error("granule size {0} must be a power of two in 8..=64")]
    InvalidGranule(usize),
    #[error("address {addr:#x} is not aligned to the {granule}-byte granule")]
    Misaligned { addr: usize, granule: usize },
    #[error("range [{addr:#x}, +{len:#x}) lies outside the shadow window")]
    OutOfWindow { addr: usize, len: usize },
    #[error("shadow window must not be empty")]
    EmptyWindow,
    #[error("object at {0:#x} is already live")]
    DuplicateObject(usize),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Failures parsing `SHADOWSCAN_OPTIONS` or validating a config value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option `{0}`")]
    UnknownKey(String),
    #[error("option `{key}` has invalid value `{value}`")]
    InvalidValue { key: String, value: String },
    #[error("malformed option `{0}` (expected key=value)")]
    Malformed(String),
    #[error("dump radius {0} exceeds the maximum of 16")]
    RadiusTooLarge(usize),
}

/// Failures while composing a single report. They abort only that report.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("report buffer exhausted (needed {0} bytes)")]
    Exhausted(usize),
    #[error("formatting failed")]
    Format,
}

impl From<std::fmt::Error> for ReportError {
    fn from(_: std::fmt::Error) -> Self {
        Self::Format
    }
}
