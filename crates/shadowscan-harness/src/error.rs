//! Harness error type.

use thiserror::Error;

use shadowscan_core::{ConfigError, DetectorError};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("storm needs at least one thread")]
    NoThreads,
    #[error("worker thread panicked")]
    WorkerPanicked,
}
