//! Scenario runner and evidence tooling for shadowscan.
//!
//! - [`scenario`]: one deterministic fault sequence per bug type
//! - [`storm`]: many threads faulting at once through one detector
//! - [`evidence`]: JSONL run logs and SHA-256 artifact indexes

pub mod error;
pub mod evidence;
pub mod scenario;
pub mod storm;

use std::path::Path;

use shadowscan_core::DetectorConfig;

pub use error::HarnessError;
pub use evidence::{ArtifactEntry, ArtifactIndex, write_bundle};
pub use scenario::{SCENARIOS, Scenario, ScenarioResult};
pub use storm::{StormConfig, StormResult, run_storm};

/// Load a detector configuration.
///
/// A JSON file wins when given; missing keys take their defaults. Without a
/// file, `SHADOWSCAN_OPTIONS` is read. Either way the result is validated.
pub fn load_config(path: Option<&Path>) -> Result<DetectorConfig, HarnessError> {
    let config = match path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => DetectorConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}
