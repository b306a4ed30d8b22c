//! Evidence bundles: JSONL run logs plus an artifact index of report digests.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use shadowscan_core::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome, now_utc};

use crate::error::HarnessError;
use crate::scenario::ScenarioResult;

/// A single artifact entry in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub kind: String,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Artifact index linking a run log to the reports it produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub index_version: u32,
    pub run_id: String,
    pub generated_utc: String,
    pub artifacts: Vec<ArtifactEntry>,
}

impl ArtifactIndex {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            index_version: 1,
            run_id: run_id.into(),
            generated_utc: now_utc(),
            artifacts: Vec::new(),
        }
    }

    /// Add an artifact whose digest is computed from `bytes`.
    pub fn add_bytes(
        &mut self,
        path: impl Into<String>,
        kind: impl Into<String>,
        bytes: &[u8],
        description: Option<String>,
    ) -> &mut Self {
        self.artifacts.push(ArtifactEntry {
            path: path.into(),
            kind: kind.into(),
            sha256: sha256_hex(bytes),
            size_bytes: Some(bytes.len() as u64),
            description,
        });
        self
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ArtifactEntry> {
        self.artifacts.iter().find(|a| a.path == path)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Paths written by [`write_bundle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub log: PathBuf,
    pub index: PathBuf,
    pub reports: Vec<PathBuf>,
}

/// Write reports, a JSONL log and `artifact_index.json` under `dir`.
///
/// Each scenario with a report gets `<scenario>.report.txt`. The log holds
/// one `scenario_result` entry per scenario and a closing `run_summary`.
pub fn write_bundle(
    dir: &Path,
    run_id: &str,
    results: &[ScenarioResult],
) -> Result<BundlePaths, HarnessError> {
    std::fs::create_dir_all(dir)?;
    let log_path = dir.join("scenarios.log.jsonl");
    let mut emitter = LogEmitter::to_file(&log_path, "shadowscan-harness", run_id)?;
    let mut index = ArtifactIndex::new(run_id);
    let mut reports = Vec::new();

    for result in results {
        let mut refs = Vec::new();
        if let Some(text) = &result.report {
            let name = format!("{}.report.txt", result.scenario);
            let path = dir.join(&name);
            std::fs::write(&path, text)?;
            index.add_bytes(
                name.clone(),
                "report",
                text.as_bytes(),
                Some(format!("{} report", result.expected)),
            );
            refs.push(name);
            reports.push(path);
        }
        emitter.emit_entry(result_entry(result, refs)?)?;
    }

    let failed = results.iter().filter(|r| !r.passed).count();
    let (level, outcome) = verdict(failed == 0);
    let summary = LogEntry::new("", level, "run_summary")
        .with_outcome(outcome)
        .with_details(serde_json::json!({
            "total": results.len(),
            "failed": failed,
        }));
    emitter.emit_entry(summary)?;
    emitter.flush()?;
    drop(emitter);

    let log_bytes = std::fs::read(&log_path)?;
    index.add_bytes("scenarios.log.jsonl", "log", &log_bytes, None);
    let index_path = dir.join("artifact_index.json");
    std::fs::write(&index_path, index.to_json()?)?;

    Ok(BundlePaths {
        log: log_path,
        index: index_path,
        reports,
    })
}

fn result_entry(result: &ScenarioResult, refs: Vec<String>) -> Result<LogEntry, HarnessError> {
    let (level, outcome) = verdict(result.passed);
    let mut entry = LogEntry::new("", level, "scenario_result")
        .with_scenario(&result.scenario)
        .with_outcome(outcome)
        .with_duration_ms(result.duration_ms)
        .with_details(serde_json::json!({
            "expected": result.expected,
            "observed": result.observed,
            "metrics": serde_json::to_value(result.metrics)?,
        }));
    if !refs.is_empty() {
        entry = entry.with_artifacts(refs);
    }
    Ok(entry)
}

fn verdict(passed: bool) -> (LogLevel, Outcome) {
    if passed {
        (LogLevel::Info, Outcome::Pass)
    } else {
        (LogLevel::Error, Outcome::Fail)
    }
}
