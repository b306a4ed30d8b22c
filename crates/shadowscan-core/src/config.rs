//! Detector configuration.
//!
//! Options are read from the `SHADOWSCAN_OPTIONS` environment variable, a
//! `:` or `,` separated list of `key=value` pairs:
//!
//! ```text
//! SHADOWSCAN_OPTIONS=multi_shot=1:tag_mode=1:dump_radius=3
//! ```
//!
//! Recognized keys: `multi_shot`, `halt_on_report`, `tag_mode`,
//! `granule_size` (alias `granule`), `dump_radius`, `shadow_base`,
//! `shadow_len`, `quarantine_entries`, `halt_policy`.
//!
//! The same struct deserializes from JSON for tooling.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DetectorError};

/// Default shadow granule in bytes.
pub const DEFAULT_GRANULE: usize = 8;

/// Default number of rows printed on each side of the faulting shadow row.
pub const DEFAULT_DUMP_RADIUS: usize = 2;

/// Upper bound on the dump radius.
pub const MAX_DUMP_RADIUS: usize = 16;

/// Default start of the monitored window.
pub const DEFAULT_SHADOW_BASE: usize = 0x1000_0000;

/// Default size of the monitored window (1 MiB).
pub const DEFAULT_SHADOW_LEN: usize = 1 << 20;

/// Default number of freed objects whose metadata stays resolvable.
pub const DEFAULT_QUARANTINE_ENTRIES: usize = 1024;

const OPTIONS_ENV: &str = "SHADOWSCAN_OPTIONS";

/// What to do after a report when `halt_on_report` is set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaltPolicy {
    /// Terminate the process immediately.
    #[default]
    Abort,
    /// Unwind the faulting thread. Used by tests and embedders that catch it.
    Panic,
}

impl HaltPolicy {
    /// Parse from string (case-insensitive). Unknown values fall back to `Abort`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "panic" | "unwind" => Self::Panic,
            _ => Self::Abort,
        }
    }
}

/// Full detector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Report every fault instead of only the first.
    pub multi_shot: bool,
    /// Halt once a report has been written.
    pub halt_on_report: bool,
    /// Check pointer tags against memory tags.
    pub tag_mode: bool,
    /// Bytes of real memory covered by one shadow byte.
    pub granule_size: usize,
    /// Rows printed on each side of the faulting shadow row.
    pub dump_radius: usize,
    /// Start of the monitored window.
    pub shadow_base: usize,
    /// Size of the monitored window in bytes.
    pub shadow_len: usize,
    /// Freed objects retained before their metadata is recycled.
    pub quarantine_entries: usize,
    pub halt_policy: HaltPolicy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            multi_shot: false,
            halt_on_report: false,
            tag_mode: false,
            granule_size: DEFAULT_GRANULE,
            dump_radius: DEFAULT_DUMP_RADIUS,
            shadow_base: DEFAULT_SHADOW_BASE,
            shadow_len: DEFAULT_SHADOW_LEN,
            quarantine_entries: DEFAULT_QUARANTINE_ENTRIES,
            halt_policy: HaltPolicy::Abort,
        }
    }
}

impl DetectorConfig {
    /// Parse an options string on top of the defaults.
    pub fn from_options(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for pair in options
            .split([':', ','])
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed(pair.to_string()))?;
            config.apply(key.trim(), value.trim())?;
        }
        if config.dump_radius > MAX_DUMP_RADIUS {
            return Err(ConfigError::RadiusTooLarge(config.dump_radius));
        }
        Ok(config)
    }

    /// Read `SHADOWSCAN_OPTIONS`. A missing variable yields the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(OPTIONS_ENV) {
            Ok(raw) => Self::from_options(&raw),
            Err(_) => Ok(Self::default()),
        }
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "multi_shot" => self.multi_shot = parse_bool(value).ok_or_else(invalid)?,
            "halt_on_report" => self.halt_on_report = parse_bool(value).ok_or_else(invalid)?,
            "tag_mode" => self.tag_mode = parse_bool(value).ok_or_else(invalid)?,
            "granule_size" | "granule" => {
                self.granule_size = parse_usize(value).ok_or_else(invalid)?;
            }
            "dump_radius" => self.dump_radius = parse_usize(value).ok_or_else(invalid)?,
            "shadow_base" => self.shadow_base = parse_usize(value).ok_or_else(invalid)?,
            "shadow_len" => self.shadow_len = parse_usize(value).ok_or_else(invalid)?,
            "quarantine_entries" => {
                self.quarantine_entries = parse_usize(value).ok_or_else(invalid)?;
            }
            "halt_policy" => self.halt_policy = HaltPolicy::from_str_loose(value),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Check the geometry constraints the shadow relies on.
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !valid_granule(self.granule_size) {
            return Err(DetectorError::InvalidGranule(self.granule_size));
        }
        if self.shadow_len == 0 {
            return Err(DetectorError::EmptyWindow);
        }
        if self.shadow_base % self.granule_size != 0 {
            return Err(DetectorError::Misaligned {
                addr: self.shadow_base,
                granule: self.granule_size,
            });
        }
        if self.shadow_base.checked_add(self.shadow_len).is_none() {
            return Err(DetectorError::OutOfWindow {
                addr: self.shadow_base,
                len: self.shadow_len,
            });
        }
        if self.dump_radius > MAX_DUMP_RADIUS {
            return Err(ConfigError::RadiusTooLarge(self.dump_radius).into());
        }
        Ok(())
    }
}

pub(crate) fn valid_granule(granule: usize) -> bool {
    granule.is_power_of_two() && (8..=64).contains(&granule)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_usize(value: &str) -> Option<usize> {
    let cleaned = value.replace('_', "");
    match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => cleaned.parse().ok(),
    }
}

static GLOBAL_CONFIG: OnceLock<DetectorConfig> = OnceLock::new();

/// Process-wide configuration (reads the env var on first call, caches thereafter).
///
/// A malformed options string falls back to the defaults.
#[must_use]
pub fn global_config() -> &'static DetectorConfig {
    GLOBAL_CONFIG.get_or_init(|| DetectorConfig::from_env().unwrap_or_default())
}
