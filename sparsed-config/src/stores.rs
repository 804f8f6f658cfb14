//! Side-store settings.

use serde::{Deserialize, Serialize};

/// Timestamp store settings. When enabled, every pushed row records a
/// last-update timestamp and rows older than `now - expire_threshold`
/// are dropped by the expiration pass before a save.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TsConfig {
    #[serde(default)]
    pub enable: bool,

    /// Timestamp of "now", supplied by the job, not the wall clock.
    #[serde(default)]
    pub now: u32,

    #[serde(default)]
    pub expire_threshold: u32,
}

/// Frequency-based admission filter. Ids seen fewer than `threshold`
/// times never materialize a row. `0` disables the store.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreqConfig {
    #[serde(default)]
    pub threshold: u32,
}

impl FreqConfig {
    pub fn enabled(&self) -> bool {
        self.threshold > 0
    }
}

/// Online-learning delta tracking for streaming export.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct OlConfig {
    #[serde(default)]
    pub enable: bool,

    /// Minimum number of updates before a row is considered dirty.
    #[serde(default)]
    pub update_threshold: u32,

    /// Minimum L2 distance from the last exported value.
    #[serde(default)]
    pub distance_threshold: f32,
}
