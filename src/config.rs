use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Let computed nodes with disjoint lifetimes share buffers.
    pub share_buffers: bool,
    /// Mutate duplicate names on registration instead of failing.
    pub make_unique_names: bool,
    /// Fail an evaluation when a NaN shows up in a non-gap column of any output.
    pub track_gap_nans: bool,
    /// Record request/release windows so overlapping assignments can be reported.
    pub audit_buffers: bool,
    pub log_memory_sharing: bool,
    /// Above zero, every node execution is logged at debug level.
    pub trace_level: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            share_buffers: true,
            make_unique_names: false,
            track_gap_nans: false,
            audit_buffers: false,
            log_memory_sharing: false,
            trace_level: 0,
        }
    }
}

impl NetworkConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading network config {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("parsing network config {}", path.display()))
    }
}
