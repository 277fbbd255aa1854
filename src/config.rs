//! Queue configuration.
//!
//! Loaded through the `config` crate from an optional TOML file plus
//! `JOBQ_*` environment overrides, so deployments can flip the priority
//! direction or enable timing records without a rebuild.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Which numeric end of the priority range is claimed first.
///
/// This controls claim ordering only. The dedup merger always keeps the
/// numerically higher priority of the two jobs it folds together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound for job priority; submissions above it are rejected.
    pub priority_max: i32,
    /// Claim ordering direction for the priority key.
    pub priority_direction: PriorityDirection,
    /// Write `JobTiming` side records on claim and completion.
    pub record_timings: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority_max: 255,
            priority_direction: PriorityDirection::Desc,
            record_timings: false,
        }
    }
}

impl QueueConfig {
    /// Load from environment variables only (`JOBQ_PRIORITY_MAX`, ...).
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("priority_max", 255i64)?
            .set_default("priority_direction", "desc")?
            .set_default("record_timings", false)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("JOBQ").try_parsing(true));

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = QueueConfig::default();
        assert_eq!(config.priority_max, 255);
        assert_eq!(config.priority_direction, PriorityDirection::Desc);
        assert!(!config.record_timings);
    }

    #[test]
    fn loads_overrides_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "priority_max = 10\npriority_direction = \"asc\"\nrecord_timings = true"
        )
        .unwrap();

        let config = QueueConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.priority_max, 10);
        assert_eq!(config.priority_direction, PriorityDirection::Asc);
        assert!(config.record_timings);
    }

    #[test]
    fn missing_file_keys_fall_back_to_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "priority_max = 64").unwrap();

        let config = QueueConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.priority_max, 64);
        assert_eq!(config.priority_direction, PriorityDirection::Desc);
    }
}
