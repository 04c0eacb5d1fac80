use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Engine configuration, typically loaded from a JSON document.
///
/// Every field has a default so partial documents load cleanly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the stage executables.
    pub executable_dir: PathBuf,
    /// Root of the shared output filesystem the manifest projects.
    pub data_dir: PathBuf,
    /// Deadline applied to stages that do not declare their own.
    pub default_stage_timeout_seconds: u64,
    pub max_concurrent_operations: usize,
    pub subscriber_buffer_depth: usize,
    /// How long a cancelled subprocess gets between SIGTERM and SIGKILL.
    pub subprocess_grace_period_seconds: u64,
    /// Window applied to full-pipeline requests that omit `from_date`.
    pub full_pipeline_default_from: Option<NaiveDate>,
    /// Window applied to full-pipeline requests that omit `to_date`.
    pub full_pipeline_default_to: Option<NaiveDate>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable_dir: PathBuf::from("bin"),
            data_dir: PathBuf::from("data"),
            default_stage_timeout_seconds: 7_200,
            max_concurrent_operations: 4,
            subscriber_buffer_depth: 256,
            subprocess_grace_period_seconds: 10,
            full_pipeline_default_from: None,
            full_pipeline_default_to: None,
        }
    }
}

impl EngineConfig {
    pub fn default_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.default_stage_timeout_seconds)
    }

    pub fn subprocess_grace_period(&self) -> Duration {
        Duration::from_secs(self.subprocess_grace_period_seconds)
    }
}
