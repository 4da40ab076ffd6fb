use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TRIAL_RECORD_SCHEMA: &str = "trial_record_v1";

/// Aggregated measurements for one trial, after the warm-up prefix is dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    pub brightness: f64,
    pub motion: f64,
    pub signal_level: f64,
    pub render_errors: u32,
    pub console_errors: u32,
    pub samples: u32,
}

/// One line of `trials.log`. Written once and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub run_id: String,
    pub pack_id: String,
    pub trial_id: Option<String>,
    #[serde(default)]
    pub iter: u64,
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub telemetry: Telemetry,
    pub ok_heuristic: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

fn default_schema_version() -> String {
    TRIAL_RECORD_SCHEMA.to_string()
}

impl TrialRecord {
    pub fn new(run_id: &str, pack_id: &str, trial_id: Option<String>, iter: u64) -> Self {
        Self {
            schema_version: default_schema_version(),
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            pack_id: pack_id.to_string(),
            trial_id,
            iter,
            generation: 0,
            telemetry: Telemetry::default(),
            ok_heuristic: true,
            reasons: Vec::new(),
        }
    }
}
