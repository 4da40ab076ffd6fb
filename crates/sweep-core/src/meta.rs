use crate::atomic_write_json_pretty;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const RUN_META_SCHEMA: &str = "run_meta_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackStatus {
    Pending,
    Sampling,
    Done,
    /// Deadline passed while the pack was being sampled.
    Stopped,
    Skipped,
    Failed,
}

impl PackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackStatus::Pending => "pending",
            PackStatus::Sampling => "sampling",
            PackStatus::Done => "done",
            PackStatus::Stopped => "stopped",
            PackStatus::Skipped => "skipped",
            PackStatus::Failed => "failed",
        }
    }

    /// Packs that actually started sampling in this run.
    pub fn was_started(&self) -> bool {
        matches!(
            self,
            PackStatus::Sampling | PackStatus::Done | PackStatus::Stopped | PackStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackProgress {
    pub pack_id: String,
    pub iter: u64,
    pub visited: usize,
    pub target: usize,
    pub total: usize,
    pub done: bool,
    pub status: PackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub trials_this_run: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub coverage_ratio: f64,
    pub samples: Option<usize>,
    pub max_minutes: Option<u64>,
    pub deadline: Option<DateTime<Utc>>,
    pub pick: String,
    pub reload_every: Option<u64>,
    pub stuck_max_consecutive: u32,
    pub max_recoveries: u32,
    pub max_restarts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub nav_timeouts: u64,
    pub restarts: u64,
    pub soft_resets: u64,
    pub planned_reloads: u64,
    pub transient_failures: u64,
    pub trials_written: u64,
}

/// Present in `meta.json` only when the run terminated on a fatal classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalError {
    pub code: String,
    pub pack: Option<String>,
    pub iter: Option<u64>,
    pub phase: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeInfo {
    pub resumed: bool,
    pub prior_lines: usize,
    pub malformed_lines: usize,
    pub previous_run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub schema_version: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub config_digest: String,
    pub budget: BudgetSnapshot,
    pub packs: Vec<PackProgress>,
    #[serde(default)]
    pub stats: RunStats,
    #[serde(default)]
    pub resume: ResumeInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FatalError>,
}

impl RunMetadata {
    pub fn new(run_id: &str, config_digest: &str, budget: BudgetSnapshot) -> Self {
        Self {
            schema_version: RUN_META_SCHEMA.to_string(),
            run_id: run_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            config_digest: config_digest.to_string(),
            budget,
            packs: Vec::new(),
            stats: RunStats::default(),
            resume: ResumeInfo::default(),
            error: None,
        }
    }

    pub fn pack_mut(&mut self, pack_id: &str) -> Option<&mut PackProgress> {
        self.packs.iter_mut().find(|p| p.pack_id == pack_id)
    }

    pub fn finish(&mut self, error: Option<FatalError>) {
        self.finished_at = Some(Utc::now());
        self.status = if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        self.error = error;
    }
}

pub fn write_run_metadata(path: &Path, meta: &RunMetadata) -> Result<()> {
    let value = serde_json::to_value(meta)?;
    atomic_write_json_pretty(path, &value)
}

pub fn read_run_metadata(path: &Path) -> Result<RunMetadata> {
    let bytes =
        fs::read(path).map_err(|e| anyhow!("meta_not_found: {}: {}", path.display(), e))?;
    Ok(serde_json::from_slice(&bytes)?)
}
