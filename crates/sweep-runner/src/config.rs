use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_core::canonical_json_digest;

/// One year. Longer wall-clock budgets are almost certainly a typo.
pub const MAX_RUN_MINUTES: u64 = 60 * 24 * 366;

/// How the target picks the next trial inside a pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickStrategy {
    Random,
    #[default]
    Shuffle,
    Weighted,
}

impl PickStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickStrategy::Random => "random",
            PickStrategy::Shuffle => "shuffle",
            PickStrategy::Weighted => "weighted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub endpoint: String,
    pub manifest: PathBuf,
    pub output_dir: PathBuf,
    pub driver: DriverConfig,
    pub budget: BudgetConfig,
    pub pick: PickStrategy,
    pub reload_every: Option<u64>,
    /// Operating flags re-asserted on every bootstrap.
    pub flags: BTreeMap<String, bool>,
    pub timeouts: TimeoutConfig,
    pub recovery: RecoveryConfig,
    pub telemetry: TelemetryConfig,
    pub heuristics: HeuristicConfig,
    pub signal: SignalConfig,
}

impl Default for SweepConfig {
    fn default() -> Self {
        let mut flags = BTreeMap::new();
        flags.insert("sampler_mode".to_string(), true);
        flags.insert("auto_advance".to_string(), false);
        Self {
            endpoint: "http://127.0.0.1:5173/".to_string(),
            manifest: PathBuf::from("manifest.json"),
            output_dir: PathBuf::from(".sweep/run"),
            driver: DriverConfig::default(),
            budget: BudgetConfig::default(),
            pick: PickStrategy::default(),
            reload_every: None,
            flags,
            timeouts: TimeoutConfig::default(),
            recovery: RecoveryConfig::default(),
            telemetry: TelemetryConfig::default(),
            heuristics: HeuristicConfig::default(),
            signal: SignalConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// argv of the driver process; speaks line-delimited JSON on stdio.
    pub command: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command: vec!["node".to_string(), "driver.js".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub coverage_ratio: f64,
    /// Absolute distinct-sample target; overrides `coverage_ratio` when set.
    pub samples: Option<usize>,
    pub max_minutes: Option<u64>,
    pub checkpoint_every: u64,
    pub seed: Option<u64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            coverage_ratio: 0.99,
            samples: None,
            max_minutes: Some(240),
            checkpoint_every: 10,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub navigate_ms: u64,
    pub ready_ms: u64,
    pub flags_ms: u64,
    pub init_pack_ms: u64,
    pub seed_ms: u64,
    pub signal_ms: u64,
    /// Shared by every bounded wait inside one trial.
    pub trial_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 30_000,
            navigate_ms: 45_000,
            ready_ms: 30_000,
            flags_ms: 5_000,
            init_pack_ms: 15_000,
            seed_ms: 10_000,
            signal_ms: 10_000,
            trial_ms: 12_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
    pub fn navigate(&self) -> Duration {
        Duration::from_millis(self.navigate_ms)
    }
    pub fn ready(&self) -> Duration {
        Duration::from_millis(self.ready_ms)
    }
    pub fn flags(&self) -> Duration {
        Duration::from_millis(self.flags_ms)
    }
    pub fn init_pack(&self) -> Duration {
        Duration::from_millis(self.init_pack_ms)
    }
    pub fn seed(&self) -> Duration {
        Duration::from_millis(self.seed_ms)
    }
    pub fn signal(&self) -> Duration {
        Duration::from_millis(self.signal_ms)
    }
    pub fn trial(&self) -> Duration {
        Duration::from_millis(self.trial_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub stuck_max_consecutive: u32,
    pub max_recoveries: u32,
    pub max_restarts: u32,
    pub nav_attempts: u32,
    pub nav_backoff_ms: u64,
    pub self_test_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stuck_max_consecutive: 3,
            max_recoveries: 3,
            max_restarts: 5,
            nav_attempts: 3,
            nav_backoff_ms: 2_000,
            self_test_attempts: 2,
            poll_interval_ms: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub samples: u32,
    pub warmup: u32,
    pub interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            samples: 8,
            warmup: 2,
            interval_ms: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    pub min_brightness: f64,
    pub max_brightness: f64,
    pub min_motion: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            min_brightness: 0.03,
            max_brightness: 0.97,
            min_motion: 0.002,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub primary: String,
    pub fallback: Option<String>,
    pub min_level: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            primary: "media".to_string(),
            fallback: Some("synthetic".to_string()),
            min_level: 0.01,
        }
    }
}

impl SweepConfig {
    /// Reads a YAML run file; relative paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("config_not_found: {}: {}", path.display(), e))?;
        let mut config: SweepConfig = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow!("config_invalid: {}: {}", path.display(), e))?;
        let base = path.parent().unwrap_or(Path::new("."));
        config.manifest = resolve_relative(base, &config.manifest);
        config.output_dir = resolve_relative(base, &config.output_dir);
        Ok(config)
    }

    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.endpoint.trim().is_empty() {
            problems.push("endpoint must not be empty".to_string());
        }
        let ratio = self.budget.coverage_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            problems.push(format!("budget.coverage_ratio must be in (0, 1], got {}", ratio));
        }
        if self.budget.samples == Some(0) {
            problems.push("budget.samples must be > 0 when set".to_string());
        }
        if let Some(minutes) = self.budget.max_minutes {
            if minutes > MAX_RUN_MINUTES {
                problems.push(format!(
                    "budget.max_minutes must be at most {}, got {}",
                    MAX_RUN_MINUTES, minutes
                ));
            }
        }
        if self.budget.checkpoint_every == 0 {
            problems.push("budget.checkpoint_every must be > 0".to_string());
        }
        if self.telemetry.samples == 0 {
            problems.push("telemetry.samples must be > 0".to_string());
        }
        if self.telemetry.warmup >= self.telemetry.samples {
            problems.push(format!(
                "telemetry.warmup ({}) must be smaller than telemetry.samples ({})",
                self.telemetry.warmup, self.telemetry.samples
            ));
        }
        if self.heuristics.min_brightness >= self.heuristics.max_brightness {
            problems.push("heuristics.min_brightness must be below max_brightness".to_string());
        }
        if self.recovery.stuck_max_consecutive == 0 {
            problems.push("recovery.stuck_max_consecutive must be > 0".to_string());
        }
        if self.recovery.nav_attempts == 0 {
            problems.push("recovery.nav_attempts must be > 0".to_string());
        }
        if self.recovery.self_test_attempts == 0 {
            problems.push("recovery.self_test_attempts must be > 0".to_string());
        }
        if self.timeouts.trial_ms == 0 {
            problems.push("timeouts.trial_ms must be > 0".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("config_invalid: {}", problems.join("; ")))
        }
    }

    pub fn digest(&self) -> String {
        serde_json::to_value(self)
            .map(|v| canonical_json_digest(&v))
            .unwrap_or_default()
    }

    pub fn trials_log_path(&self) -> PathBuf {
        self.output_dir.join("trials.log")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.output_dir.join("meta.json")
    }
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_dir;

    #[test]
    fn partial_yaml_keeps_defaults_and_resolves_paths() {
        let dir = temp_dir("config_partial");
        let path = dir.join("sweep.yaml");
        fs::write(
            &path,
            "endpoint: http://localhost:9000/\nmanifest: packs/manifest.json\npick: weighted\nbudget:\n  coverage_ratio: 0.5\ntimeouts:\n  trial_ms: 900\n",
        )
        .expect("write");
        let config = SweepConfig::load(&path).expect("load");
        assert_eq!(config.endpoint, "http://localhost:9000/");
        assert_eq!(config.pick, PickStrategy::Weighted);
        assert_eq!(config.budget.coverage_ratio, 0.5);
        assert_eq!(config.budget.checkpoint_every, 10);
        assert_eq!(config.timeouts.trial(), Duration::from_millis(900));
        assert_eq!(config.timeouts.ready_ms, 30_000);
        assert_eq!(config.manifest, dir.join("packs/manifest.json"));
        assert_eq!(config.output_dir, dir.join(".sweep/run"));
        config.validate().expect("valid");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn validate_reports_all_problems() {
        let mut config = SweepConfig::default();
        config.budget.coverage_ratio = 1.5;
        config.telemetry.warmup = 8;
        config.recovery.nav_attempts = 0;
        let msg = config.validate().expect_err("invalid").to_string();
        assert!(msg.contains("coverage_ratio"), "{}", msg);
        assert!(msg.contains("telemetry.warmup"), "{}", msg);
        assert!(msg.contains("nav_attempts"), "{}", msg);
        assert!(!msg.contains("checkpoint_every"), "{}", msg);
    }

    #[test]
    fn oversized_max_minutes_is_rejected() {
        let mut config = SweepConfig::default();
        config.budget.max_minutes = Some(MAX_RUN_MINUTES);
        config.validate().expect("a year is accepted");
        for minutes in [MAX_RUN_MINUTES + 1, 1_000_000_000_000_000, u64::MAX] {
            config.budget.max_minutes = Some(minutes);
            let msg = config.validate().expect_err("too long").to_string();
            assert!(msg.starts_with("config_invalid"), "{}", msg);
            assert!(msg.contains("budget.max_minutes"), "{}", msg);
        }
    }

    #[test]
    fn digest_tracks_semantic_changes() {
        let a = SweepConfig::default();
        let mut b = SweepConfig::default();
        assert_eq!(a.digest(), b.digest());
        b.recovery.max_restarts += 1;
        assert_ne!(a.digest(), b.digest());
    }
}
