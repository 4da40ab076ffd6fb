use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use sweep_core::{
    ensure_dir, load_progress, read_run_metadata, write_run_metadata, BudgetSnapshot, FatalError,
    Manifest, PackManifest, PackProgress, PackStatus, ResumeInfo, RunMetadata, TrialLog,
};

pub mod bootstrap;
pub mod classify;
pub mod config;
pub mod coverage;
pub mod driver;
pub mod process_driver;
pub mod recovery;
pub mod retry;
pub mod session;
pub mod trial;

#[cfg(test)]
mod testing;

pub use bootstrap::{bootstrap, BootstrapReport, BootstrapRequest, HttpProbe, LivenessProbe};
pub use classify::{classify, FailureClass, Phase, SweepError};
pub use config::{PickStrategy, SweepConfig};
pub use coverage::{coverage_target, CoverageTracker};
pub use driver::{
    Action, DriverError, DriverErrorKind, Metrics, StateSnapshot, TargetDriver, WindowSpec,
};
pub use process_driver::ProcessDriver;
pub use recovery::{AbortReason, Decision, RecoveryMode, RecoveryState};
pub use session::SessionManager;

use crate::classify::fatal_code;
use crate::trial::{run_trial, TrialContext};

/// Wall-clock source for deadline checks.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Pack ids to sample, in order. Empty means every manifest pack.
    pub packs: Vec<String>,
    pub resume: bool,
    /// Absolute deadline; overrides `budget.max_minutes`.
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub meta: RunMetadata,
}

impl RunOutcome {
    pub fn fatal(&self) -> Option<&FatalError> {
        self.meta.error.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackEnd {
    Done,
    DeadlineReached,
    Skipped,
}

pub fn run_sweep(
    config: &SweepConfig,
    options: &RunOptions,
    driver: Box<dyn TargetDriver>,
    probe: &dyn LivenessProbe,
) -> Result<RunOutcome> {
    run_sweep_with_clock(config, options, driver, probe, &SystemClock)
}

/// Samples every selected pack until its coverage target or the deadline.
/// Fatal classifications end up in `meta.json` and in the returned outcome;
/// `Err` is reserved for problems before sampling starts or a metadata file
/// that cannot be written at the end.
pub fn run_sweep_with_clock(
    config: &SweepConfig,
    options: &RunOptions,
    driver: Box<dyn TargetDriver>,
    probe: &dyn LivenessProbe,
    clock: &dyn Clock,
) -> Result<RunOutcome> {
    config.validate()?;
    let manifest = Manifest::load(&config.manifest)?;
    let packs = select_packs(&manifest, &options.packs)?;

    let run_dir = config.output_dir.clone();
    ensure_dir(&run_dir)?;
    let log_path = config.trials_log_path();
    let meta_path = config.meta_path();

    let progress = load_progress(&log_path)?;
    if !options.resume && progress.total_lines > 0 {
        return Err(anyhow!(
            "run_dir_not_empty: {} already holds {} trial lines; pass --resume or choose another output_dir",
            log_path.display(),
            progress.total_lines
        ));
    }

    let digest = config.digest();
    let mut resume = ResumeInfo {
        resumed: options.resume,
        prior_lines: progress.total_lines,
        malformed_lines: progress.malformed_lines,
        previous_run_id: None,
    };
    if options.resume {
        if let Ok(previous) = read_run_metadata(&meta_path) {
            if previous.config_digest != digest {
                tracing::warn!(
                    previous_run = %previous.run_id,
                    "config changed since the previous run; targets may differ"
                );
            }
            resume.previous_run_id = Some(previous.run_id);
        }
        tracing::info!(
            prior_lines = progress.total_lines,
            malformed_lines = progress.malformed_lines,
            "resuming from existing trial log"
        );
    }

    let started = clock.now();
    let deadline = match (options.deadline, config.budget.max_minutes) {
        (Some(deadline), _) => Some(deadline),
        (None, Some(minutes)) => Some(deadline_after(started, minutes)?),
        (None, None) => None,
    };
    let run_id = next_run_id(started, resume.previous_run_id.as_deref());

    let target_for = |pack: &PackManifest| {
        coverage_target(
            pack.total(),
            config.budget.coverage_ratio,
            config.budget.samples,
        )
    };
    let mut tracker = CoverageTracker::new();
    tracker.seed_from(packs.iter().copied(), &progress, target_for);

    let mut meta = RunMetadata::new(&run_id, &digest, budget_snapshot(config, deadline));
    meta.started_at = started;
    meta.resume = resume;
    meta.packs = packs
        .iter()
        .map(|pack| PackProgress {
            pack_id: pack.id.clone(),
            iter: 0,
            visited: tracker.visited(&pack.id),
            target: tracker.target(&pack.id),
            total: pack.total(),
            done: tracker.is_done(&pack.id),
            status: PackStatus::Pending,
            skip_reason: None,
            trials_this_run: 0,
        })
        .collect();
    write_run_metadata(&meta_path, &meta)?;

    tracing::info!(
        run_id = %run_id,
        packs = packs.len(),
        deadline = ?deadline,
        resume = options.resume,
        "sweep started"
    );

    let rng = match config.budget.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut runner = Runner {
        config,
        clock,
        probe,
        deadline,
        resumed: options.resume,
        run_id: run_id.clone(),
        meta_path: meta_path.clone(),
        sessions: SessionManager::new(driver, config.timeouts.connect()),
        recovery: RecoveryState::new(&config.recovery),
        tracker,
        log: TrialLog::open(&log_path)?,
        meta,
        rng,
        needs_bootstrap: true,
        pending_restart: false,
    };

    let mut fatal = None;
    for pack in &packs {
        match runner.run_pack(pack) {
            Ok(end) => tracing::info!(
                pack = %pack.id,
                end = ?end,
                visited = runner.tracker.visited(&pack.id),
                target = runner.tracker.target(&pack.id),
                "pack finished"
            ),
            Err(err) => {
                fatal = Some(err);
                break;
            }
        }
    }
    runner.sessions.shutdown();
    let mut meta = runner.meta;
    if fatal.is_none() {
        fatal = zero_sample_check(&meta);
    }

    match &fatal {
        Some(err) => tracing::error!(
            code = %err.code,
            pack = err.pack.as_deref().unwrap_or("-"),
            phase = %err.phase,
            message = %err.message,
            "sweep failed"
        ),
        None => tracing::info!(
            trials = meta.stats.trials_written,
            restarts = meta.stats.restarts,
            "sweep completed"
        ),
    }
    meta.finish(fatal);
    meta.finished_at = Some(clock.now());
    write_run_metadata(&meta_path, &meta)?;

    Ok(RunOutcome {
        run_id,
        run_dir,
        meta,
    })
}

fn deadline_after(started: DateTime<Utc>, minutes: u64) -> Result<DateTime<Utc>> {
    i64::try_from(minutes)
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .and_then(|budget| started.checked_add_signed(budget))
        .ok_or_else(|| {
            anyhow!(
                "config_invalid: budget.max_minutes {} does not fit a deadline after {}",
                minutes,
                started.to_rfc3339()
            )
        })
}

/// Millisecond resolution; a resume that lands on the previous id gets a
/// numeric suffix so the two runs stay distinguishable.
fn next_run_id(started: DateTime<Utc>, previous: Option<&str>) -> String {
    let base = format!("run_{}", started.format("%Y%m%d_%H%M%S_%3f"));
    if previous == Some(base.as_str()) {
        format!("{}_1", base)
    } else {
        base
    }
}

fn select_packs<'m>(manifest: &'m Manifest, wanted: &[String]) -> Result<Vec<&'m PackManifest>> {
    if wanted.is_empty() {
        return Ok(manifest.packs.iter().collect());
    }
    let missing: Vec<&str> = wanted
        .iter()
        .filter(|id| manifest.pack(id).is_none())
        .map(|id| id.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!(
            "unknown_pack: not in manifest: {} (known: {})",
            missing.join(", "),
            manifest.pack_ids().join(", ")
        ));
    }
    Ok(wanted.iter().filter_map(|id| manifest.pack(id)).collect())
}

fn budget_snapshot(config: &SweepConfig, deadline: Option<DateTime<Utc>>) -> BudgetSnapshot {
    BudgetSnapshot {
        coverage_ratio: config.budget.coverage_ratio,
        samples: config.budget.samples,
        max_minutes: config.budget.max_minutes,
        deadline,
        pick: config.pick.as_str().to_string(),
        reload_every: config.reload_every,
        stuck_max_consecutive: config.recovery.stuck_max_consecutive,
        max_recoveries: config.recovery.max_recoveries,
        max_restarts: config.recovery.max_restarts,
    }
}

/// A pack that started with a non-zero target but ended with nothing
/// visited is a bug, not an outcome.
fn zero_sample_check(meta: &RunMetadata) -> Option<FatalError> {
    let empty: Vec<&str> = meta
        .packs
        .iter()
        .filter(|p| p.status.was_started() && p.target > 0 && p.visited == 0)
        .map(|p| p.pack_id.as_str())
        .collect();
    if empty.is_empty() {
        return None;
    }
    Some(FatalError {
        code: "zero_samples".to_string(),
        pack: empty.first().map(|s| s.to_string()),
        iter: None,
        phase: "finalize".to_string(),
        message: format!(
            "packs with a coverage target recorded no samples: {}",
            empty.join(", ")
        ),
    })
}

struct Runner<'a> {
    config: &'a SweepConfig,
    clock: &'a dyn Clock,
    probe: &'a dyn LivenessProbe,
    deadline: Option<DateTime<Utc>>,
    resumed: bool,
    run_id: String,
    meta_path: PathBuf,
    sessions: SessionManager,
    recovery: RecoveryState,
    tracker: CoverageTracker,
    log: TrialLog,
    meta: RunMetadata,
    rng: StdRng,
    needs_bootstrap: bool,
    pending_restart: bool,
}

impl Runner<'_> {
    fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|d| self.clock.now() >= d)
            .unwrap_or(false)
    }

    fn run_pack(&mut self, pack: &PackManifest) -> Result<PackEnd, FatalError> {
        if self.deadline_passed() {
            tracing::warn!(pack = %pack.id, "deadline exhausted before pack start; skipping");
            self.set_status(&pack.id, PackStatus::Skipped);
            if let Some(p) = self.meta.pack_mut(&pack.id) {
                p.skip_reason = Some("deadline exhausted".to_string());
            }
            self.checkpoint()?;
            return Ok(PackEnd::Skipped);
        }
        if self.tracker.is_done(&pack.id) {
            if self.resumed {
                tracing::info!(
                    pack = %pack.id,
                    visited = self.tracker.visited(&pack.id),
                    target = self.tracker.target(&pack.id),
                    "pack already complete on resume; zero trials needed"
                );
            } else {
                tracing::info!(pack = %pack.id, "pack has a zero coverage target");
            }
            self.set_status(&pack.id, PackStatus::Done);
            self.checkpoint()?;
            return Ok(PackEnd::Done);
        }

        tracing::info!(
            pack = %pack.id,
            visited = self.tracker.visited(&pack.id),
            target = self.tracker.target(&pack.id),
            "sampling pack"
        );
        self.set_status(&pack.id, PackStatus::Sampling);
        self.checkpoint()?;
        self.needs_bootstrap = true;
        let mut since_reload = 0u64;

        loop {
            if self.tracker.is_done(&pack.id) {
                self.set_status(&pack.id, PackStatus::Done);
                self.checkpoint()?;
                return Ok(PackEnd::Done);
            }
            if self.deadline_passed() {
                tracing::warn!(pack = %pack.id, "deadline reached while sampling");
                self.set_status(&pack.id, PackStatus::Stopped);
                self.checkpoint()?;
                return Ok(PackEnd::DeadlineReached);
            }

            if self.pending_restart || !self.sessions.is_connected() {
                let started = if self.pending_restart {
                    self.sessions.restart().map(|_| ())
                } else {
                    self.sessions.start().map(|_| ())
                };
                self.pending_restart = false;
                if let Err(err) = started {
                    let class = classify(&err);
                    let decision = self.recovery.on_bootstrap_failure(class);
                    self.escalate(decision, &err, class, pack, None)?;
                    continue;
                }
                self.needs_bootstrap = true;
            }

            if self.needs_bootstrap {
                let priority = self.priority_for(pack);
                let req = BootstrapRequest {
                    config: self.config,
                    pack,
                    priority: priority.as_deref(),
                    probe: self.probe,
                };
                match bootstrap(self.sessions.driver(), &req, &mut self.meta.stats) {
                    Ok(_) => {
                        if self.recovery.mode == RecoveryMode::Recovering {
                            tracing::info!(
                                pack = %pack.id,
                                attempt = self.recovery.recovery_attempts,
                                "recovered; back to sampling"
                            );
                        }
                        self.recovery.on_bootstrap_success();
                        self.needs_bootstrap = false;
                        since_reload = 0;
                    }
                    Err(err) => {
                        let class = classify(&err);
                        tracing::warn!(
                            pack = %pack.id,
                            class = class.as_str(),
                            error = %err,
                            "bootstrap failed"
                        );
                        let decision = self.recovery.on_bootstrap_failure(class);
                        self.escalate(decision, &err, class, pack, None)?;
                        continue;
                    }
                }
            }

            let iter = self.bump_iter(&pack.id);
            let ctx = TrialContext {
                run_id: &self.run_id,
                pack,
                generation: self.sessions.generation(),
                iter,
                config: self.config,
            };
            match run_trial(self.sessions.driver(), &ctx, &mut self.tracker, &mut self.log) {
                Ok(_) => {
                    self.recovery.on_trial_success();
                    self.meta.stats.trials_written += 1;
                    if let Some(p) = self.meta.pack_mut(&pack.id) {
                        p.trials_this_run += 1;
                    }
                    self.sync_pack(&pack.id);
                    since_reload += 1;
                    if self.meta.stats.trials_written % self.config.budget.checkpoint_every == 0 {
                        self.checkpoint()?;
                    }
                    if let Some(every) = self.config.reload_every.filter(|n| *n > 0) {
                        if since_reload >= every && !self.tracker.is_done(&pack.id) {
                            tracing::info!(pack = %pack.id, after = since_reload, "planned reload");
                            self.meta.stats.planned_reloads += 1;
                            self.needs_bootstrap = true;
                        }
                    }
                }
                Err(err) => {
                    let class = classify(&err);
                    if class == FailureClass::Transient {
                        self.meta.stats.transient_failures += 1;
                    }
                    tracing::warn!(
                        pack = %pack.id,
                        iter,
                        phase = %err.phase(),
                        class = class.as_str(),
                        error = %err,
                        "trial failed"
                    );
                    let decision = self.recovery.on_failure(class);
                    self.escalate(decision, &err, class, pack, Some(iter))?;
                }
            }
        }
    }

    fn escalate(
        &mut self,
        decision: Decision,
        err: &SweepError,
        class: FailureClass,
        pack: &PackManifest,
        iter: Option<u64>,
    ) -> Result<(), FatalError> {
        match decision {
            Decision::Retry => Ok(()),
            Decision::SoftReset => {
                tracing::warn!(
                    pack = %pack.id,
                    attempt = self.recovery.recovery_attempts,
                    "consecutive failures reached the threshold; soft reset"
                );
                self.meta.stats.soft_resets += 1;
                self.needs_bootstrap = true;
                Ok(())
            }
            Decision::RestartSession => {
                tracing::warn!(
                    pack = %pack.id,
                    restarts = self.recovery.session_restarts,
                    max_restarts = self.recovery.max_restarts,
                    "restarting driver session"
                );
                self.meta.stats.restarts += 1;
                self.pending_restart = true;
                self.needs_bootstrap = true;
                Ok(())
            }
            Decision::Abort(reason) => {
                let code = match reason {
                    AbortReason::Terminal(class) => fatal_code(err, class),
                    AbortReason::RestartBudgetExhausted => "restart_budget_exhausted",
                };
                self.set_status(&pack.id, PackStatus::Failed);
                let fatal = FatalError {
                    code: code.to_string(),
                    pack: Some(pack.id.clone()),
                    iter,
                    phase: err.phase().as_str().to_string(),
                    message: format!("{} ({})", err, class.as_str()),
                };
                // The final metadata write records the error.
                let _ = self.checkpoint();
                Err(fatal)
            }
        }
    }

    fn priority_for(&mut self, pack: &PackManifest) -> Option<Vec<String>> {
        let wanted = self.resumed
            && self.config.pick == PickStrategy::Shuffle
            && self.tracker.visited(&pack.id) > 0;
        wanted.then(|| self.tracker.priority_order(pack, &mut self.rng))
    }

    fn bump_iter(&mut self, pack_id: &str) -> u64 {
        match self.meta.pack_mut(pack_id) {
            Some(p) => {
                let iter = p.iter;
                p.iter += 1;
                iter
            }
            None => 0,
        }
    }

    fn sync_pack(&mut self, pack_id: &str) {
        let visited = self.tracker.visited(pack_id);
        let done = self.tracker.is_done(pack_id);
        if let Some(p) = self.meta.pack_mut(pack_id) {
            p.visited = visited;
            p.done = done;
        }
    }

    fn set_status(&mut self, pack_id: &str, status: PackStatus) {
        self.sync_pack(pack_id);
        if let Some(p) = self.meta.pack_mut(pack_id) {
            p.status = status;
        }
    }

    fn checkpoint(&self) -> Result<(), FatalError> {
        write_run_metadata(&self.meta_path, &self.meta).map_err(|e| FatalError {
            code: "persistence_failed".to_string(),
            pack: None,
            iter: None,
            phase: Phase::Persist.as_str().to_string(),
            message: format!("failed to write {}: {:#}", self.meta_path.display(), e),
        })
    }
}

/// Convenience for callers that only have a run directory.
pub fn read_run_dir(run_dir: &Path) -> Result<RunMetadata> {
    read_run_metadata(&run_dir.join("meta.json"))
}
