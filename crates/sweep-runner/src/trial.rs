use crate::classify::{Phase, SweepError};
use crate::config::{HeuristicConfig, SweepConfig};
use crate::coverage::CoverageTracker;
use crate::driver::{Action, Metrics, StateSnapshot, TargetDriver, TelemetrySample, WindowSpec};
use crate::retry::poll_until;
use std::time::Duration;
use sweep_core::{PackManifest, Telemetry, TrialLog, TrialRecord};

/// Result of one action/observation cycle that passed manifest checks.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub trial_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutcome {
    pub record: TrialRecord,
    /// True when the trial added a new id to the pack's coverage.
    pub new_visit: bool,
}

/// Waits for the trigger, advances once and waits for a fingerprint change.
/// Every wait uses the same `timeout`.
pub fn run_cycle(
    driver: &mut dyn TargetDriver,
    pack: &PackManifest,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<CycleOutcome, SweepError> {
    let before = poll_until(driver, timeout, poll_interval, |s| {
        s.trigger_enabled().then(|| s.clone())
    })
    .map_err(|e| {
        e.into_sweep(Phase::AwaitTrigger, |last| {
            format!(
                "trigger {}",
                StateSnapshot::describe_flag(last.and_then(|s| s.trigger_enabled))
            )
        })
    })?;

    driver
        .act(&Action::Next, timeout)
        .map_err(|e| SweepError::driver(Phase::Act, e))?;

    let after = poll_until(driver, timeout, poll_interval, |s| {
        (s.fingerprint() != before.fingerprint()).then(|| s.clone())
    })
    .map_err(|e| {
        e.into_sweep(Phase::AwaitChange, |_| {
            format!("state stuck at {:?}", before.fingerprint())
        })
    })?;

    if let Some(observed) = after.pack_id.as_deref() {
        if observed != pack.id {
            return Err(SweepError::PackMismatch {
                phase: Phase::Verify,
                expected: pack.id.clone(),
                observed: observed.to_string(),
            });
        }
    }
    if let Some(trial_id) = after.trial_id.as_deref() {
        if !pack.contains(trial_id) {
            return Err(SweepError::UnknownTrial {
                pack: pack.id.clone(),
                trial_id: trial_id.to_string(),
            });
        }
    }
    Ok(CycleOutcome {
        trial_id: after.trial_id,
    })
}

/// Means over the samples after the warm-up prefix.
pub fn summarize(metrics: &Metrics, warmup: u32) -> Telemetry {
    // A window no longer than the warm-up has nothing to report.
    let window = metrics.samples.get(warmup as usize..).unwrap_or(&[]);
    Telemetry {
        brightness: mean(window, |s| s.brightness),
        motion: mean(window, |s| s.motion),
        signal_level: mean(window, |s| s.signal_level),
        render_errors: metrics.render_errors,
        console_errors: metrics.console_errors,
        samples: window.len() as u32,
    }
}

fn mean(window: &[TelemetrySample], field: impl Fn(&TelemetrySample) -> f64) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(field).sum::<f64>() / window.len() as f64
}

pub fn judge(telemetry: &Telemetry, thresholds: &HeuristicConfig) -> Vec<String> {
    let mut reasons = Vec::new();
    if telemetry.samples == 0 {
        reasons.push("no_samples".to_string());
        return reasons;
    }
    if telemetry.brightness < thresholds.min_brightness {
        reasons.push("too_dim".to_string());
    }
    if telemetry.brightness > thresholds.max_brightness {
        reasons.push("too_bright".to_string());
    }
    if telemetry.motion < thresholds.min_motion {
        reasons.push("too_static".to_string());
    }
    if telemetry.render_errors > 0 {
        reasons.push("render_errors".to_string());
    }
    if telemetry.console_errors > 0 {
        reasons.push("console_errors".to_string());
    }
    reasons
}

pub struct TrialContext<'a> {
    pub run_id: &'a str,
    pub pack: &'a PackManifest,
    pub generation: u64,
    pub iter: u64,
    pub config: &'a SweepConfig,
}

/// One full trial. The record is durable before this returns, and coverage
/// only moves after the append succeeded.
pub fn run_trial(
    driver: &mut dyn TargetDriver,
    ctx: &TrialContext<'_>,
    tracker: &mut CoverageTracker,
    log: &mut TrialLog,
) -> Result<TrialOutcome, SweepError> {
    let timeout = ctx.config.timeouts.trial();
    let cycle = run_cycle(
        driver,
        ctx.pack,
        timeout,
        ctx.config.recovery.poll_interval(),
    )?;

    let window = WindowSpec {
        samples: ctx.config.telemetry.samples,
        warmup: ctx.config.telemetry.warmup,
        interval_ms: ctx.config.telemetry.interval_ms,
    };
    let metrics = driver
        .sample_telemetry(&window, timeout)
        .map_err(|e| SweepError::driver(Phase::Telemetry, e))?;

    let mut record = TrialRecord::new(ctx.run_id, &ctx.pack.id, cycle.trial_id.clone(), ctx.iter);
    record.generation = ctx.generation;
    record.telemetry = summarize(&metrics, window.warmup);
    record.reasons = judge(&record.telemetry, &ctx.config.heuristics);
    if record.trial_id.is_none() {
        record.reasons.push("unidentified_trial".to_string());
    }
    record.ok_heuristic = record.reasons.is_empty();

    log.append(&record).map_err(|e| {
        SweepError::Persistence(format!("append to {}: {:#}", log.path().display(), e))
    })?;

    let new_visit = match record.trial_id.as_deref() {
        Some(id) => tracker.record_visit(&ctx.pack.id, id),
        None => false,
    };
    tracing::debug!(
        pack = %ctx.pack.id,
        iter = ctx.iter,
        trial_id = record.trial_id.as_deref().unwrap_or("-"),
        ok = record.ok_heuristic,
        new_visit,
        "trial recorded"
    );
    Ok(TrialOutcome { record, new_visit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverErrorKind;
    use crate::testing::{fast_config, temp_dir, FakeTarget, ScriptedDriver};
    use std::fs;
    use sweep_core::load_progress;

    fn sample(brightness: f64, motion: f64) -> TelemetrySample {
        TelemetrySample {
            brightness,
            motion,
            signal_level: 0.5,
        }
    }

    fn ready_driver(target: FakeTarget) -> (ScriptedDriver, crate::testing::SharedTarget) {
        let (mut driver, state) = ScriptedDriver::new(target);
        driver.connect(Duration::from_millis(10)).expect("connect");
        driver
            .navigate("http://fake/", Duration::from_millis(10))
            .expect("navigate");
        driver
            .act(
                &Action::InitPack {
                    pack_id: "p".to_string(),
                    pick: Default::default(),
                },
                Duration::from_millis(10),
            )
            .expect("init");
        (driver, state)
    }

    #[test]
    fn summarize_discards_warmup() {
        let metrics = Metrics {
            samples: vec![sample(1.0, 1.0), sample(0.2, 0.1), sample(0.4, 0.3)],
            render_errors: 0,
            console_errors: 2,
        };
        let t = summarize(&metrics, 1);
        assert_eq!(t.samples, 2);
        assert!((t.brightness - 0.3).abs() < 1e-9);
        assert!((t.motion - 0.2).abs() < 1e-9);
        assert_eq!(t.console_errors, 2);
    }

    #[test]
    fn summarize_reports_nothing_when_window_is_all_warmup() {
        let metrics = Metrics {
            samples: vec![sample(1.0, 1.0), sample(0.9, 0.9)],
            render_errors: 0,
            console_errors: 0,
        };
        let t = summarize(&metrics, 2);
        assert_eq!(t.samples, 0);
        assert_eq!(t.brightness, 0.0);
        assert_eq!(judge(&t, &HeuristicConfig::default()), vec!["no_samples"]);
    }

    #[test]
    fn judge_names_each_failed_threshold() {
        let thresholds = HeuristicConfig::default();
        let mut t = Telemetry {
            brightness: 0.5,
            motion: 0.1,
            samples: 4,
            ..Telemetry::default()
        };
        assert!(judge(&t, &thresholds).is_empty());
        t.brightness = 0.0;
        t.motion = 0.0;
        t.render_errors = 1;
        assert_eq!(
            judge(&t, &thresholds),
            vec!["too_dim", "too_static", "render_errors"]
        );
        t.brightness = 0.99;
        assert!(judge(&t, &thresholds).contains(&"too_bright".to_string()));
        t.samples = 0;
        assert_eq!(judge(&t, &thresholds), vec!["no_samples"]);
    }

    #[test]
    fn trial_appends_record_before_updating_coverage() {
        let dir = temp_dir("trial_ok");
        let config = fast_config(&dir);
        let (mut driver, _state) = ready_driver(FakeTarget::with_pack("p", 4));
        let pack = PackManifest::new("p", (0..4).map(|i| format!("p-{}", i)).collect());
        let mut tracker = CoverageTracker::new();
        tracker.register(&pack, 4, None);
        let mut log = TrialLog::open(&dir.join("trials.log")).expect("open");

        let ctx = TrialContext {
            run_id: "run_test",
            pack: &pack,
            generation: 3,
            iter: 0,
            config: &config,
        };
        let outcome = run_trial(&mut driver, &ctx, &mut tracker, &mut log).expect("trial");
        assert!(outcome.new_visit);
        assert_eq!(outcome.record.generation, 3);
        assert!(outcome.record.ok_heuristic, "{:?}", outcome.record.reasons);
        assert_eq!(tracker.visited("p"), 1);

        let progress = load_progress(&dir.join("trials.log")).expect("replay");
        assert_eq!(progress.visited_by_pack, tracker.visited_sets());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn foreign_trial_id_is_rejected_without_logging() {
        let dir = temp_dir("trial_foreign");
        let config = fast_config(&dir);
        let mut target = FakeTarget::with_pack("p", 4);
        target.foreign_at_next = Some(1);
        let (mut driver, _state) = ready_driver(target);
        let pack = PackManifest::new("p", (0..4).map(|i| format!("p-{}", i)).collect());

        let err = run_cycle(
            &mut driver,
            &pack,
            config.timeouts.trial(),
            config.recovery.poll_interval(),
        )
        .expect_err("foreign id");
        assert!(matches!(err, SweepError::UnknownTrial { .. }), "{:?}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stalled_target_times_out_in_await_change() {
        let dir = temp_dir("trial_stall");
        let config = fast_config(&dir);
        let mut target = FakeTarget::with_pack("p", 4);
        target.stall_next = 1;
        let (mut driver, _state) = ready_driver(target);
        let pack = PackManifest::new("p", (0..4).map(|i| format!("p-{}", i)).collect());

        let err = run_cycle(
            &mut driver,
            &pack,
            config.timeouts.trial(),
            config.recovery.poll_interval(),
        )
        .expect_err("stalled");
        assert_eq!(err.phase(), Phase::AwaitChange);
        assert!(matches!(err, SweepError::StageTimeout { .. }));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn act_timeout_keeps_driver_kind() {
        let dir = temp_dir("trial_act_timeout");
        let config = fast_config(&dir);
        let mut target = FakeTarget::with_pack("p", 4);
        target.next_errors.push_back(DriverErrorKind::Timeout);
        let (mut driver, _state) = ready_driver(target);
        let pack = PackManifest::new("p", (0..4).map(|i| format!("p-{}", i)).collect());

        let err = run_cycle(
            &mut driver,
            &pack,
            config.timeouts.trial(),
            config.recovery.poll_interval(),
        )
        .expect_err("act timeout");
        assert_eq!(err.phase(), Phase::Act);
        assert_eq!(err.driver_kind(), Some(DriverErrorKind::Timeout));
        let _ = fs::remove_dir_all(dir);
    }
}
