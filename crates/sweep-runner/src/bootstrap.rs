//! Brings a freshly connected session to a verified-ready state. Each step
//! has its own timeout and the last step drives two real cycles through the
//! same path the trial loop uses.

use crate::classify::{recoverable_during_self_test, Phase, SweepError};
use crate::config::SweepConfig;
use crate::driver::{Action, DriverErrorKind, StateSnapshot, TargetDriver};
use crate::retry::{poll_until, RetryPolicy, WaitError};
use crate::trial::run_cycle;
use std::time::Duration;
use sweep_core::{PackManifest, RunStats};

const SELF_TEST_CYCLES: u32 = 2;

/// Transport-level check used when navigation keeps failing.
pub trait LivenessProbe {
    fn is_alive(&self, endpoint: &str, timeout: Duration) -> bool;
}

/// Any HTTP response, error statuses included, counts as alive.
pub struct HttpProbe;

impl LivenessProbe for HttpProbe {
    fn is_alive(&self, endpoint: &str, timeout: Duration) -> bool {
        let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(error = %err, "failed to build liveness client");
                return false;
            }
        };
        match client.get(endpoint).send() {
            Ok(resp) => {
                tracing::debug!(endpoint, status = resp.status().as_u16(), "endpoint answered");
                true
            }
            Err(err) => {
                tracing::warn!(endpoint, error = %err, "liveness preflight failed");
                false
            }
        }
    }
}

pub struct BootstrapRequest<'a> {
    pub config: &'a SweepConfig,
    pub pack: &'a PackManifest,
    /// Seeded into the target when present.
    pub priority: Option<&'a [String]>,
    pub probe: &'a dyn LivenessProbe,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapReport {
    pub signal_source: String,
    pub attempts: u32,
    pub self_test_ids: Vec<Option<String>>,
}

pub fn bootstrap(
    driver: &mut dyn TargetDriver,
    req: &BootstrapRequest<'_>,
    stats: &mut RunStats,
) -> Result<BootstrapReport, SweepError> {
    let policy = RetryPolicy::new(req.config.recovery.self_test_attempts, Duration::ZERO);
    let report = policy
        .run(
            "bootstrap",
            |attempt| {
                let mut report = bootstrap_once(driver, req, stats)?;
                report.attempts = attempt;
                Ok(report)
            },
            recoverable_during_self_test,
        )
        .map_err(|failure| failure.error)?;
    tracing::info!(
        pack = %req.pack.id,
        signal = %report.signal_source,
        attempts = report.attempts,
        self_test = ?report.self_test_ids,
        "bootstrap complete"
    );
    Ok(report)
}

fn bootstrap_once(
    driver: &mut dyn TargetDriver,
    req: &BootstrapRequest<'_>,
    stats: &mut RunStats,
) -> Result<BootstrapReport, SweepError> {
    let config = req.config;
    let poll = config.recovery.poll_interval();

    navigate(driver, req, stats)?;

    poll_until(driver, config.timeouts.ready(), poll, |s| {
        s.surface_ready().then_some(())
    })
    .map_err(|e| {
        e.into_sweep(Phase::Ready, |last| {
            format!(
                "surface {}",
                StateSnapshot::describe_flag(last.and_then(|s| s.surface_ready))
            )
        })
    })?;

    driver
        .act(
            &Action::SetFlags {
                flags: config.flags.clone(),
            },
            config.timeouts.flags(),
        )
        .map_err(|e| SweepError::driver(Phase::Flags, e))?;

    init_pack(driver, config, &req.pack.id)?;

    if let Some(order) = req.priority {
        tracing::info!(pack = %req.pack.id, ids = order.len(), "seeding priority order");
        driver
            .act(
                &Action::SeedPriority {
                    pack_id: req.pack.id.clone(),
                    order: order.to_vec(),
                },
                config.timeouts.seed(),
            )
            .map_err(|e| SweepError::driver(Phase::Seed, e))?;
    }

    let signal_source = establish_signal(driver, config)?;

    let mut self_test_ids = Vec::new();
    for cycle in 1..=SELF_TEST_CYCLES {
        match run_cycle(driver, req.pack, config.timeouts.trial(), poll) {
            Ok(outcome) => self_test_ids.push(outcome.trial_id),
            Err(SweepError::StageTimeout {
                phase: Phase::AwaitChange,
                ..
            }) => return Err(SweepError::SelfTestStalled { cycle }),
            Err(SweepError::Driver { source, .. }) => {
                return Err(SweepError::driver(Phase::SelfTest, source))
            }
            Err(other) => return Err(other),
        }
    }

    Ok(BootstrapReport {
        signal_source,
        attempts: 1,
        self_test_ids,
    })
}

fn navigate(
    driver: &mut dyn TargetDriver,
    req: &BootstrapRequest<'_>,
    stats: &mut RunStats,
) -> Result<(), SweepError> {
    let config = req.config;
    let policy = RetryPolicy::new(
        config.recovery.nav_attempts,
        Duration::from_millis(config.recovery.nav_backoff_ms),
    );
    let result = policy.run(
        "navigate",
        |_| {
            let out = driver.navigate(&config.endpoint, config.timeouts.navigate());
            if matches!(&out, Err(e) if e.kind == DriverErrorKind::Timeout) {
                stats.nav_timeouts += 1;
            }
            out
        },
        |e| {
            matches!(
                e.kind,
                DriverErrorKind::Timeout
                    | DriverErrorKind::Unreachable
                    | DriverErrorKind::Rejected
                    | DriverErrorKind::Protocol
            )
        },
    );
    match result {
        Ok(()) => Ok(()),
        Err(failure) if failure.exhausted => {
            if req.probe.is_alive(&config.endpoint, config.timeouts.connect()) {
                tracing::warn!(
                    endpoint = %config.endpoint,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "navigation kept failing but the endpoint answers; continuing to readiness checks"
                );
                Ok(())
            } else {
                Err(SweepError::Unreachable {
                    detail: format!(
                        "{} after {} navigation attempts: {}",
                        config.endpoint, failure.attempts, failure.error
                    ),
                })
            }
        }
        Err(failure) => Err(SweepError::driver(Phase::Navigate, failure.error)),
    }
}

fn init_pack(
    driver: &mut dyn TargetDriver,
    config: &SweepConfig,
    pack_id: &str,
) -> Result<(), SweepError> {
    driver
        .act(
            &Action::InitPack {
                pack_id: pack_id.to_string(),
                pick: config.pick,
            },
            config.timeouts.init_pack(),
        )
        .map_err(|e| SweepError::driver(Phase::InitPack, e))?;

    match poll_until(
        driver,
        config.timeouts.init_pack(),
        config.recovery.poll_interval(),
        |s| (s.pack_id.as_deref() == Some(pack_id)).then_some(()),
    ) {
        Ok(()) => Ok(()),
        Err(WaitError::Elapsed {
            last: Some(StateSnapshot {
                pack_id: Some(observed),
                ..
            }),
            ..
        }) => Err(SweepError::PackMismatch {
            phase: Phase::InitPack,
            expected: pack_id.to_string(),
            observed,
        }),
        Err(e) => Err(e.into_sweep(Phase::InitPack, |_| {
            format!("pack '{}' never reported", pack_id)
        })),
    }
}

/// Tries the primary source, then the fallback. Returns the source in use.
fn establish_signal(
    driver: &mut dyn TargetDriver,
    config: &SweepConfig,
) -> Result<String, SweepError> {
    let min_level = config.signal.min_level;
    let mut sources = vec![config.signal.primary.clone()];
    if let Some(fallback) = &config.signal.fallback {
        sources.push(fallback.clone());
    }
    let mut best_level = 0.0_f64;
    for source in sources {
        let start = Action::StartSignal {
            source: source.clone(),
        };
        match driver.act(&start, config.timeouts.signal()) {
            Ok(()) => {}
            Err(e) if is_session_loss(e.kind) => return Err(SweepError::driver(Phase::Signal, e)),
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "signal source failed to start");
                continue;
            }
        }
        let waited = poll_until(
            driver,
            config.timeouts.signal(),
            config.recovery.poll_interval(),
            |s| {
                let level = s.signal_level?;
                best_level = best_level.max(level);
                (level >= min_level).then_some(level)
            },
        );
        match waited {
            Ok(level) => {
                tracing::info!(source = %source, level, "signal established");
                return Ok(source);
            }
            Err(WaitError::Driver(e)) if is_session_loss(e.kind) => {
                return Err(SweepError::driver(Phase::Signal, e))
            }
            Err(_) => {
                tracing::warn!(source = %source, best_level, "no detectable signal from source");
            }
        }
    }
    Err(SweepError::NoSignal {
        best_level,
        min_level,
    })
}

fn is_session_loss(kind: DriverErrorKind) -> bool {
    matches!(kind, DriverErrorKind::Closed | DriverErrorKind::Crashed)
}
