//! The one place retry, backoff and bounded waiting live. Navigation, the
//! self-test loop and every readiness wait go through these helpers so the
//! escalation policy is not scattered across call sites.

use crate::classify::{Phase, SweepError};
use crate::driver::{DriverError, StateSnapshot, TargetDriver};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: u32,
    /// True when every attempt failed with a retryable error.
    pub exhausted: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Runs `op` (given the 1-based attempt number) until it succeeds, fails
    /// with a non-retryable error, or runs out of attempts. Fixed backoff.
    pub fn run<T, E: fmt::Display>(
        &self,
        label: &str,
        mut op: impl FnMut(u32) -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !retryable(&error) {
                        return Err(RetryError {
                            error,
                            attempts: attempt,
                            exhausted: false,
                        });
                    }
                    if attempt >= self.max_attempts {
                        return Err(RetryError {
                            error,
                            attempts: attempt,
                            exhausted: true,
                        });
                    }
                    tracing::warn!(
                        op = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "retrying after failure"
                    );
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitError {
    Driver(DriverError),
    Elapsed {
        waited: Duration,
        last: Option<StateSnapshot>,
    },
}

impl WaitError {
    pub fn into_sweep(
        self,
        phase: Phase,
        describe: impl FnOnce(Option<&StateSnapshot>) -> String,
    ) -> SweepError {
        match self {
            WaitError::Driver(source) => SweepError::driver(phase, source),
            WaitError::Elapsed { waited, last } => SweepError::StageTimeout {
                phase,
                waited_ms: waited.as_millis() as u64,
                detail: describe(last.as_ref()),
            },
        }
    }
}

/// Polls `observe()` until `accept` yields a value or `timeout` elapses.
/// Never blocks past the timeout: each observe gets the remaining budget.
pub fn poll_until<T>(
    driver: &mut dyn TargetDriver,
    timeout: Duration,
    interval: Duration,
    mut accept: impl FnMut(&StateSnapshot) -> Option<T>,
) -> Result<T, WaitError> {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut last = None;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WaitError::Elapsed {
                waited: start.elapsed(),
                last,
            });
        }
        let snapshot = driver.observe(remaining).map_err(WaitError::Driver)?;
        if let Some(value) = accept(&snapshot) {
            return Ok(value);
        }
        last = Some(snapshot);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WaitError::Elapsed {
                waited: start.elapsed(),
                last,
            });
        }
        thread::sleep(interval.min(remaining));
    }
}
