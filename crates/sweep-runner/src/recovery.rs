//! Escalation ladder: retry, then soft reset, then session restart. All
//! budgets live in [`RecoveryState`]; nothing here touches the driver.

use crate::classify::FailureClass;
use crate::config::RecoveryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A terminal class (infra or data integrity).
    Terminal(FailureClass),
    RestartBudgetExhausted,
}

/// What the run controller should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Try the next trial in the same session.
    Retry,
    /// Re-run the bootstrap in the current session.
    SoftReset,
    /// Tear down the session and bootstrap a new generation.
    RestartSession,
    Abort(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Sampling,
    Recovering,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryState {
    pub stuck_max_consecutive: u32,
    pub max_recoveries: u32,
    pub max_restarts: u32,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    /// Never reset during a run.
    pub session_restarts: u32,
    pub mode: RecoveryMode,
    awaiting_confirmation: bool,
}

impl RecoveryState {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            stuck_max_consecutive: config.stuck_max_consecutive.max(1),
            max_recoveries: config.max_recoveries,
            max_restarts: config.max_restarts,
            consecutive_failures: 0,
            recovery_attempts: 0,
            session_restarts: 0,
            mode: RecoveryMode::Sampling,
            awaiting_confirmation: false,
        }
    }

    /// A trial failed with an already classified error.
    pub fn on_failure(&mut self, class: FailureClass) -> Decision {
        match class {
            FailureClass::InfraFatal | FailureClass::DataIntegrityFatal => {
                Decision::Abort(AbortReason::Terminal(class))
            }
            FailureClass::SessionFatal => self.request_restart(),
            FailureClass::Transient => {
                self.consecutive_failures += 1;
                if self.consecutive_failures < self.stuck_max_consecutive {
                    return Decision::Retry;
                }
                self.consecutive_failures = 0;
                self.recovery_attempts += 1;
                self.mode = RecoveryMode::Recovering;
                if self.recovery_attempts > self.max_recoveries {
                    tracing::warn!(
                        recovery_attempts = self.recovery_attempts,
                        max_recoveries = self.max_recoveries,
                        "soft reset budget spent, escalating to session restart"
                    );
                    self.request_restart()
                } else {
                    Decision::SoftReset
                }
            }
        }
    }

    /// The bootstrap failed. Terminal classes abort, everything else costs a
    /// session restart.
    pub fn on_bootstrap_failure(&mut self, class: FailureClass) -> Decision {
        if class.is_terminal() {
            Decision::Abort(AbortReason::Terminal(class))
        } else {
            self.request_restart()
        }
    }

    /// Recovery attempts only reset once a trial succeeds after this.
    pub fn on_bootstrap_success(&mut self) {
        self.awaiting_confirmation = true;
        self.mode = RecoveryMode::Sampling;
    }

    pub fn on_trial_success(&mut self) {
        self.consecutive_failures = 0;
        if self.awaiting_confirmation {
            self.recovery_attempts = 0;
            self.awaiting_confirmation = false;
        }
    }

    fn request_restart(&mut self) -> Decision {
        self.session_restarts += 1;
        self.consecutive_failures = 0;
        if self.session_restarts > self.max_restarts {
            Decision::Abort(AbortReason::RestartBudgetExhausted)
        } else {
            Decision::RestartSession
        }
    }
}
