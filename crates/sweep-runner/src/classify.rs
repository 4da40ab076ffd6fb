use crate::driver::{DriverError, DriverErrorKind};
use serde::Serialize;
use std::fmt;

/// Where in the bootstrap or trial sequence an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connect,
    Navigate,
    Ready,
    Flags,
    InitPack,
    Seed,
    Signal,
    SelfTest,
    AwaitTrigger,
    Act,
    AwaitChange,
    Verify,
    Telemetry,
    Persist,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connect => "connect",
            Phase::Navigate => "navigate",
            Phase::Ready => "ready",
            Phase::Flags => "flags",
            Phase::InitPack => "init_pack",
            Phase::Seed => "seed",
            Phase::Signal => "signal",
            Phase::SelfTest => "self_test",
            Phase::AwaitTrigger => "await_trigger",
            Phase::Act => "act",
            Phase::AwaitChange => "await_change",
            Phase::Verify => "verify",
            Phase::Telemetry => "telemetry",
            Phase::Persist => "persist",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SweepError {
    #[error("{phase}: {source}")]
    Driver {
        phase: Phase,
        #[source]
        source: DriverError,
    },
    #[error("{phase}: timed out after {waited_ms}ms ({detail})")]
    StageTimeout {
        phase: Phase,
        waited_ms: u64,
        detail: String,
    },
    #[error("target unreachable: {detail}")]
    Unreachable { detail: String },
    #[error("pack '{pack}' produced trial '{trial_id}' which is not in the manifest")]
    UnknownTrial { pack: String, trial_id: String },
    #[error("{phase}: expected pack '{expected}', target reports '{observed}'")]
    PackMismatch {
        phase: Phase,
        expected: String,
        observed: String,
    },
    #[error("no detectable signal (best level {best_level:.4}, need {min_level:.4})")]
    NoSignal { best_level: f64, min_level: f64 },
    #[error("self-test cycle {cycle} did not advance the target state")]
    SelfTestStalled { cycle: u32 },
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl SweepError {
    pub fn driver(phase: Phase, source: DriverError) -> Self {
        SweepError::Driver { phase, source }
    }

    pub fn phase(&self) -> Phase {
        match self {
            SweepError::Driver { phase, .. }
            | SweepError::StageTimeout { phase, .. }
            | SweepError::PackMismatch { phase, .. } => *phase,
            SweepError::Unreachable { .. } => Phase::Navigate,
            SweepError::UnknownTrial { .. } => Phase::Verify,
            SweepError::NoSignal { .. } => Phase::Signal,
            SweepError::SelfTestStalled { .. } => Phase::SelfTest,
            SweepError::Persistence(_) => Phase::Persist,
        }
    }

    pub fn driver_kind(&self) -> Option<DriverErrorKind> {
        match self {
            SweepError::Driver { source, .. } => Some(source.kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    SessionFatal,
    InfraFatal,
    DataIntegrityFatal,
}

impl FailureClass {
    /// Terminal classes end the run without spending any restart budget.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FailureClass::InfraFatal | FailureClass::DataIntegrityFatal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::SessionFatal => "session_fatal",
            FailureClass::InfraFatal => "infra_fatal",
            FailureClass::DataIntegrityFatal => "data_integrity_fatal",
        }
    }
}

pub fn classify(err: &SweepError) -> FailureClass {
    match err {
        SweepError::Driver { source, .. } => match source.kind {
            DriverErrorKind::Timeout | DriverErrorKind::SignalLost => FailureClass::Transient,
            DriverErrorKind::Unreachable => FailureClass::InfraFatal,
            DriverErrorKind::Closed
            | DriverErrorKind::Crashed
            | DriverErrorKind::Rejected
            | DriverErrorKind::Protocol => FailureClass::SessionFatal,
        },
        SweepError::StageTimeout { .. } => FailureClass::Transient,
        SweepError::Unreachable { .. } => FailureClass::InfraFatal,
        SweepError::UnknownTrial { .. } => FailureClass::DataIntegrityFatal,
        // The target switched datasets under a running pack.
        SweepError::PackMismatch {
            phase: Phase::Verify,
            ..
        } => FailureClass::DataIntegrityFatal,
        SweepError::Persistence(_) => FailureClass::InfraFatal,
        SweepError::PackMismatch { .. }
        | SweepError::NoSignal { .. }
        | SweepError::SelfTestStalled { .. } => FailureClass::SessionFatal,
    }
}

/// The error code written to `meta.json` for a fatal error.
pub fn fatal_code(err: &SweepError, class: FailureClass) -> &'static str {
    match (err, class) {
        (SweepError::Persistence(_), _) => "persistence_failed",
        (_, FailureClass::DataIntegrityFatal) => "data_integrity",
        (_, FailureClass::InfraFatal) => "infra_unreachable",
        _ => "restart_budget_exhausted",
    }
}

/// During the self-test only a closed connection or a lost signal is worth
/// another attempt; everything else propagates.
pub fn recoverable_during_self_test(err: &SweepError) -> bool {
    matches!(
        err,
        SweepError::Driver {
            phase: Phase::SelfTest,
            source,
        } if matches!(source.kind, DriverErrorKind::Closed | DriverErrorKind::SignalLost)
    )
}
