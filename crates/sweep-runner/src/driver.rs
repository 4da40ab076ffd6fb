//! The narrow contract between the orchestrator and whatever drives the
//! target application (a headless browser, a remote harness, a test double).

use crate::config::PickStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Structured failure reasons reported by a driver. Classification relies on
/// these, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverErrorKind {
    /// The call did not finish within its timeout.
    Timeout,
    /// The driver connection or target page was closed.
    Closed,
    /// The driver process died.
    Crashed,
    /// The endpoint refused or dropped the transport connection.
    Unreachable,
    /// The external signal source stopped producing input.
    SignalLost,
    /// The target rejected the action (e.g. control not present).
    Rejected,
    #[serde(other)]
    Protocol,
}

impl DriverErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Closed => "closed",
            DriverErrorKind::Crashed => "crashed",
            DriverErrorKind::Unreachable => "unreachable",
            DriverErrorKind::SignalLost => "signal_lost",
            DriverErrorKind::Rejected => "rejected",
            DriverErrorKind::Protocol => "protocol",
        }
    }
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("driver {kind}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(what: &str, waited: Duration) -> Self {
        Self::new(
            DriverErrorKind::Timeout,
            format!("{} did not answer within {}ms", what, waited.as_millis()),
        )
    }
}

/// What the target reports about itself. Every field is optional: `None`
/// means "not yet observed", which is distinct from an observed `false`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSnapshot {
    pub pack_id: Option<String>,
    /// Identifier of the trial the last `next` action resolved to.
    pub trial_id: Option<String>,
    /// Monotonic advance counter maintained by the target.
    pub trial_seq: Option<u64>,
    pub surface_ready: Option<bool>,
    pub trigger_enabled: Option<bool>,
    pub signal_level: Option<f64>,
}

impl StateSnapshot {
    pub fn fingerprint(&self) -> (Option<u64>, Option<&str>) {
        (self.trial_seq, self.trial_id.as_deref())
    }

    pub fn surface_ready(&self) -> bool {
        self.surface_ready == Some(true)
    }

    pub fn trigger_enabled(&self) -> bool {
        self.trigger_enabled == Some(true)
    }

    pub fn describe_flag(flag: Option<bool>) -> &'static str {
        match flag {
            None => "never observed",
            Some(true) => "observed true",
            Some(false) => "observed false",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    SetFlags {
        flags: BTreeMap<String, bool>,
    },
    InitPack {
        pack_id: String,
        pick: PickStrategy,
    },
    SeedPriority {
        pack_id: String,
        order: Vec<String>,
    },
    StartSignal {
        source: String,
    },
    Next,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::SetFlags { .. } => "set_flags",
            Action::InitPack { .. } => "init_pack",
            Action::SeedPriority { .. } => "seed_priority",
            Action::StartSignal { .. } => "start_signal",
            Action::Next => "next",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub samples: u32,
    pub warmup: u32,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySample {
    pub brightness: f64,
    pub motion: f64,
    pub signal_level: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub samples: Vec<TelemetrySample>,
    pub render_errors: u32,
    pub console_errors: u32,
}

/// Every call is bounded by the timeout it is given and reports failures as
/// a [`DriverError`] with a structured kind.
pub trait TargetDriver {
    fn connect(&mut self, timeout: Duration) -> Result<(), DriverError>;
    fn disconnect(&mut self);
    fn navigate(&mut self, endpoint: &str, timeout: Duration) -> Result<(), DriverError>;
    fn observe(&mut self, timeout: Duration) -> Result<StateSnapshot, DriverError>;
    fn act(&mut self, action: &Action, timeout: Duration) -> Result<(), DriverError>;
    fn sample_telemetry(
        &mut self,
        window: &WindowSpec,
        timeout: Duration,
    ) -> Result<Metrics, DriverError>;
}
