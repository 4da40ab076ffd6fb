//! In-memory target and helpers shared by the unit tests.

use crate::bootstrap::LivenessProbe;
use crate::config::SweepConfig;
use crate::driver::{
    Action, DriverError, DriverErrorKind, Metrics, StateSnapshot, TargetDriver, TelemetrySample,
    WindowSpec,
};
use crate::Clock;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

pub fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sweep_runner_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("temp dir");
    dir
}

fn trial_ids(pack: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}-{}", pack, i)).collect()
}

/// Writes a manifest with `{pack}-{i}` trial ids and returns its path.
pub fn write_manifest(dir: &Path, packs: &[(&str, usize)]) -> PathBuf {
    let packs: Vec<_> = packs
        .iter()
        .map(|(id, n)| json!({"id": id, "trials": trial_ids(id, *n)}))
        .collect();
    let path = dir.join("manifest.json");
    fs::write(
        &path,
        serde_json::to_vec_pretty(&json!({"schema_version": "manifest_v1", "packs": packs}))
            .expect("json"),
    )
    .expect("write manifest");
    path
}

/// Millisecond timeouts so failure paths finish quickly.
pub fn fast_config(dir: &Path) -> SweepConfig {
    let mut config = SweepConfig {
        endpoint: "http://fake.invalid/".to_string(),
        manifest: dir.join("manifest.json"),
        output_dir: dir.join("run"),
        ..SweepConfig::default()
    };
    config.budget.max_minutes = None;
    config.budget.checkpoint_every = 2;
    config.budget.seed = Some(11);
    config.timeouts.connect_ms = 20;
    config.timeouts.navigate_ms = 20;
    config.timeouts.ready_ms = 30;
    config.timeouts.flags_ms = 20;
    config.timeouts.init_pack_ms = 30;
    config.timeouts.seed_ms = 20;
    config.timeouts.signal_ms = 30;
    config.timeouts.trial_ms = 30;
    config.recovery.poll_interval_ms = 1;
    config.recovery.nav_backoff_ms = 0;
    config.recovery.max_restarts = 2;
    config.telemetry.samples = 4;
    config.telemetry.warmup = 1;
    config.telemetry.interval_ms = 0;
    config
}

#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

pub struct StubProbe {
    alive: bool,
    pub calls: Cell<u32>,
}

impl StubProbe {
    pub fn alive() -> Self {
        Self {
            alive: true,
            calls: Cell::new(0),
        }
    }

    pub fn dead() -> Self {
        Self {
            alive: false,
            calls: Cell::new(0),
        }
    }
}

impl LivenessProbe for StubProbe {
    fn is_alive(&self, _endpoint: &str, _timeout: Duration) -> bool {
        self.calls.set(self.calls.get() + 1);
        self.alive
    }
}

/// Scripted target state plus fault knobs. Trial ids are handed out in
/// manifest order, wrapping around.
pub struct FakeTarget {
    pub packs: BTreeMap<String, Vec<String>>,
    pub working_sources: BTreeSet<String>,
    pub fail_connect: Option<DriverErrorKind>,
    pub nav_always: Option<DriverErrorKind>,
    /// Overrides the pack identity the target reports.
    pub report_pack: Option<String>,
    pub next_errors: VecDeque<DriverErrorKind>,
    pub next_always: Option<DriverErrorKind>,
    /// The next N `next` actions succeed without changing state, once
    /// `stall_after_advances` advances have happened.
    pub stall_next: u32,
    pub stall_after_advances: u64,
    /// The Nth advancing `next` resolves to an id outside the manifest.
    pub foreign_at_next: Option<u64>,
    /// The Nth advancing `next` resolves to no identifier at all.
    pub anonymous_at_next: Option<u64>,
    /// The `next` that would make the Nth advance crashes the driver
    /// instead. Fires once.
    pub crash_at_next: Option<u64>,
    pub tick: Option<(ManualClock, chrono::Duration)>,

    pub connected: bool,
    pub connects: u32,
    pub disconnects: u32,
    pub navigations: u32,
    pub surface_ready: bool,
    pub flags: BTreeMap<String, bool>,
    pub pack: Option<String>,
    pub seeded: Vec<(String, Vec<String>)>,
    pub signal: Option<f64>,
    pub seq: u64,
    pub trial_id: Option<String>,
    pub advances: u64,
    cursors: BTreeMap<String, usize>,
}

pub type SharedTarget = Rc<RefCell<FakeTarget>>;

impl FakeTarget {
    pub fn with_packs(packs: &[(&str, usize)]) -> Self {
        Self {
            packs: packs
                .iter()
                .map(|(id, n)| (id.to_string(), trial_ids(id, *n)))
                .collect(),
            working_sources: ["media", "synthetic"].iter().map(|s| s.to_string()).collect(),
            fail_connect: None,
            nav_always: None,
            report_pack: None,
            next_errors: VecDeque::new(),
            next_always: None,
            stall_next: 0,
            stall_after_advances: 0,
            foreign_at_next: None,
            anonymous_at_next: None,
            crash_at_next: None,
            tick: None,
            connected: false,
            connects: 0,
            disconnects: 0,
            navigations: 0,
            surface_ready: false,
            flags: BTreeMap::new(),
            pack: None,
            seeded: Vec::new(),
            signal: None,
            seq: 0,
            trial_id: None,
            advances: 0,
            cursors: BTreeMap::new(),
        }
    }

    pub fn with_pack(id: &str, n: usize) -> Self {
        Self::with_packs(&[(id, n)])
    }

    fn reset_page(&mut self) {
        self.surface_ready = false;
        self.pack = None;
        self.signal = None;
        self.trial_id = None;
    }

    fn advance(&mut self) -> Result<(), DriverError> {
        let pack = self
            .pack
            .clone()
            .ok_or_else(|| DriverError::new(DriverErrorKind::Rejected, "no pack loaded"))?;
        self.advances += 1;
        self.seq += 1;
        if let Some((clock, by)) = &self.tick {
            clock.advance(*by);
        }
        if self.foreign_at_next == Some(self.advances) {
            self.trial_id = Some("rogue-trial".to_string());
            return Ok(());
        }
        if self.anonymous_at_next == Some(self.advances) {
            self.trial_id = None;
            return Ok(());
        }
        let ids = self.packs.get(&pack).cloned().unwrap_or_default();
        if ids.is_empty() {
            self.trial_id = None;
            return Ok(());
        }
        let cursor = self.cursors.entry(pack).or_insert(0);
        self.trial_id = Some(ids[*cursor % ids.len()].clone());
        *cursor += 1;
        Ok(())
    }

    fn snapshot(&self) -> StateSnapshot {
        let loaded = self.surface_ready.then_some(true);
        StateSnapshot {
            pack_id: self.report_pack.clone().or_else(|| self.pack.clone()),
            trial_id: self.trial_id.clone(),
            trial_seq: self.pack.as_ref().map(|_| self.seq),
            surface_ready: loaded,
            trigger_enabled: loaded.map(|_| self.pack.is_some()),
            signal_level: self.signal,
        }
    }
}

pub struct ScriptedDriver {
    state: SharedTarget,
}

impl ScriptedDriver {
    pub fn new(target: FakeTarget) -> (Self, SharedTarget) {
        let state = Rc::new(RefCell::new(target));
        (
            Self {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

fn not_connected() -> DriverError {
    DriverError::new(DriverErrorKind::Closed, "not connected")
}

impl TargetDriver for ScriptedDriver {
    fn connect(&mut self, _timeout: Duration) -> Result<(), DriverError> {
        let mut t = self.state.borrow_mut();
        if let Some(kind) = t.fail_connect {
            return Err(DriverError::new(kind, "connect refused"));
        }
        t.connected = true;
        t.connects += 1;
        t.reset_page();
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut t = self.state.borrow_mut();
        if t.connected {
            t.connected = false;
            t.disconnects += 1;
        }
    }

    fn navigate(&mut self, _endpoint: &str, _timeout: Duration) -> Result<(), DriverError> {
        let mut t = self.state.borrow_mut();
        if !t.connected {
            return Err(not_connected());
        }
        t.navigations += 1;
        t.reset_page();
        if let Some(kind) = t.nav_always {
            return Err(DriverError::new(kind, "navigation failed"));
        }
        t.surface_ready = true;
        Ok(())
    }

    fn observe(&mut self, _timeout: Duration) -> Result<StateSnapshot, DriverError> {
        let t = self.state.borrow();
        if !t.connected {
            return Err(not_connected());
        }
        Ok(t.snapshot())
    }

    fn act(&mut self, action: &Action, _timeout: Duration) -> Result<(), DriverError> {
        let mut t = self.state.borrow_mut();
        if !t.connected {
            return Err(not_connected());
        }
        if !t.surface_ready {
            return Err(DriverError::new(DriverErrorKind::Rejected, "page not loaded"));
        }
        match action {
            Action::SetFlags { flags } => {
                t.flags.extend(flags.clone());
                Ok(())
            }
            Action::InitPack { pack_id, .. } => {
                if !t.packs.contains_key(pack_id) {
                    return Err(DriverError::new(DriverErrorKind::Rejected, "unknown pack"));
                }
                t.pack = Some(pack_id.clone());
                t.trial_id = None;
                Ok(())
            }
            Action::SeedPriority { pack_id, order } => {
                t.seeded.push((pack_id.clone(), order.clone()));
                Ok(())
            }
            Action::StartSignal { source } => {
                t.signal = Some(if t.working_sources.contains(source) {
                    0.5
                } else {
                    0.0
                });
                Ok(())
            }
            Action::Next => {
                if let Some(kind) = t.next_always {
                    return Err(DriverError::new(kind, "next failed"));
                }
                if let Some(kind) = t.next_errors.pop_front() {
                    return Err(DriverError::new(kind, "next failed"));
                }
                if t.crash_at_next == Some(t.advances + 1) {
                    t.crash_at_next = None;
                    t.connected = false;
                    return Err(DriverError::new(DriverErrorKind::Crashed, "driver crashed"));
                }
                if t.stall_next > 0 && t.advances >= t.stall_after_advances {
                    t.stall_next -= 1;
                    return Ok(());
                }
                t.advance()
            }
        }
    }

    fn sample_telemetry(
        &mut self,
        window: &WindowSpec,
        _timeout: Duration,
    ) -> Result<Metrics, DriverError> {
        let t = self.state.borrow();
        if !t.connected {
            return Err(not_connected());
        }
        let level = t.signal.unwrap_or(0.0);
        Ok(Metrics {
            samples: (0..window.samples)
                .map(|_| TelemetrySample {
                    brightness: 0.5,
                    motion: 0.05,
                    signal_level: level,
                })
                .collect(),
            render_errors: 0,
            console_errors: 0,
        })
    }
}
