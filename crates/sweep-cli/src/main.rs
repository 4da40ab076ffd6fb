use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use sweep_core::{load_progress, Manifest, RunMetadata};
use sweep_runner::{
    coverage_target, CoverageTracker, HttpProbe, PickStrategy, ProcessDriver, RunOptions,
    RunOutcome, SweepConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sweep", version, about = "Resilient sampling orchestrator")]
struct Cli {
    /// Debug-level logs on stderr (RUST_LOG takes precedence).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PickArg {
    #[value(name = "random")]
    Random,
    #[value(name = "shuffle")]
    Shuffle,
    #[value(name = "weighted")]
    Weighted,
}

impl From<PickArg> for PickStrategy {
    fn from(value: PickArg) -> Self {
        match value {
            PickArg::Random => PickStrategy::Random,
            PickArg::Shuffle => PickStrategy::Shuffle,
            PickArg::Weighted => PickStrategy::Weighted,
        }
    }
}

#[derive(Args, Debug, Default)]
struct TimeoutOverrides {
    #[arg(long)]
    timeout_connect_ms: Option<u64>,
    #[arg(long)]
    timeout_navigate_ms: Option<u64>,
    #[arg(long)]
    timeout_ready_ms: Option<u64>,
    #[arg(long)]
    timeout_flags_ms: Option<u64>,
    #[arg(long)]
    timeout_init_pack_ms: Option<u64>,
    #[arg(long)]
    timeout_seed_ms: Option<u64>,
    #[arg(long)]
    timeout_signal_ms: Option<u64>,
    #[arg(long)]
    timeout_trial_ms: Option<u64>,
}

#[derive(Args, Debug, Default)]
struct RunOverrides {
    #[arg(long, value_enum)]
    pick: Option<PickArg>,
    #[arg(long, conflicts_with = "samples")]
    coverage: Option<f64>,
    #[arg(long)]
    samples: Option<usize>,
    #[arg(long)]
    max_minutes: Option<u64>,
    #[arg(long)]
    reload_every: Option<u64>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[command(flatten)]
    timeouts: TimeoutOverrides,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        config: PathBuf,
        #[arg(long = "pack")]
        packs: Vec<String>,
        #[arg(long)]
        resume: bool,
        #[command(flatten)]
        overrides: RunOverrides,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Coverage {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long, default_value = "sweep.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

struct CommandOutput {
    payload: Option<Value>,
    success: bool,
}

impl CommandOutput {
    fn ok() -> Self {
        Self {
            payload: None,
            success: true,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(output) => {
            if let Some(payload) = &output.payload {
                emit_json(payload);
            }
            if !output.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Run {
            config,
            packs,
            resume,
            overrides,
            json,
        } => {
            let mut cfg = SweepConfig::load(&config)?;
            apply_overrides(&mut cfg, &overrides);
            let options = RunOptions {
                packs,
                resume,
                deadline: None,
            };
            let driver = Box::new(ProcessDriver::new(cfg.driver.command.clone()));
            let outcome = sweep_runner::run_sweep(&cfg, &options, driver, &HttpProbe)?;
            let success = outcome.fatal().is_none();
            if json {
                return Ok(CommandOutput {
                    payload: Some(run_outcome_to_json(&outcome)),
                    success,
                });
            }
            println!("run_id: {}", outcome.run_id);
            println!("run_dir: {}", outcome.run_dir.display());
            print_meta(&outcome.meta);
            Ok(CommandOutput {
                payload: None,
                success,
            })
        }
        Commands::Status { run_dir, json } => {
            let meta = sweep_runner::read_run_dir(&run_dir)?;
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": true,
                        "command": "status",
                        "meta": serde_json::to_value(&meta)?
                    })),
                    success: true,
                });
            }
            print_meta(&meta);
            Ok(CommandOutput::ok())
        }
        Commands::Coverage { config, json } => {
            let cfg = SweepConfig::load(&config)?;
            let rows = coverage_rows(&cfg)?;
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": true,
                        "command": "coverage",
                        "trials_log": cfg.trials_log_path().display().to_string(),
                        "packs": rows
                    })),
                    success: true,
                });
            }
            println!("trials_log: {}", cfg.trials_log_path().display());
            for row in &rows {
                println!(
                    "{}: visited {}/{} (total {}){}",
                    row["pack_id"].as_str().unwrap_or("-"),
                    row["visited"],
                    row["target"],
                    row["total"],
                    if row["done"] == true { " done" } else { "" }
                );
            }
            Ok(CommandOutput::ok())
        }
        Commands::Init { path, force } => {
            write_templates(&path, force)?;
            Ok(CommandOutput::ok())
        }
    }
}

fn apply_overrides(cfg: &mut SweepConfig, o: &RunOverrides) {
    if let Some(pick) = o.pick {
        cfg.pick = pick.into();
    }
    if let Some(ratio) = o.coverage {
        cfg.budget.coverage_ratio = ratio;
        cfg.budget.samples = None;
    }
    if let Some(samples) = o.samples {
        cfg.budget.samples = Some(samples);
    }
    if let Some(minutes) = o.max_minutes {
        cfg.budget.max_minutes = Some(minutes);
    }
    if let Some(every) = o.reload_every {
        cfg.reload_every = Some(every);
    }
    if let Some(dir) = &o.output_dir {
        cfg.output_dir = dir.clone();
    }
    let t = &o.timeouts;
    let slots = [
        (t.timeout_connect_ms, &mut cfg.timeouts.connect_ms),
        (t.timeout_navigate_ms, &mut cfg.timeouts.navigate_ms),
        (t.timeout_ready_ms, &mut cfg.timeouts.ready_ms),
        (t.timeout_flags_ms, &mut cfg.timeouts.flags_ms),
        (t.timeout_init_pack_ms, &mut cfg.timeouts.init_pack_ms),
        (t.timeout_seed_ms, &mut cfg.timeouts.seed_ms),
        (t.timeout_signal_ms, &mut cfg.timeouts.signal_ms),
        (t.timeout_trial_ms, &mut cfg.timeouts.trial_ms),
    ];
    for (value, slot) in slots {
        if let Some(ms) = value {
            *slot = ms;
        }
    }
}

fn coverage_rows(cfg: &SweepConfig) -> Result<Vec<Value>> {
    let manifest = Manifest::load(&cfg.manifest)?;
    let progress = load_progress(&cfg.trials_log_path())?;
    let mut tracker = CoverageTracker::new();
    tracker.seed_from(&manifest.packs, &progress, |pack| {
        coverage_target(pack.total(), cfg.budget.coverage_ratio, cfg.budget.samples)
    });
    let mut rows: Vec<Value> = manifest
        .packs
        .iter()
        .map(|pack| {
            json!({
                "pack_id": pack.id,
                "visited": tracker.visited(&pack.id),
                "target": tracker.target(&pack.id),
                "total": tracker.total(&pack.id),
                "done": tracker.is_done(&pack.id)
            })
        })
        .collect();
    let unknown: Vec<&String> = progress
        .visited_by_pack
        .keys()
        .filter(|id| manifest.pack(id).is_none())
        .collect();
    for id in unknown {
        tracing::warn!(pack = %id, "trials.log mentions a pack missing from the manifest");
        rows.push(json!({
            "pack_id": id,
            "visited": progress.visited(id),
            "target": Value::Null,
            "total": Value::Null,
            "done": false
        }));
    }
    if progress.malformed_lines > 0 {
        tracing::warn!(malformed = progress.malformed_lines, "malformed lines skipped");
    }
    Ok(rows)
}

fn print_meta(meta: &RunMetadata) {
    println!("run_id: {}", meta.run_id);
    println!("status: {:?}", meta.status);
    println!("started_at: {}", meta.started_at.to_rfc3339());
    match meta.finished_at {
        Some(t) => println!("finished_at: {}", t.to_rfc3339()),
        None => println!("finished_at: running"),
    }
    if let Some(deadline) = meta.budget.deadline {
        println!("deadline: {}", deadline.to_rfc3339());
    }
    for pack in &meta.packs {
        let reason = pack
            .skip_reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        println!(
            "pack {}: {} visited {}/{} iter {}{}",
            pack.pack_id,
            pack.status.as_str(),
            pack.visited,
            pack.target,
            pack.iter,
            reason
        );
    }
    let s = &meta.stats;
    println!(
        "stats: trials {} transient {} soft_resets {} restarts {} planned_reloads {} nav_timeouts {}",
        s.trials_written, s.transient_failures, s.soft_resets, s.restarts, s.planned_reloads, s.nav_timeouts
    );
    if let Some(err) = &meta.error {
        println!(
            "error: {} pack={} iter={} phase={} message={}",
            err.code,
            err.pack.as_deref().unwrap_or("-"),
            err.iter.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string()),
            err.phase,
            err.message
        );
    }
}

fn run_outcome_to_json(outcome: &RunOutcome) -> Value {
    json!({
        "ok": outcome.fatal().is_none(),
        "command": "run",
        "run_id": outcome.run_id,
        "run_dir": outcome.run_dir.display().to_string(),
        "meta": serde_json::to_value(&outcome.meta).unwrap_or(Value::Null),
        "error": outcome.fatal().map(|e| json!({
            "code": e.code,
            "pack": e.pack,
            "iter": e.iter,
            "phase": e.phase,
            "message": e.message
        }))
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Status { json, .. }
        | Commands::Coverage { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

const RUN_TEMPLATE: &str = r#"# Sweep run file. Relative paths resolve against this file's directory.
endpoint: http://127.0.0.1:5173/
manifest: manifest.json
output_dir: .sweep/run

driver:
  # Speaks line-delimited JSON on stdin/stdout.
  command: ["node", "driver.js"]

budget:
  coverage_ratio: 0.99
  # samples: 200
  max_minutes: 240
  checkpoint_every: 10

pick: shuffle
# reload_every: 50

flags:
  sampler_mode: true
  auto_advance: false

timeouts:
  connect_ms: 30000
  navigate_ms: 45000
  ready_ms: 30000
  trial_ms: 12000

recovery:
  stuck_max_consecutive: 3
  max_recoveries: 3
  max_restarts: 5

signal:
  primary: media
  fallback: synthetic
  min_level: 0.01
"#;

const MANIFEST_TEMPLATE: &str = r#"{
  "schema_version": "manifest_v1",
  "packs": [
    { "id": "example", "trials": ["example-0", "example-1", "example-2"] }
  ]
}
"#;

fn write_templates(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "init_exists: {} already exists (pass --force to overwrite)",
            path.display()
        ));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, RUN_TEMPLATE)?;
    println!("wrote: {}", path.display());

    let manifest = path
        .parent()
        .unwrap_or(Path::new("."))
        .join("manifest.json");
    if force || !manifest.exists() {
        std::fs::write(&manifest, MANIFEST_TEMPLATE)?;
        println!("wrote: {}", manifest.display());
    }
    Ok(())
}
