//! `meshcal-cli` – calibration command line.
//!
//! ```text
//! meshcal replay <scenario.json> [--json]   drive a scripted scenario through the engine
//! meshcal bake <scenario.json>              replay, then rebuild canonical estimates
//! meshcal config [init]                     show (or create) ~/.meshcal/config.toml
//! ```
//!
//! Ctrl-C stops a replay between steps and cancels a running bake.

mod config;
mod scenario;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;
use meshcal_memory::FloorPlanStore;
use meshcal_middleware::{CalibrationBus, encode};
use meshcal_runtime::{BakeJob, BakeJobError, init_tracing};
use meshcal_spatial::CanonicalFrame;
use tracing::warn;

use crate::config::Config;
use crate::scenario::{Replay, Scenario, StepRecord};

fn main() -> ExitCode {
    let _guard = init_tracing("meshcal");

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_handler = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – stopping …".yellow().bold());
        cancel_handler.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let cfg = match config::load() {
        Ok(Some(cfg)) => cfg,
        Ok(None) => Config::default(),
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red());
            eprintln!("  Using default configuration.");
            Config::default()
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("replay") => match args.get(1) {
            Some(path) => cmd_replay(&cfg, PathBuf::from(path), args.iter().any(|a| a == "--json"), &cancel),
            None => Err("replay needs a scenario file".to_string()),
        },
        Some("bake") => match args.get(1) {
            Some(path) => cmd_bake(&cfg, PathBuf::from(path), cancel),
            None => Err("bake needs a scenario file".to_string()),
        },
        Some("config") => cmd_config(&cfg, args.get(1).map(String::as_str)),
        Some("help") | Some("--help") | Some("-h") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => Err(format!("unknown command `{other}`")),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{} {msg}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_replay(cfg: &Config, path: PathBuf, json: bool, cancel: &AtomicBool) -> Result<(), String> {
    let scenario = Scenario::load(&path).map_err(|e| e.to_string())?;
    let frame = resolve_frame(cfg, &scenario)?;

    let bus = CalibrationBus::default();
    let mut events = bus.subscribe_all();
    let mut replay = Replay::new(&scenario, frame, cfg.bake_on_complete, bus).map_err(|e| e.to_string())?;

    println!(
        "  Replaying {} ({} session(s), frame {})",
        path.display().to_string().bold(),
        scenario.sessions.len(),
        if frame.is_some() { "on".green() } else { "off".yellow() }
    );

    let records = replay.run(&scenario.sessions, cancel, |record| {
        if json {
            for event in events.drain() {
                match encode(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "event not encoded"),
                }
            }
        } else {
            print_step(record);
        }
    });

    let failed = records.iter().filter(|r| r.result.is_err()).count();
    let store = replay.store();
    let guard = store.lock();
    let calibrated = guard.triangles().iter().filter(|t| t.is_calibrated).count();
    println!();
    println!(
        "  {} step(s), {} failed, {}/{} triangle(s) calibrated",
        records.len(),
        if failed == 0 { failed.to_string().green() } else { failed.to_string().red() },
        calibrated,
        guard.triangles().len()
    );
    drop(guard);

    for lm in replay.summary() {
        let consensus = lm.consensus.map_or_else(|| "–".to_string(), |p| p.to_string());
        let baked = lm.baked.map_or_else(|| "–".dimmed().to_string(), |p| p.to_string());
        println!("    {:<10} {:>2} record(s)  consensus {consensus}  baked {baked}", lm.name, lm.records);
    }
    Ok(())
}

fn cmd_bake(cfg: &Config, path: PathBuf, cancel: Arc<AtomicBool>) -> Result<(), String> {
    let scenario = Scenario::load(&path).map_err(|e| e.to_string())?;
    let frame = resolve_frame(cfg, &scenario)?
        .ok_or("bake needs a canonical frame: set map_width_px, map_height_px and pixels_per_meter")?;

    let mut replay =
        Replay::new(&scenario, Some(frame), false, CalibrationBus::default()).map_err(|e| e.to_string())?;
    let records = replay.run(&scenario.sessions, &cancel, |_| {});
    println!("  Replayed {} step(s) into history", records.len());

    let runtime = tokio::runtime::Runtime::new().map_err(|e| format!("failed to start runtime: {e}"))?;
    let job = BakeJob::new(replay.store(), frame).with_cancel_flag(cancel);
    let report = match runtime.block_on(job.spawn().join()) {
        Ok(report) => report,
        Err(BakeJobError::Cancelled) => {
            println!("{}", "  Bake cancelled; nothing committed.".yellow());
            return Ok(());
        }
        Err(e) => return Err(e.to_string()),
    };

    println!(
        "  {} Baked {} landmark(s) from {} session(s)",
        "✓".green().bold(),
        report.committed.len(),
        report.sessions_used.len()
    );
    if !report.sessions_skipped.is_empty() {
        println!("    {} session(s) skipped (no verifiable anchor pair)", report.sessions_skipped.len());
    }
    if !report.stale.is_empty() {
        println!("    {} landmark(s) changed during the bake and were left alone", report.stale.len());
    }

    let store = replay.store();
    let guard = store.lock();
    for id in &report.committed {
        if let Some(baked) = guard.landmark(*id).and_then(|l| l.baked) {
            println!(
                "    {:<10} {}  (confidence {:.2}, {} sample(s))",
                replay.label(*id),
                baked.position,
                baked.confidence,
                baked.sample_count
            );
        }
    }
    Ok(())
}

fn cmd_config(cfg: &Config, sub: Option<&str>) -> Result<(), String> {
    let path = config::config_path();
    if sub == Some("init") {
        if path.exists() {
            return Err(format!("{} already exists", path.display()));
        }
        config::save(&Config::default()).map_err(|e| e.to_string())?;
        println!("  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
        return Ok(());
    }

    println!("  Config file: {}", path.display().to_string().bold());
    let raw = toml::to_string_pretty(cfg).map_err(|e| e.to_string())?;
    for line in raw.lines() {
        println!("    {line}");
    }
    match cfg.frame() {
        Ok(Some(f)) => println!(
            "  Canonical frame: origin {} px, {} px/m",
            f.origin,
            f.pixels_per_meter
        ),
        Ok(None) => println!("  Canonical frame: {}", "not configured".yellow()),
        Err(e) => println!("  Canonical frame: {}", e.to_string().red()),
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Scenario frame first, then the configured one.
fn resolve_frame(cfg: &Config, scenario: &Scenario) -> Result<Option<CanonicalFrame>, String> {
    match scenario.frame {
        Some(spec) => spec.to_frame().map(Some).map_err(|e| e.to_string()),
        None => cfg.frame().map_err(|e| e.to_string()),
    }
}

fn print_step(record: &StepRecord) {
    let tag = format!("[{}.{}]", record.session, record.index).dimmed();
    match &record.result {
        Ok(msg) => println!("  {tag} {:<14} {msg}", record.action.cyan()),
        Err(msg) => println!("  {tag} {:<14} {}", record.action.cyan(), msg.red()),
    }
}

fn print_usage() {
    println!();
    println!("  {} {}", "meshcal".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Spatial calibration from floor plan to tracked space");
    println!();
    println!("  {}", "Commands".bold());
    println!("    replay <scenario.json> [--json]   drive a scenario through the engine");
    println!("    bake <scenario.json>              replay, then rebuild canonical estimates");
    println!("    config [init]                     show or create the config file");
    println!();
}
