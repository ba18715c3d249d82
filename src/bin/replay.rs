use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::{json, Value};
use territory_tracker_rs::provider::load_fix_log;
use territory_tracker_rs::telemetry::TelemetryReporter;
use territory_tracker_rs::tracker::TerritorySummary;
use territory_tracker_rs::{RunTracker, TrackerConfig};

#[derive(Parser, Debug)]
struct Args {
    /// Path to a fix log (.json, .jsonl or .json.gz)
    #[arg(long, conflicts_with = "log_dir", required_unless_present = "log_dir")]
    log: Option<PathBuf>,

    /// Directory of fix logs to batch replay
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// JSON config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum plausible speed (m/s)
    #[arg(long)]
    max_speed: Option<f64>,

    /// Maximum plausible acceleration (m/s²)
    #[arg(long)]
    max_acceleration: Option<f64>,

    /// Minimum distance between accepted fixes (meters)
    #[arg(long)]
    min_distance: Option<f64>,

    /// Stationary jitter radius (meters)
    #[arg(long)]
    jitter_radius: Option<f64>,

    /// Accuracy gate before the first accepted fix (meters)
    #[arg(long)]
    cold_accuracy: Option<f64>,

    /// Accuracy gate after the first accepted fix (meters)
    #[arg(long)]
    warm_accuracy: Option<f64>,

    /// Loop-closure radius (meters)
    #[arg(long)]
    loop_radius: Option<f64>,

    /// Write the results here as well as to stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

fn build_config(args: &Args) -> anyhow::Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    let f = &mut config.filter;
    if let Some(v) = args.max_speed {
        f.max_speed_ms = v;
    }
    if let Some(v) = args.max_acceleration {
        f.max_acceleration_ms2 = v;
    }
    if let Some(v) = args.min_distance {
        f.min_distance_m = v;
    }
    if let Some(v) = args.jitter_radius {
        f.jitter_radius_m = v;
    }
    if let Some(v) = args.cold_accuracy {
        f.cold_accuracy_m = v;
    }
    if let Some(v) = args.warm_accuracy {
        f.warm_accuracy_m = v;
    }
    if let Some(v) = args.loop_radius {
        config.loop_closure.radius_m = v;
    }
    config.validate()?;
    Ok(config)
}

fn is_fix_log(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".json") || name.ends_with(".jsonl") || name.ends_with(".json.gz")
}

fn replay_log(path: &Path, config: &TrackerConfig) -> anyhow::Result<Value> {
    let fixes = load_fix_log(path)?;
    let total = fixes.len();
    let start = fixes.first().map(|f| f.timestamp).unwrap_or(0);
    let end = fixes.last().map(|f| f.timestamp).unwrap_or(start).max(start);

    let mut tracker = RunTracker::new(config, TelemetryReporter::disabled());
    tracker.start_run(start)?;

    let mut implausible = 0usize;
    for fix in fixes {
        if let Err(why) = fix.plausibility() {
            log::debug!("[Replay] skipping fix at {}: {}", fix.timestamp, why);
            implausible += 1;
            continue;
        }
        let at = fix.timestamp;
        if let Some(closed) = tracker.ingest(fix, at).closed {
            println!(
                "[CLOSE] t={} points={} gap={:.1}m area={:.0}m²",
                closed.closed_at,
                closed.len(),
                closed.closing_gap_m,
                closed.area_m2()
            );
        }
    }

    let summary = tracker.stop_run(end)?;
    let stats = &summary.stats;
    let territories: Vec<&TerritorySummary> = summary.territories.iter().collect();

    Ok(json!({
        "file": path.display().to_string(),
        "fixes": total,
        "implausible": implausible,
        "accepted": stats.accepted,
        "rejected": stats.rejected,
        "rejected_by_reason": stats.rejected_by_reason,
        "distance_km": stats.trajectory.distance_km,
        "duration": stats.trajectory.duration,
        "pace": stats.trajectory.pace,
        "calories": stats.trajectory.calories,
        "open_path_len": stats.trajectory.open_path_len,
        "territories": territories,
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = build_config(&args)?;

    let mut results = Vec::new();
    if let Some(dir) = args.log_dir.as_ref() {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_fix_log(p))
            .collect();
        paths.sort();
        for path in paths {
            match replay_log(&path, &config) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(path) = args.log.as_ref() {
        results.push(replay_log(path, &config)?);
    }

    let text = serde_json::to_string_pretty(&results)?;
    if let Some(out) = args.output.as_ref() {
        fs::write(out, &text)?;
    }
    println!("{}", text);
    Ok(())
}
