use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration, Instant};

use territory_tracker_rs::live_status::LiveStatus;
use territory_tracker_rs::provider::{PositioningProvider, ReplayProvider, TermuxProvider};
use territory_tracker_rs::telemetry::{JsonlFileSink, TelemetryReporter};
use territory_tracker_rs::tracker::TerritorySummary;
use territory_tracker_rs::types::now_ms;
use territory_tracker_rs::{FileFixCache, PositioningSession, RunTracker, TrackerConfig, WatchMode};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// termux-location on the device
    Termux,
    /// Recorded fix log given with --replay
    Replay,
    /// Generated circular loop around --center
    Synthetic,
}

#[derive(Parser, Debug)]
#[command(name = "territory_tracker")]
#[command(about = "GPS run tracker: filtered trajectory with loop-closure territories", long_about = None)]
struct Args {
    /// Duration in seconds (0 = run until Ctrl+C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Positioning backend
    #[arg(long, value_enum, default_value = "termux")]
    provider: Backend,

    /// Fix log for the replay backend (.json, .jsonl or .json.gz)
    #[arg(long, required_if_eq("provider", "replay"))]
    replay: Option<PathBuf>,

    /// Milliseconds between replayed fixes (default: watch interval)
    #[arg(long)]
    pace_ms: Option<u64>,

    /// Center of the synthetic loop as LAT,LNG
    #[arg(long, default_value = "39.9042,116.4074")]
    center: String,

    /// Radius of the synthetic loop in meters
    #[arg(long, default_value = "30.0")]
    radius: f64,

    /// JSON config overriding the default thresholds
    #[arg(long)]
    config: Option<PathBuf>,

    /// Append sampled filter decisions to this JSONL file
    #[arg(long)]
    telemetry_log: Option<PathBuf>,

    /// Output directory for status, summary and the last-known-fix cache
    #[arg(long, default_value = "territory_tracker_sessions")]
    output_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };

    println!("[{}] Territory Tracker Starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Provider: {:?}", args.provider);
    println!("  Output Dir: {}", args.output_dir);

    fs::create_dir_all(&args.output_dir)?;

    let provider = build_provider(&args)?;
    let cache = Arc::new(FileFixCache::new(&args.output_dir));

    let telemetry = match &args.telemetry_log {
        Some(path) => {
            println!("  Telemetry: {}", path.display());
            TelemetryReporter::new(config.telemetry.clone(), Arc::new(JsonlFileSink::create(path)?))
        }
        None => TelemetryReporter::disabled(),
    };

    let session = PositioningSession::new(provider, cache, config.session.clone());
    let mut fixes = session
        .take_fix_stream()
        .ok_or_else(|| anyhow!("fix stream already taken"))?;

    println!("[{}] Acquiring position...", ts_now());
    let state = session.init().await;
    let status = session.status();
    println!("[{}] Session {:?}, signal {:?}", ts_now(), state, status.signal);
    if let Some(err) = &status.last_error {
        println!("[{}] Positioning error [{:?}]: {}", ts_now(), err.code, err.message);
    }
    if let Some(fix) = &status.current_fix {
        println!(
            "[{}] Starting at {:.6}, {:.6} ({:?})",
            ts_now(),
            fix.lat,
            fix.lng,
            fix.source
        );
    }

    if !session.switch_mode(WatchMode::Running, None).await {
        println!("[{}] Running watch could not be started", ts_now());
    }

    let mut tracker = RunTracker::new(&config, telemetry.clone());
    tracker.start_run(now_ms())?;
    println!("[{}] Run started", ts_now());

    let started = Instant::now();
    let deadline = async {
        if args.duration > 0 {
            sleep(Duration::from_secs(args.duration)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let status_path = format!("{}/live_status.json", args.output_dir);
    let mut status_tick = interval(Duration::from_secs(2));
    let mut territories = 0usize;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                println!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
            _ = &mut ctrl_c => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
            maybe_fix = fixes.recv() => {
                let Some(fix) = maybe_fix else {
                    println!("[{}] Fix stream closed", ts_now());
                    break;
                };
                let outcome = tracker.ingest(fix, now_ms());
                if let Some(closed) = outcome.closed {
                    territories += 1;
                    let summary = TerritorySummary::from(&closed);
                    println!(
                        "[{}] Territory #{} closed: {} points, {:.0} m², gap {:.1} m",
                        ts_now(),
                        territories,
                        summary.point_count,
                        summary.area_m2,
                        closed.closing_gap_m
                    );
                }
            }
            _ = status_tick.tick() => {
                let live = LiveStatus::capture(
                    &session.status(),
                    tracker.stats(now_ms()),
                    telemetry.counters(),
                    started.elapsed().as_secs(),
                );
                if let Err(e) = live.save(&status_path) {
                    log::warn!("[{}] Failed to write live status: {}", ts_now(), e);
                }
            }
        }
    }

    let summary = tracker.stop_run(now_ms())?;
    session.destroy().await;
    let report = telemetry.shutdown().await;

    let final_status = LiveStatus::capture(
        &session.status(),
        summary.stats.clone(),
        telemetry.counters(),
        started.elapsed().as_secs(),
    );
    final_status.save(format!("{}/live_status_final.json", args.output_dir))?;

    let filename = format!("{}/run_summary_{}.json", args.output_dir, ts_now_clean());
    fs::write(&filename, serde_json::to_string_pretty(&summary)?)?;
    println!("[{}] Final save: {} territories to {}", ts_now(), summary.territories.len(), filename);

    let stats = &summary.stats;
    println!("\n=== Final Stats ===");
    println!("Distance: {:.3} km", stats.trajectory.distance_km);
    println!("Duration: {}", stats.trajectory.duration);
    println!("Pace: {} /km", stats.trajectory.pace);
    println!("Calories: {} kcal", stats.trajectory.calories);
    println!("Fixes: {} accepted, {} rejected", stats.accepted, stats.rejected);
    for (reason, count) in &stats.rejected_by_reason {
        println!("  {}: {}", reason, count);
    }
    println!("Territories: {}", summary.territories.len());
    if telemetry.is_enabled() {
        println!(
            "Telemetry: {} delivered, {} dropped on shutdown",
            telemetry.counters().delivered,
            report.dropped
        );
    }

    Ok(())
}

fn build_provider(args: &Args) -> Result<Arc<dyn PositioningProvider>> {
    let provider: Arc<dyn PositioningProvider> = match args.provider {
        Backend::Termux => Arc::new(TermuxProvider::default()),
        Backend::Replay => {
            let path = args
                .replay
                .as_ref()
                .ok_or_else(|| anyhow!("--replay is required with the replay provider"))?;
            let replay = ReplayProvider::from_file(path)?;
            println!("  Replay: {} ({} fixes)", path.display(), replay.fixes().len());
            Arc::new(with_pace(replay, args.pace_ms))
        }
        Backend::Synthetic => {
            let (lat, lng) = parse_center(&args.center)?;
            let replay = ReplayProvider::synthetic_loop((lat, lng), args.radius, 24, now_ms(), 3000);
            Arc::new(with_pace(replay, args.pace_ms))
        }
    };
    Ok(provider)
}

fn parse_center(text: &str) -> Result<(f64, f64)> {
    let (lat, lng) = text
        .split_once(',')
        .ok_or_else(|| anyhow!("--center expects LAT,LNG"))?;
    Ok((lat.trim().parse()?, lng.trim().parse()?))
}

fn with_pace(replay: ReplayProvider, pace_ms: Option<u64>) -> ReplayProvider {
    match pace_ms {
        Some(ms) => replay.with_pace(Duration::from_millis(ms)),
        None => replay,
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
