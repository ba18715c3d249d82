use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::provider::ProviderKind;
use crate::session::{SessionError, SessionState, SessionStatus};
use crate::telemetry::TelemetryCounters;
use crate::tracker::RunStats;
use crate::types::{now_ms, SignalStrength, WatchMode};

/// Snapshot written to the output directory while a run is live
#[derive(Serialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    // Session
    pub session_state: SessionState,
    pub provider: ProviderKind,
    pub mode: Option<WatchMode>,
    pub signal: SignalStrength,
    pub stale: bool,
    pub last_error: Option<SessionError>,
    pub fixes_delivered: u64,
    pub stale_recoveries: u32,
    // Position
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub accuracy: Option<f64>,
    // Run
    pub run: RunStats,
    pub telemetry: TelemetryCounters,
}

impl LiveStatus {
    pub fn capture(session: &SessionStatus, run: RunStats, telemetry: TelemetryCounters, uptime_seconds: u64) -> Self {
        let fix = session.current_fix.as_ref();
        Self {
            timestamp: current_timestamp(),
            uptime_seconds,
            session_state: session.state,
            provider: session.provider,
            mode: session.mode,
            signal: session.signal,
            stale: session.stale,
            last_error: session.last_error.clone(),
            fixes_delivered: session.fixes_delivered,
            stale_recoveries: session.stale_recoveries,
            lat: fix.map(|f| f.lat),
            lng: fix.map(|f| f.lng),
            accuracy: fix.and_then(|f| f.accuracy),
            run,
            telemetry,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Epoch seconds
pub fn current_timestamp() -> f64 {
    now_ms() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::telemetry::TelemetryReporter;
    use crate::tracker::RunTracker;
    use crate::types::Fix;

    #[test]
    fn test_capture_and_save() {
        let session = SessionStatus {
            state: SessionState::Watching,
            provider: ProviderKind::Fallback,
            mode: Some(WatchMode::Running),
            watch_params: None,
            current_fix: Some(Fix::new(39.9042, 116.4074, 0).with_accuracy(12.0)),
            signal: SignalStrength::Good,
            last_error: None,
            stale: false,
            fixes_delivered: 7,
            stale_recoveries: 0,
        };
        let mut tracker = RunTracker::new(&TrackerConfig::default(), TelemetryReporter::disabled());
        tracker.start_run(0).unwrap();

        let status = LiveStatus::capture(&session, tracker.stats(5000), TelemetryCounters::default(), 5);
        assert_eq!(status.accuracy, Some(12.0));

        let path = std::env::temp_dir().join(format!("live_status_{}.json", std::process::id()));
        status.save(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["session_state"], "watching");
        assert_eq!(value["mode"], "running");
        assert_eq!(value["run"]["duration"], "00:00:05");
        assert_eq!(value["fixes_delivered"], 7);
        let _ = fs::remove_file(&path);
    }
}
