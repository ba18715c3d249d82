//! Run tracking: the single ingestion path from session fixes to trajectory.
//!
//! Every fix goes through the filter; accepted ones feed the accumulator and
//! every decision record is offered to telemetry. Ingestion is synchronous and
//! owned by one task, so the filter and the open path only ever have one writer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::filter::{FilterDecision, FixFilter};
use crate::telemetry::TelemetryReporter;
use crate::trajectory::{ClosedTerritory, TrajectoryAccumulator, TrajectoryStats};
use crate::types::Fix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// What happened to one ingested fix
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    /// `None` when the fix arrived outside a running run and was ignored
    pub decision: Option<FilterDecision>,
    pub closed: Option<ClosedTerritory>,
}

impl IngestOutcome {
    fn ignored() -> Self {
        IngestOutcome {
            decision: None,
            closed: None,
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.decision.is_none()
    }

    pub fn is_accepted(&self) -> bool {
        self.decision.as_ref().map(|d| d.is_accepted()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub state: RunState,
    #[serde(flatten)]
    pub trajectory: TrajectoryStats,
    pub accepted: u64,
    pub rejected: u64,
    pub rejected_by_reason: BTreeMap<String, u64>,
    pub last_reject_reason: Option<String>,
    pub current_speed_kmh: f64,
    pub last_accepted_at_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerritorySummary {
    pub closed_at: i64,
    pub point_count: usize,
    pub area_m2: f64,
    pub perimeter_m: f64,
    /// (lng, lat) ring
    pub ring: Vec<(f64, f64)>,
}

impl From<&ClosedTerritory> for TerritorySummary {
    fn from(t: &ClosedTerritory) -> Self {
        TerritorySummary {
            closed_at: t.closed_at,
            point_count: t.len(),
            area_m2: t.area_m2(),
            perimeter_m: t.perimeter_m(),
            ring: t.points.iter().map(|p| (p.lng, p.lat)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: i64,
    pub ended_at: i64,
    pub stats: RunStats,
    pub territories: Vec<TerritorySummary>,
}

pub struct RunTracker {
    filter: FixFilter,
    trajectory: TrajectoryAccumulator,
    telemetry: TelemetryReporter,
    state: RunState,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    paused_at: Option<i64>,
    paused_ms: i64,
    rejected_by_reason: BTreeMap<String, u64>,
    last_reject_reason: Option<String>,
    current_speed_ms: f64,
    last_accepted_at_ms: Option<i64>,
}

impl RunTracker {
    pub fn new(config: &TrackerConfig, telemetry: TelemetryReporter) -> Self {
        RunTracker {
            filter: FixFilter::new(config.filter.clone()),
            trajectory: TrajectoryAccumulator::new(config.loop_closure.clone(), config.stats.clone()),
            telemetry,
            state: RunState::Idle,
            started_at: None,
            ended_at: None,
            paused_at: None,
            paused_ms: 0,
            rejected_by_reason: BTreeMap::new(),
            last_reject_reason: None,
            current_speed_ms: 0.0,
            last_accepted_at_ms: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn filter(&self) -> &FixFilter {
        &self.filter
    }

    pub fn trajectory(&self) -> &TrajectoryAccumulator {
        &self.trajectory
    }

    /// Idle/Stopped -> Running. Clears the filter, the path and all counters.
    pub fn start_run(&mut self, now_ms: i64) -> TrackerResult<()> {
        match self.state {
            RunState::Running => return Err(TrackerError::AlreadyRunning),
            RunState::Paused => {
                return Err(TrackerError::InvalidState("Run is paused; resume or stop it".to_string()))
            }
            RunState::Idle | RunState::Stopped => {}
        }

        let reset = self.filter.reset();
        self.telemetry.push(reset);
        self.trajectory.reset();
        self.started_at = Some(now_ms);
        self.ended_at = None;
        self.paused_at = None;
        self.paused_ms = 0;
        self.rejected_by_reason.clear();
        self.last_reject_reason = None;
        self.current_speed_ms = 0.0;
        self.last_accepted_at_ms = None;
        self.state = RunState::Running;
        log::info!("Run started");
        Ok(())
    }

    /// Running -> Paused
    pub fn pause(&mut self, now_ms: i64) -> TrackerResult<()> {
        match self.state {
            RunState::Running => {
                self.paused_at = Some(now_ms);
                self.current_speed_ms = 0.0;
                self.state = RunState::Paused;
                log::info!("Run paused");
                Ok(())
            }
            RunState::Paused => Err(TrackerError::InvalidState("Already paused".to_string())),
            RunState::Idle | RunState::Stopped => Err(TrackerError::NotRunning),
        }
    }

    /// Paused -> Running
    pub fn resume(&mut self, now_ms: i64) -> TrackerResult<()> {
        match self.state {
            RunState::Paused => {
                if let Some(at) = self.paused_at.take() {
                    self.paused_ms += (now_ms - at).max(0);
                }
                self.state = RunState::Running;
                log::info!("Run resumed");
                Ok(())
            }
            RunState::Running => Err(TrackerError::InvalidState("Not paused".to_string())),
            RunState::Idle | RunState::Stopped => Err(TrackerError::NotRunning),
        }
    }

    /// Running/Paused -> Stopped
    pub fn stop_run(&mut self, now_ms: i64) -> TrackerResult<RunSummary> {
        match self.state {
            RunState::Running | RunState::Paused => {}
            RunState::Idle | RunState::Stopped => return Err(TrackerError::NotRunning),
        }
        if let Some(at) = self.paused_at.take() {
            self.paused_ms += (now_ms - at).max(0);
        }
        self.ended_at = Some(now_ms);
        self.current_speed_ms = 0.0;
        self.state = RunState::Stopped;

        let summary = RunSummary {
            started_at: self.started_at.unwrap_or(now_ms),
            ended_at: now_ms,
            stats: self.stats(now_ms),
            territories: self.trajectory.closed().iter().map(TerritorySummary::from).collect(),
        };
        log::info!(
            "Run stopped: {:.2} km in {}, {} territories",
            summary.stats.trajectory.distance_km,
            summary.stats.trajectory.duration,
            summary.territories.len()
        );
        Ok(summary)
    }

    /// Feeds one fix through filter, accumulator and telemetry.
    /// Fixes outside a running run are ignored.
    pub fn ingest(&mut self, fix: Fix, now_ms: i64) -> IngestOutcome {
        if self.state != RunState::Running {
            log::debug!("Ignoring fix while {:?}", self.state);
            return IngestOutcome::ignored();
        }

        let decision = self.filter.evaluate(&fix);
        self.telemetry.push(decision.log().clone());

        let closed = match &decision {
            FilterDecision::Accepted { calculated_speed, .. } => {
                self.current_speed_ms = calculated_speed.or(fix.speed).unwrap_or(0.0);
                self.last_accepted_at_ms = Some(now_ms);
                self.trajectory.push(fix)
            }
            FilterDecision::Rejected { reason, .. } => {
                *self.rejected_by_reason.entry(reason.kind().to_string()).or_insert(0) += 1;
                self.last_reject_reason = Some(reason.to_string());
                None
            }
        };

        IngestOutcome {
            decision: Some(decision),
            closed,
        }
    }

    /// Active time excludes paused intervals
    pub fn active_ms(&self, now_ms: i64) -> i64 {
        let start = match self.started_at {
            Some(s) => s,
            None => return 0,
        };
        let end = match (self.state, self.paused_at, self.ended_at) {
            (RunState::Stopped, _, Some(ended)) => ended,
            (_, Some(paused), _) => paused,
            _ => now_ms,
        };
        (end - start - self.paused_ms).max(0)
    }

    pub fn stats(&self, now_ms: i64) -> RunStats {
        let state = self.filter.state();
        RunStats {
            state: self.state,
            trajectory: self.trajectory.stats(self.active_ms(now_ms)),
            accepted: state.accepted_count,
            rejected: state.rejected_count,
            rejected_by_reason: self.rejected_by_reason.clone(),
            last_reject_reason: self.last_reject_reason.clone(),
            current_speed_kmh: self.current_speed_ms * 3.6,
            last_accepted_at_ms: self.last_accepted_at_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::geodesy::offset_m;
    use crate::telemetry::LogSink;
    use std::sync::Arc;

    const LAT: f64 = 39.9042;
    const LNG: f64 = 116.4074;

    fn fix_at(east: f64, north: f64, t_ms: i64) -> Fix {
        let (lat, lng) = offset_m(LAT, LNG, east, north);
        Fix::new(lat, lng, t_ms).with_accuracy(5.0)
    }

    fn tracker() -> RunTracker {
        RunTracker::new(&TrackerConfig::default(), TelemetryReporter::disabled())
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut t = tracker();
        assert!(matches!(t.pause(0), Err(TrackerError::NotRunning)));
        assert!(matches!(t.stop_run(0), Err(TrackerError::NotRunning)));

        t.start_run(0).unwrap();
        assert!(matches!(t.start_run(0), Err(TrackerError::AlreadyRunning)));
        assert!(matches!(t.resume(0), Err(TrackerError::InvalidState(_))));

        t.pause(1000).unwrap();
        assert!(matches!(t.pause(1000), Err(TrackerError::InvalidState(_))));
        assert!(matches!(t.start_run(1000), Err(TrackerError::InvalidState(_))));

        t.resume(2000).unwrap();
        let summary = t.stop_run(3000).unwrap();
        assert_eq!(summary.stats.state, RunState::Stopped);
        assert_eq!(summary.stats.trajectory.active_ms, 2000);

        // A stopped tracker can start a fresh run
        t.start_run(4000).unwrap();
        assert_eq!(t.state(), RunState::Running);
    }

    #[test]
    fn test_fixes_ignored_unless_running() {
        let mut t = tracker();
        assert!(t.ingest(fix_at(0.0, 0.0, 0), 0).is_ignored());

        t.start_run(0).unwrap();
        assert!(t.ingest(fix_at(0.0, 0.0, 0), 0).is_accepted());

        t.pause(1000).unwrap();
        assert!(t.ingest(fix_at(5.0, 0.0, 2000), 2000).is_ignored());
        assert_eq!(t.stats(2000).accepted, 1);
        assert_eq!(t.stats(2000).rejected, 0);
    }

    #[test]
    fn test_active_time_excludes_pause() {
        let mut t = tracker();
        t.start_run(0).unwrap();
        t.pause(60_000).unwrap();
        assert_eq!(t.active_ms(600_000), 60_000);
        t.resume(120_000).unwrap();
        assert_eq!(t.active_ms(180_000), 120_000);
        assert_eq!(t.stats(180_000).trajectory.duration, "00:02:00");
    }

    #[test]
    fn test_reject_breakdown() {
        let mut t = tracker();
        t.start_run(0).unwrap();
        t.ingest(fix_at(0.0, 0.0, 0), 0);
        t.ingest(fix_at(1.0, 0.0, 1000), 1000);
        t.ingest(fix_at(40.0, 0.0, 2000), 2000);
        t.ingest(fix_at(0.5, 0.0, 3000).with_accuracy(150.0), 3000);

        let stats = t.stats(3000);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 3);
        assert_eq!(stats.rejected_by_reason.get("jitter"), Some(&1));
        assert_eq!(stats.rejected_by_reason.get("speed"), Some(&1));
        assert_eq!(stats.rejected_by_reason.get("accuracy"), Some(&1));
        assert!(stats.last_reject_reason.unwrap().contains("accuracy"));
    }

    #[test]
    fn test_loop_run_produces_territory() {
        let mut t = tracker();
        t.start_run(0).unwrap();
        let corners = [
            (0.0, 0.0),
            (5.0, 0.0),
            (10.0, 0.0),
            (15.0, 0.0),
            (15.0, 7.0),
            (15.0, 15.0),
            (13.0, 16.0),
            (0.0, 10.0),
        ];
        let mut closed = Vec::new();
        for (i, (e, n)) in corners.iter().enumerate() {
            let ts = i as i64 * 4000;
            let outcome = t.ingest(fix_at(*e, *n, ts), ts);
            assert!(outcome.is_accepted(), "corner {} rejected", i);
            closed.extend(outcome.closed);
        }
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].len(), 8);

        let summary = t.stop_run(30_000).unwrap();
        assert_eq!(summary.territories.len(), 1);
        assert_eq!(summary.territories[0].point_count, 8);
        assert_eq!(summary.stats.trajectory.open_path_len, 1);
        assert!(summary.stats.current_speed_kmh == 0.0);
    }

    #[test]
    fn test_decisions_reach_telemetry() {
        let cfg = TelemetryConfig {
            sample_rate: 0.0,
            seed: Some(1),
            ..TelemetryConfig::default()
        };
        let telemetry = TelemetryReporter::new(cfg, Arc::new(LogSink));
        let mut t = RunTracker::new(&TrackerConfig::default(), telemetry.clone());

        t.start_run(0).unwrap();
        t.ingest(fix_at(0.0, 0.0, 0), 0);
        t.ingest(fix_at(1.0, 0.0, 1000), 1000);
        // Reset record plus the jitter rejection; the acceptance was sampled out
        assert_eq!(telemetry.queued_len(), 2);
    }
}
