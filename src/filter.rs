//! Real-time accept/reject gate for running fixes.
//!
//! Gates run in a fixed order, each cheaper and coarser than the next:
//! accuracy, distance (with a finer jitter band), minimum interval, speed,
//! acceleration. The first ever fix past the accuracy gate is accepted
//! unconditionally since there is nothing to compare it against.
//!
//! State only advances on acceptance; a rejection bumps a counter and nothing
//! else, so one garbage fix can never shift the reference point.

use serde::{Deserialize, Serialize};

use crate::config::FilterConfig;
use crate::error::RejectReason;
use crate::geodesy::distance_between;
use crate::types::Fix;

const TAG: &str = "[RunningFilter]";

/// Per-run filter memory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub has_fresh_fix: bool,
    pub last_accepted: Option<Fix>,
    /// Epoch ms of the last accepted fix
    pub last_accepted_time: i64,
    /// Speed computed between the last two accepted fixes (m/s)
    pub last_speed: f64,
    pub accepted_count: u64,
    pub rejected_count: u64,
}

/// Kind of structured record the filter emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterEvent {
    PointAccepted,
    PointRejected,
    FilterReset,
}

/// One structured decision record, consumed by logging and telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterLog {
    pub event: FilterEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculated_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_from_last: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_count: Option<u64>,
}

impl FilterLog {
    /// Anything other than a plain acceptance is an anomaly and bypasses sampling.
    pub fn is_anomaly(&self) -> bool {
        self.event != FilterEvent::PointAccepted
    }

    fn for_fix(event: FilterEvent, fix: &Fix, reason: String) -> Self {
        FilterLog {
            event,
            lat: Some(fix.lat),
            lng: Some(fix.lng),
            accuracy: fix.accuracy,
            speed: fix.speed,
            calculated_speed: None,
            timestamp: Some(fix.timestamp),
            reason,
            distance_from_last: None,
            accepted_count: None,
            rejected_count: None,
        }
    }
}

/// Outcome of evaluating one fix
#[derive(Debug, Clone, PartialEq)]
pub enum FilterDecision {
    Accepted {
        fix: Fix,
        distance_from_last: Option<f64>,
        calculated_speed: Option<f64>,
        log: FilterLog,
    },
    Rejected {
        fix: Fix,
        reason: RejectReason,
        log: FilterLog,
    },
}

impl FilterDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FilterDecision::Accepted { .. })
    }

    pub fn fix(&self) -> &Fix {
        match self {
            FilterDecision::Accepted { fix, .. } | FilterDecision::Rejected { fix, .. } => fix,
        }
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            FilterDecision::Rejected { reason, .. } => Some(reason),
            FilterDecision::Accepted { .. } => None,
        }
    }

    pub fn log(&self) -> &FilterLog {
        match self {
            FilterDecision::Accepted { log, .. } | FilterDecision::Rejected { log, .. } => log,
        }
    }
}

/// Stateful fix gate; one instance per run
pub struct FixFilter {
    config: FilterConfig,
    state: FilterState,
}

impl FixFilter {
    pub fn new(config: FilterConfig) -> Self {
        FixFilter {
            config,
            state: FilterState::default(),
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Snapshot of the current state
    pub fn state(&self) -> &FilterState {
        &self.state
    }

    /// Accuracy gate currently in force; tightens after the first acceptance and stays tight
    pub fn accuracy_threshold(&self) -> f64 {
        if self.state.has_fresh_fix {
            self.config.warm_accuracy_m
        } else {
            self.config.cold_accuracy_m
        }
    }

    pub fn evaluate(&mut self, fix: &Fix) -> FilterDecision {
        let threshold = self.accuracy_threshold();
        if let Some(accuracy) = fix.accuracy {
            if accuracy > threshold {
                return self.reject(fix, RejectReason::Accuracy { accuracy, threshold });
            }
        }

        let last = match &self.state.last_accepted {
            Some(last) => last.clone(),
            None => return self.accept(fix, None, None),
        };

        let distance = distance_between(&last, fix);
        let elapsed_ms = fix.timestamp - self.state.last_accepted_time;

        if distance < self.config.min_distance_m {
            if distance < self.config.jitter_radius_m {
                return self.reject(
                    fix,
                    RejectReason::Jitter {
                        distance,
                        radius: self.config.jitter_radius_m,
                    },
                );
            }
            return self.reject(
                fix,
                RejectReason::Distance {
                    distance,
                    min: self.config.min_distance_m,
                },
            );
        }

        if elapsed_ms <= self.config.min_speed_interval_ms {
            return self.reject(fix, RejectReason::Interval { elapsed_ms });
        }

        let elapsed_s = elapsed_ms as f64 / 1000.0;
        let speed = distance / elapsed_s;

        if speed > self.config.max_speed_ms {
            return self.reject(
                fix,
                RejectReason::Speed {
                    speed,
                    max: self.config.max_speed_ms,
                },
            );
        }

        if self.state.last_speed > 0.0 {
            let acceleration = (speed - self.state.last_speed).abs() / elapsed_s;
            if acceleration > self.config.max_acceleration_ms2 {
                return self.reject(
                    fix,
                    RejectReason::Acceleration {
                        acceleration,
                        max: self.config.max_acceleration_ms2,
                        from_speed: self.state.last_speed,
                        to_speed: speed,
                    },
                );
            }
        }

        self.accept(fix, Some(distance), Some(speed))
    }

    /// Clears all state; called at run start.
    pub fn reset(&mut self) -> FilterLog {
        self.state = FilterState::default();
        let log = FilterLog {
            event: FilterEvent::FilterReset,
            lat: None,
            lng: None,
            accuracy: None,
            speed: None,
            calculated_speed: None,
            timestamp: None,
            reason: "Running session start".to_string(),
            distance_from_last: None,
            accepted_count: None,
            rejected_count: None,
        };
        emit(&log);
        log
    }

    fn accept(&mut self, fix: &Fix, distance: Option<f64>, speed: Option<f64>) -> FilterDecision {
        self.state.has_fresh_fix = true;
        self.state.last_accepted = Some(fix.clone());
        self.state.last_accepted_time = fix.timestamp;
        if let Some(speed) = speed {
            self.state.last_speed = speed;
        }
        self.state.accepted_count += 1;

        let reason = if self.state.accepted_count == 1 {
            "first_fix"
        } else {
            "passed_all_filters"
        };
        let mut log = FilterLog::for_fix(FilterEvent::PointAccepted, fix, reason.to_string());
        log.calculated_speed = speed;
        log.distance_from_last = distance;
        log.accepted_count = Some(self.state.accepted_count);
        emit(&log);

        FilterDecision::Accepted {
            fix: fix.clone(),
            distance_from_last: distance,
            calculated_speed: speed,
            log,
        }
    }

    fn reject(&mut self, fix: &Fix, reason: RejectReason) -> FilterDecision {
        self.state.rejected_count += 1;

        let mut log = FilterLog::for_fix(FilterEvent::PointRejected, fix, reason.to_string());
        log.rejected_count = Some(self.state.rejected_count);
        emit(&log);

        FilterDecision::Rejected {
            fix: fix.clone(),
            reason,
            log,
        }
    }
}

fn emit(log: &FilterLog) {
    let line = serde_json::to_string(log).unwrap_or_else(|_| log.reason.clone());
    match log.event {
        FilterEvent::PointRejected => log::debug!("{} {}", TAG, line),
        FilterEvent::PointAccepted | FilterEvent::FilterReset => log::info!("{} {}", TAG, line),
    }
}
