//! Tuning surface for the whole pipeline.
//!
//! Every threshold the filter, accumulator, session and telemetry reporter use
//! lives here so tests and field tuning never touch hardcoded constants.
//! Each section deserializes with defaults, so a JSON config file only needs
//! to name the values it overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{TrackerError, TrackerResult};
use crate::types::{WatchMode, WatchParams};

/// Fix filter gates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Accuracy gate before any fix has been accepted (meters)
    pub cold_accuracy_m: f64,
    /// Accuracy gate once a fix has been accepted (meters)
    pub warm_accuracy_m: f64,
    /// Minimum distance between accepted fixes (meters)
    pub min_distance_m: f64,
    /// Below this distance a fix is treated as stationary jitter (meters)
    pub jitter_radius_m: f64,
    /// Maximum plausible running speed (m/s), about 45 km/h
    pub max_speed_ms: f64,
    /// Maximum plausible change in speed (m/s²)
    pub max_acceleration_ms2: f64,
    /// Speed and acceleration are only computed past this elapsed time (ms)
    pub min_speed_interval_ms: i64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            cold_accuracy_m: 200.0,
            warm_accuracy_m: 100.0,
            min_distance_m: 2.0,
            jitter_radius_m: 1.5,
            max_speed_ms: 12.5,
            max_acceleration_ms2: 8.0,
            min_speed_interval_ms: 500,
        }
    }
}

/// Provider cadence per watch mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub browse: WatchParams,
    pub running: WatchParams,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            browse: WatchParams::new(5000, 10.0),
            running: WatchParams::new(1000, 3.0),
        }
    }
}

impl WatchConfig {
    pub fn params_for(&self, mode: WatchMode) -> WatchParams {
        match mode {
            WatchMode::Browse => self.browse,
            WatchMode::Running => self.running,
        }
    }
}

/// Fast-fix request profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Cold-start fast fix timeout (ms)
    pub fast_fix_timeout_ms: u64,
    /// Cold-start fast fix: oldest provider-cached fix accepted (ms)
    pub fast_fix_cache_max_age_ms: u64,
    /// Resume / watchdog refresh timeout (ms)
    pub refresh_timeout_ms: u64,
    /// Resume / watchdog refresh: oldest provider-cached fix accepted (ms)
    pub refresh_cache_max_age_ms: u64,
    /// Watch mode started at the end of the cold-start sequence
    pub initial_mode: WatchMode,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            fast_fix_timeout_ms: 8000,
            fast_fix_cache_max_age_ms: 5000,
            refresh_timeout_ms: 6000,
            refresh_cache_max_age_ms: 3000,
            initial_mode: WatchMode::Browse,
        }
    }
}

/// Stale-fix watchdog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// No fix for this long while watching counts as stale (ms)
    pub stale_timeout_ms: u64,
    /// How often the watchdog looks (ms)
    pub check_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_timeout_ms: 15_000,
            check_interval_ms: 5_000,
        }
    }
}

/// Session controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub startup: StartupConfig,
    pub watch: WatchConfig,
    pub watchdog: WatchdogConfig,
    /// Capacity of the accepted-fix stream handed to consumers
    pub stream_capacity: usize,
    /// Time allowed for a provider to confirm a watch stop before it is aborted (ms)
    pub stop_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            startup: StartupConfig::default(),
            watch: WatchConfig::default(),
            watchdog: WatchdogConfig::default(),
            stream_capacity: 256,
            stop_timeout_ms: 2000,
        }
    }
}

/// Loop-closure detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosureConfig {
    /// Start and newest point closer than this close the loop (meters)
    pub radius_m: f64,
    /// Closure is only evaluated once the open path is longer than this
    pub min_path_len: usize,
}

impl Default for LoopClosureConfig {
    fn default() -> Self {
        Self {
            radius_m: 20.0,
            min_path_len: 5,
        }
    }
}

/// Derived run statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Flat energy estimate per kilometer (70 kg runner x 1.036 kcal/kg/km)
    pub kcal_per_km: f64,
    /// Below this distance pace reads "00:00" (km)
    pub min_pace_distance_km: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            kcal_per_km: 70.0 * 1.036,
            min_pace_distance_km: 0.01,
        }
    }
}

/// Upper bound on `telemetry.max_retries`
pub const MAX_TELEMETRY_RETRIES: u32 = 10;

/// Telemetry reporter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Fraction of acceptance events queued; rejections are always queued
    pub sample_rate: f64,
    /// Queue length that triggers a flush
    pub batch_size: usize,
    /// Decimal places kept on reported coordinates (3 ≈ 111 m)
    pub fuzz_precision: u32,
    /// Oldest entries are dropped past this length
    pub queue_capacity: usize,
    /// Flush after this long without reaching the batch size (ms)
    pub idle_flush_ms: u64,
    /// First retry delay, doubled each attempt (ms)
    pub retry_base_ms: u64,
    /// At most [`MAX_TELEMETRY_RETRIES`]
    pub max_retries: u32,
    /// Fixed sampling seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sample_rate: 0.01,
            batch_size: 20,
            fuzz_precision: 3,
            queue_capacity: 200,
            idle_flush_ms: 5000,
            retry_base_ms: 1000,
            max_retries: 3,
            seed: None,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub filter: FilterConfig,
    pub session: SessionConfig,
    pub loop_closure: LoopClosureConfig,
    pub stats: StatsConfig,
    pub telemetry: TelemetryConfig,
}

impl TrackerConfig {
    /// Load from a JSON file; missing sections and fields keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> TrackerResult<Self> {
        let data = fs::read(path)?;
        let cfg: TrackerConfig = serde_json::from_slice(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> TrackerResult<()> {
        let f = &self.filter;
        let positive = [
            ("filter.cold_accuracy_m", f.cold_accuracy_m),
            ("filter.warm_accuracy_m", f.warm_accuracy_m),
            ("filter.min_distance_m", f.min_distance_m),
            ("filter.jitter_radius_m", f.jitter_radius_m),
            ("filter.max_speed_ms", f.max_speed_ms),
            ("filter.max_acceleration_ms2", f.max_acceleration_ms2),
            ("loop_closure.radius_m", self.loop_closure.radius_m),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(format!("{} must be positive, got {}", name, value)));
            }
        }

        if f.warm_accuracy_m > f.cold_accuracy_m {
            return Err(invalid(format!(
                "warm accuracy gate {}m looser than cold gate {}m",
                f.warm_accuracy_m, f.cold_accuracy_m
            )));
        }
        if f.jitter_radius_m > f.min_distance_m {
            return Err(invalid(format!(
                "jitter radius {}m exceeds minimum distance {}m",
                f.jitter_radius_m, f.min_distance_m
            )));
        }

        let watch = &self.session.watch;
        if !watch.running.is_tighter_than(&watch.browse) {
            return Err(invalid(format!(
                "running watch {:?} must be strictly tighter than browse {:?}",
                watch.running, watch.browse
            )));
        }

        let t = &self.telemetry;
        if !(0.0..=1.0).contains(&t.sample_rate) {
            return Err(invalid(format!("telemetry.sample_rate {} outside [0, 1]", t.sample_rate)));
        }
        if t.batch_size == 0 || t.queue_capacity == 0 {
            return Err(invalid("telemetry batch_size and queue_capacity must be non-zero".into()));
        }
        if t.max_retries > MAX_TELEMETRY_RETRIES {
            return Err(invalid(format!(
                "telemetry.max_retries {} above {}",
                t.max_retries, MAX_TELEMETRY_RETRIES
            )));
        }
        if self.session.stream_capacity == 0 {
            return Err(invalid("session.stream_capacity must be non-zero".into()));
        }

        Ok(())
    }
}

fn invalid(msg: String) -> TrackerError {
    TrackerError::InvalidConfig(msg)
}
