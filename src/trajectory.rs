//! Open path accumulation and loop-closure detection.
//!
//! The accumulator only ever sees accepted fixes. It keeps the open loop,
//! the cumulative distance across all loops, and every territory closed so far.

use geo::{ChamberlainDuquetteArea, LineString, Polygon};
use serde::{Deserialize, Serialize};

use crate::config::{LoopClosureConfig, StatsConfig};
use crate::geodesy::distance_between;
use crate::types::Fix;

/// Snapshot of the open path at the moment it looped back on its start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTerritory {
    pub points: Vec<Fix>,
    /// Timestamp of the closing fix (epoch ms)
    pub closed_at: i64,
    /// Distance from the first to the closing point (meters)
    pub closing_gap_m: f64,
}

impl ClosedTerritory {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Ring in (lng, lat) order; `geo` closes it if the last point differs from the first.
    pub fn to_polygon(&self) -> Polygon<f64> {
        let ring: Vec<(f64, f64)> = self.points.iter().map(|p| (p.lng, p.lat)).collect();
        Polygon::new(LineString::from(ring), vec![])
    }

    /// Geodesic area enclosed by the loop (square meters)
    pub fn area_m2(&self) -> f64 {
        self.to_polygon().chamberlain_duquette_unsigned_area()
    }

    /// Length of the closed ring including the closing gap (meters)
    pub fn perimeter_m(&self) -> f64 {
        path_length_m(&self.points) + self.closing_gap_m
    }
}

/// Distance, duration and derived figures for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStats {
    pub distance_m: f64,
    pub distance_km: f64,
    pub active_ms: i64,
    /// HH:MM:SS
    pub duration: String,
    /// mm:ss per kilometer
    pub pace: String,
    pub calories: u32,
    pub open_path_len: usize,
    pub territories_closed: usize,
}

pub struct TrajectoryAccumulator {
    loop_closure: LoopClosureConfig,
    stats_config: StatsConfig,
    path: Vec<Fix>,
    distance_m: f64,
    closed: Vec<ClosedTerritory>,
}

impl TrajectoryAccumulator {
    pub fn new(loop_closure: LoopClosureConfig, stats_config: StatsConfig) -> Self {
        TrajectoryAccumulator {
            loop_closure,
            stats_config,
            path: Vec::new(),
            distance_m: 0.0,
            closed: Vec::new(),
        }
    }

    /// Appends an accepted fix. Returns the territory if this fix closed a loop.
    pub fn push(&mut self, fix: Fix) -> Option<ClosedTerritory> {
        if let Some(prev) = self.path.last() {
            self.distance_m += distance_between(prev, &fix);
        }
        self.path.push(fix);

        if self.path.len() <= self.loop_closure.min_path_len {
            return None;
        }

        let newest = self.path[self.path.len() - 1].clone();
        let gap = distance_between(&self.path[0], &newest);
        if gap >= self.loop_closure.radius_m {
            return None;
        }

        // The closing fix seeds the next loop
        let points = std::mem::replace(&mut self.path, vec![newest]);
        let territory = ClosedTerritory {
            closed_at: newest_timestamp(&points),
            closing_gap_m: gap,
            points,
        };
        log::info!(
            "Loop closed: {} points, area {:.0}m², {:.1}m from start",
            territory.len(),
            territory.area_m2(),
            gap
        );
        self.closed.push(territory.clone());
        Some(territory)
    }

    /// The currently open, not yet closed loop
    pub fn path(&self) -> &[Fix] {
        &self.path
    }

    pub fn closed(&self) -> &[ClosedTerritory] {
        &self.closed
    }

    /// Cumulative distance over every accepted fix since the last reset (meters)
    pub fn distance_m(&self) -> f64 {
        self.distance_m
    }

    pub fn reset(&mut self) {
        self.path.clear();
        self.closed.clear();
        self.distance_m = 0.0;
    }

    pub fn stats(&self, active_ms: i64) -> TrajectoryStats {
        let distance_km = self.distance_m / 1000.0;
        TrajectoryStats {
            distance_m: self.distance_m,
            distance_km,
            active_ms,
            duration: format_duration(active_ms),
            pace: format_pace(active_ms, distance_km, &self.stats_config),
            calories: estimate_calories(distance_km, &self.stats_config),
            open_path_len: self.path.len(),
            territories_closed: self.closed.len(),
        }
    }
}

fn newest_timestamp(points: &[Fix]) -> i64 {
    points.last().map(|p| p.timestamp).unwrap_or_default()
}

fn path_length_m(points: &[Fix]) -> f64 {
    points
        .windows(2)
        .map(|w| distance_between(&w[0], &w[1]))
        .sum()
}

/// Pace as "mm:ss" per kilometer.
///
/// Reads "00:00" until the runner has covered `min_pace_distance_km`, and
/// saturates at "59:59" so a near-stationary runner never shows garbage.
pub fn format_pace(active_ms: i64, distance_km: f64, config: &StatsConfig) -> String {
    if distance_km <= config.min_pace_distance_km || active_ms <= 0 {
        return "00:00".to_string();
    }

    // Whole seconds per km, truncated
    let pace_secs = (active_ms as f64 / 1000.0 / distance_km).floor() as u64;
    let (minutes, seconds) = (pace_secs / 60, pace_secs % 60);
    if minutes > 59 {
        return "59:59".to_string();
    }
    format!("{:02}:{:02}", minutes, seconds)
}

/// Duration as "HH:MM:SS"
pub fn format_duration(active_ms: i64) -> String {
    let total = active_ms.max(0) / 1000;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Flat per-kilometer energy estimate (kcal)
pub fn estimate_calories(distance_km: f64, config: &StatsConfig) -> u32 {
    (distance_km.max(0.0) * config.kcal_per_km).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::offset_m;
    use approx::assert_relative_eq;

    const LAT: f64 = 39.9042;
    const LNG: f64 = 116.4074;

    fn fix_at(east: f64, north: f64, t_ms: i64) -> Fix {
        let (lat, lng) = offset_m(LAT, LNG, east, north);
        Fix::new(lat, lng, t_ms).with_accuracy(5.0)
    }

    fn accumulator() -> TrajectoryAccumulator {
        TrajectoryAccumulator::new(LoopClosureConfig::default(), StatsConfig::default())
    }

    #[test]
    fn test_distance_accumulates() {
        let mut acc = accumulator();
        for i in 0..4 {
            assert!(acc.push(fix_at(i as f64 * 10.0, 0.0, i * 3000)).is_none());
        }
        assert_relative_eq!(acc.distance_m(), 30.0, epsilon = 0.05);
        assert_eq!(acc.path().len(), 4);
    }

    #[test]
    fn test_no_closure_at_or_below_min_len() {
        let mut acc = accumulator();
        // Five fixes all on top of the start never close
        for i in 0..5 {
            assert!(acc.push(fix_at(i as f64 * 0.1, 0.0, i * 1000)).is_none());
        }
        assert_eq!(acc.path().len(), 5);
    }

    #[test]
    fn test_six_point_closure() {
        let mut acc = accumulator();
        let fixes = vec![
            fix_at(0.0, 0.0, 0),
            fix_at(25.0, 0.0, 5000),
            fix_at(25.0, 25.0, 10000),
            fix_at(0.0, 25.0, 15000),
            fix_at(-10.0, 20.0, 20000),
            fix_at(5.0, 5.0, 25000),
        ];
        let mut closed = None;
        for fix in fixes.iter().cloned() {
            if let Some(t) = acc.push(fix) {
                closed = Some(t);
            }
        }

        let territory = closed.expect("loop should close on the sixth fix");
        assert_eq!(territory.points, fixes);
        assert_eq!(acc.path(), &fixes[5..]);
        assert_eq!(acc.closed().len(), 1);
        assert_eq!(territory.closed_at, 25000);
    }

    #[test]
    fn test_square_closes_with_eight_points() {
        let mut acc = accumulator();
        let corners = [
            (0.0, 0.0),
            (5.0, 0.0),
            (10.0, 0.0),
            (15.0, 0.0),
            (15.0, 7.0),
            (15.0, 15.0),
            (14.5, 15.0),
            (0.0, 10.0),
        ];
        let mut closures = Vec::new();
        for (i, (e, n)) in corners.iter().enumerate() {
            if let Some(t) = acc.push(fix_at(*e, *n, i as i64 * 4000)) {
                closures.push(t);
            }
        }

        assert_eq!(closures.len(), 1);
        assert_eq!(closures[0].len(), 8);
        assert_eq!(acc.path().len(), 1);
        assert!(closures[0].area_m2() > 100.0);
        assert!(closures[0].perimeter_m() > 50.0);
    }

    #[test]
    fn test_distance_continues_across_loops() {
        let mut acc = accumulator();
        let pts = [(0.0, 0.0), (30.0, 0.0), (30.0, 30.0), (0.0, 30.0), (-10.0, 15.0), (2.0, 2.0)];
        for (i, (e, n)) in pts.iter().enumerate() {
            acc.push(fix_at(*e, *n, i as i64 * 5000));
        }
        let after_loop = acc.distance_m();
        acc.push(fix_at(12.0, 2.0, 40000));
        assert_relative_eq!(acc.distance_m() - after_loop, 10.0, epsilon = 0.05);
        assert_eq!(acc.path().len(), 2);
    }

    #[test]
    fn test_polygon_is_lng_lat_and_closed() {
        let territory = ClosedTerritory {
            points: vec![fix_at(0.0, 0.0, 0), fix_at(10.0, 0.0, 1), fix_at(10.0, 10.0, 2)],
            closed_at: 2,
            closing_gap_m: 14.1,
        };
        let poly = territory.to_polygon();
        let ring = poly.exterior();
        assert!(ring.is_closed());
        assert_relative_eq!(ring.0[0].x, LNG, epsilon = 1e-9);
        assert_relative_eq!(ring.0[0].y, LAT, epsilon = 1e-9);
        assert_relative_eq!(territory.area_m2(), 50.0, max_relative = 0.05);
    }

    #[test]
    fn test_reset() {
        let mut acc = accumulator();
        acc.push(fix_at(0.0, 0.0, 0));
        acc.push(fix_at(10.0, 0.0, 1000));
        acc.reset();
        assert!(acc.path().is_empty());
        assert_eq!(acc.distance_m(), 0.0);
    }

    #[test]
    fn test_format_pace() {
        let cfg = StatsConfig::default();
        assert_eq!(format_pace(60_000, 0.0, &cfg), "00:00");
        assert_eq!(format_pace(60_000, 0.01, &cfg), "00:00");
        // 5 km in 25 minutes
        assert_eq!(format_pace(25 * 60_000, 5.0, &cfg), "05:00");
        // 1 km in 5:30
        assert_eq!(format_pace(330_000, 1.0, &cfg), "05:30");
        // Partial seconds are truncated, never carried into the next minute
        assert_eq!(format_pace(329_600, 1.0, &cfg), "05:29");
        assert_eq!(format_pace(359_999, 1.0, &cfg), "05:59");
        // 0.02 km in 2 hours
        assert_eq!(format_pace(7_200_000, 0.02, &cfg), "59:59");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(61_500), "00:01:01");
        assert_eq!(format_duration(3_723_000), "01:02:03");
    }

    #[test]
    fn test_estimate_calories() {
        let cfg = StatsConfig::default();
        assert_eq!(estimate_calories(0.0, &cfg), 0);
        assert_eq!(estimate_calories(10.0, &cfg), 725);
    }

    #[test]
    fn test_stats_snapshot() {
        let mut acc = accumulator();
        acc.push(fix_at(0.0, 0.0, 0));
        acc.push(fix_at(100.0, 0.0, 30_000));
        let stats = acc.stats(30_000);
        assert_eq!(stats.duration, "00:00:30");
        assert_eq!(stats.pace, "05:00");
        assert_eq!(stats.open_path_len, 2);
        assert_eq!(stats.territories_closed, 0);
    }
}
