use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};

use territory_tracker_rs::config::{LoopClosureConfig, StatsConfig, TelemetryConfig};
use territory_tracker_rs::filter::FilterLog;
use territory_tracker_rs::geodesy::{distance_between, offset_m};
use territory_tracker_rs::{
    Fix, FixFilter, RejectReason, TelemetryError, TelemetryReporter, TelemetrySink, TrackerConfig,
    TrajectoryAccumulator,
};

const LAT: f64 = 39.9042;
const LNG: f64 = 116.4074;

fn fix_at(east: f64, north: f64, t_ms: i64) -> Fix {
    let (lat, lng) = offset_m(LAT, LNG, east, north);
    Fix::new(lat, lng, t_ms).with_accuracy(5.0)
}

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<FilterLog>>,
}

impl TelemetrySink for CollectingSink {
    fn deliver(&self, record: FilterLog) -> BoxFuture<'_, Result<(), TelemetryError>> {
        Box::pin(async move {
            self.records.lock().unwrap().push(record);
            Ok(())
        })
    }
}

#[test]
fn cold_start_accuracy_then_tightened_gate() {
    let mut filter = FixFilter::new(TrackerConfig::default().filter);

    let first = Fix::new(LAT, LNG, 0).with_accuracy(150.0);
    assert!(filter.evaluate(&first).is_accepted());

    let (lat, lng) = offset_m(LAT, LNG, 10.0, 0.0);
    let second = Fix::new(lat, lng, 5000).with_accuracy(150.0);
    let decision = filter.evaluate(&second);
    assert!(matches!(decision.reject_reason(), Some(RejectReason::Accuracy { .. })));
    assert_eq!(filter.accuracy_threshold(), 100.0);
}

#[test]
fn one_meter_move_is_jitter() {
    let mut filter = FixFilter::new(TrackerConfig::default().filter);
    assert!(filter.evaluate(&Fix::new(LAT, LNG, 0).with_accuracy(5.0)).is_accepted());

    let decision = filter.evaluate(&fix_at(0.0, 1.0, 1000));
    assert!(matches!(decision.reject_reason(), Some(RejectReason::Jitter { .. })));
    assert_eq!(filter.state().rejected_count, 1);
}

#[test]
fn square_walk_closes_one_territory() {
    let mut acc = TrajectoryAccumulator::new(LoopClosureConfig::default(), StatsConfig::default());
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
    let fixes: Vec<Fix> = corners
        .iter()
        .enumerate()
        .map(|(i, (e, n))| fix_at(*e, *n, i as i64 * 4000))
        .collect();
    assert!((distance_between(&fixes[7], &fixes[0]) - 10.0).abs() < 0.1);

    let mut closed = Vec::new();
    for fix in fixes {
        closed.extend(acc.push(fix));
    }

    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].len(), 8);
    assert_eq!(acc.path().len(), 1);
    assert_eq!(acc.closed().len(), 1);
    // Shoelace area of the ring is 200 m²
    let area = closed[0].area_m2();
    assert!(area > 180.0 && area < 240.0, "area {}", area);
}

#[tokio::test(start_paused = true)]
async fn acceptances_are_sampled_rejections_always_queued() {
    let sink = Arc::new(CollectingSink::default());
    let config = TelemetryConfig {
        sample_rate: 0.01,
        seed: Some(7),
        ..TelemetryConfig::default()
    };
    let telemetry = TelemetryReporter::new(config, sink.clone());
    let mut filter = FixFilter::new(TrackerConfig::default().filter);

    for i in 0..25 {
        let decision = filter.evaluate(&fix_at(i as f64 * 5.0, 0.0, i * 2000));
        assert!(decision.is_accepted());
        telemetry.push(decision.log().clone());
    }
    let sampled = telemetry.counters().queued;
    assert!(sampled <= 3, "{} acceptances sampled", sampled);

    let rejected = filter.evaluate(&fix_at(120.5, 0.0, 50_000));
    assert!(!rejected.is_accepted());
    assert!(telemetry.push(rejected.log().clone()));
    assert_eq!(telemetry.counters().queued, sampled + 1);

    telemetry.shutdown().await;
    let records = sink.records.lock().unwrap();
    assert_eq!(records.len() as u64, sampled + 1);
    assert!(records.iter().any(|r| r.is_anomaly()));
    // Coordinates leave the process rounded to three decimals
    for lat in records.iter().filter_map(|r| r.lat) {
        assert_eq!((lat * 1000.0).round() / 1000.0, lat);
    }
}
