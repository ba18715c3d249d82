use std::sync::Arc;
use tokio::time::{timeout, Duration};

use territory_tracker_rs::cache::{FileFixCache, FixCache, MemoryFixCache};
use territory_tracker_rs::{
    FixSource, LocationError, PositioningSession, ReplayProvider, RunState, RunTracker, SessionState,
    TelemetryReporter, TrackerConfig, WatchMode, WatchParams,
};

const CENTER: (f64, f64) = (39.9042, 116.4074);

#[tokio::test(start_paused = true)]
async fn synthetic_loop_through_session_closes_territory() {
    let config = TrackerConfig::default();
    let provider = Arc::new(
        ReplayProvider::synthetic_loop(CENTER, 30.0, 24, 0, 3000).with_pace(Duration::from_millis(500)),
    );
    let session = PositioningSession::new(provider.clone(), Arc::new(MemoryFixCache::new()), config.session.clone());
    let mut stream = session.take_fix_stream().unwrap();

    assert_eq!(session.init().await, SessionState::Watching);
    assert!(session.switch_mode(WatchMode::Running, None).await);
    assert_eq!(session.current_mode(), Some(WatchMode::Running));

    let mut tracker = RunTracker::new(&config, TelemetryReporter::disabled());
    tracker.start_run(0).unwrap();

    let mut received = 0;
    let mut closed = Vec::new();
    while let Ok(Some(fix)) = timeout(Duration::from_secs(10), stream.recv()).await {
        received += 1;
        let at = fix.timestamp;
        closed.extend(tracker.ingest(fix, at).closed);
        if received == 10 {
            // Changing cadence mid-run must not disturb the filter
            let before = tracker.filter().state().accepted_count;
            assert!(session.switch_mode(WatchMode::Running, Some(WatchParams::new(2000, 3.0))).await);
            assert_eq!(session.status().watch_params, Some(WatchParams::new(2000, 3.0)));
            assert_eq!(tracker.filter().state().accepted_count, before);
        }
    }

    // Every fix of the loop, the first one as the fast fix
    assert_eq!(received, 25);
    assert_eq!(provider.delivered(), 25);

    let summary = tracker.stop_run(75_000).unwrap();
    assert_eq!(summary.stats.state, RunState::Stopped);
    assert_eq!(summary.stats.rejected, 0);
    assert_eq!(summary.stats.accepted, 25);

    assert_eq!(closed.len(), 1);
    assert_eq!(summary.territories.len(), 1);
    let territory = &summary.territories[0];
    assert_eq!(territory.point_count, 23);
    assert!(territory.area_m2 > 2500.0 && territory.area_m2 < 2900.0, "area {}", territory.area_m2);
    // 2 * pi * 30 m, one lap
    assert!(summary.stats.trajectory.distance_m > 180.0 && summary.stats.trajectory.distance_m < 190.0);

    session.destroy().await;
    assert_eq!(session.state(), SessionState::Destroyed);
    assert!(stream.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn last_known_fix_survives_across_sessions() {
    let dir = std::env::temp_dir().join(format!("territory_cache_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let config = TrackerConfig::default();

    let first = PositioningSession::new(
        Arc::new(ReplayProvider::synthetic_loop(CENTER, 30.0, 12, 0, 3000)),
        Arc::new(FileFixCache::new(&dir)),
        config.session.clone(),
    );
    assert_eq!(first.init().await, SessionState::Watching);
    first.destroy().await;
    let last = first.current_fix().unwrap();

    let cache = FileFixCache::new(&dir);
    let stored = cache.load().unwrap();
    assert_eq!((stored.lat, stored.lng), (last.lat, last.lng));

    // Second launch without a usable provider still knows where it was
    let second = PositioningSession::new(
        Arc::new(ReplayProvider::new(Vec::new()).fail_init(LocationError::PermissionDenied)),
        Arc::new(cache),
        config.session.clone(),
    );
    assert_eq!(second.init().await, SessionState::Error);
    let fix = second.current_fix().unwrap();
    assert_eq!(fix.source, FixSource::Cache);
    assert_eq!((fix.lat, fix.lng), (last.lat, last.lng));

    let _ = std::fs::remove_dir_all(&dir);
}
