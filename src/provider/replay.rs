//! Fallback provider replaying a fixed sequence of fixes.
//!
//! Feeds recorded logs (JSON or gzipped JSON) or a synthetic loop through the
//! same interface as the device backend. Fixes are re-tagged as
//! [`FixSource::Fallback`]. Init, one-shot and watch failures can be scripted,
//! so the session can be driven through its error paths without hardware.
//!
//! One-shot answers and watch deliveries share a single cursor: every fix in
//! the log is handed out once, whichever path asks for it.

use flate2::read::GzDecoder;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use super::{forward, FixRequest, PositioningProvider, ProviderEvent, ProviderKind, ProviderStatus, WatchSubscription};
use crate::error::{LocationError, TrackerResult};
use crate::geodesy::{distance_between, offset_m};
use crate::types::{Fix, FixSource, WatchParams};

#[derive(Deserialize)]
#[serde(untagged)]
enum FixLogFile {
    Wrapped { fixes: Vec<Fix> },
    Bare(Vec<Fix>),
}

/// Loads a fix log: a JSON array, `{"fixes": [...]}`, or one fix per line.
/// Files ending in `.gz` are decompressed first.
pub fn load_fix_log(path: &Path) -> TrackerResult<Vec<Fix>> {
    let file = File::open(path)?;
    let mut reader: Box<dyn BufRead> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut text = String::new();
    reader.read_to_string(&mut text)?;

    match serde_json::from_str::<FixLogFile>(&text) {
        Ok(FixLogFile::Wrapped { fixes }) | Ok(FixLogFile::Bare(fixes)) => Ok(fixes),
        Err(whole_err) => {
            let mut fixes = Vec::new();
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<Fix>(line) {
                    Ok(fix) => fixes.push(fix),
                    Err(_) => return Err(whole_err.into()),
                }
            }
            Ok(fixes)
        }
    }
}

struct Script {
    init_error: Option<LocationError>,
    current_fix_failures: usize,
    current_fix_delay: Option<Duration>,
    /// Reported by the next watch after it has delivered this many fixes
    watch_error: Option<(usize, LocationError)>,
}

pub struct ReplayProvider {
    fixes: Arc<Vec<Fix>>,
    cursor: Arc<AtomicUsize>,
    /// Fixed spacing between watch deliveries; defaults to the watch interval
    pace: Option<Duration>,
    script: Arc<Mutex<Script>>,
}

impl ReplayProvider {
    pub fn new(fixes: Vec<Fix>) -> Self {
        let fixes = fixes
            .into_iter()
            .map(|f| f.with_source(FixSource::Fallback))
            .collect();
        ReplayProvider {
            fixes: Arc::new(fixes),
            cursor: Arc::new(AtomicUsize::new(0)),
            pace: None,
            script: Arc::new(Mutex::new(Script {
                init_error: None,
                current_fix_failures: 0,
                current_fix_delay: None,
                watch_error: None,
            })),
        }
    }

    pub fn from_file(path: &Path) -> TrackerResult<Self> {
        Ok(Self::new(load_fix_log(path)?))
    }

    /// A closed circular track: `points` fixes on a circle of `radius_m`, starting
    /// due south of the center, one every `step_ms`, then back to the start.
    pub fn synthetic_loop(center: (f64, f64), radius_m: f64, points: usize, start_ms: i64, step_ms: i64) -> Self {
        let n = points.max(3);
        let fixes = (0..=n)
            .map(|i| {
                let theta = 2.0 * PI * (i % n) as f64 / n as f64;
                let (lat, lng) = offset_m(center.0, center.1, radius_m * theta.sin(), -radius_m * theta.cos());
                Fix::new(lat, lng, start_ms + i as i64 * step_ms).with_accuracy(6.0)
            })
            .collect();
        Self::new(fixes)
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Makes `init` fail with `error`.
    pub fn fail_init(self, error: LocationError) -> Self {
        if let Ok(mut s) = self.script.lock() {
            s.init_error = Some(error);
        }
        self
    }

    /// Makes the next `count` one-shot requests time out.
    pub fn fail_current_fix(&self, count: usize) {
        if let Ok(mut s) = self.script.lock() {
            s.current_fix_failures = count;
        }
    }

    /// Delays every one-shot answer by `delay`.
    pub fn delay_current_fix(&self, delay: Duration) {
        if let Ok(mut s) = self.script.lock() {
            s.current_fix_delay = Some(delay);
        }
    }

    /// Makes the next watch report `error` once after delivering `after` fixes.
    /// `PermissionDenied` ends that watch; anything else is transient.
    pub fn fail_watch_after(&self, after: usize, error: LocationError) {
        if let Ok(mut s) = self.script.lock() {
            s.watch_error = Some((after, error));
        }
    }

    pub fn fixes(&self) -> &[Fix] {
        &self.fixes
    }

    /// Number of fixes already handed out, by one-shot requests or watches
    pub fn delivered(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

impl PositioningProvider for ReplayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Fallback
    }

    fn name(&self) -> &str {
        "replay"
    }

    fn init(&self) -> BoxFuture<'_, Result<(), LocationError>> {
        let result = match self.script.lock() {
            Ok(s) => s.init_error.clone().map_or(Ok(()), Err),
            Err(_) => Err(LocationError::Unknown("replay script poisoned".into())),
        };
        Box::pin(async move { result })
    }

    /// Hands out the next undelivered fix; an exhausted log times out.
    fn current_fix(&self, request: FixRequest) -> BoxFuture<'_, Result<Fix, LocationError>> {
        Box::pin(async move {
            let (fail, delay) = match self.script.lock() {
                Ok(mut s) => {
                    let fail = s.current_fix_failures > 0;
                    if fail {
                        s.current_fix_failures -= 1;
                    }
                    (fail, s.current_fix_delay)
                }
                Err(_) => (false, None),
            };
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            if fail {
                return Err(LocationError::Timeout(request.timeout_ms));
            }

            let len = self.fixes.len();
            match self
                .cursor
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| (i < len).then_some(i + 1))
            {
                Ok(idx) => Ok(self.fixes[idx].clone()),
                Err(_) => Err(LocationError::Timeout(request.timeout_ms)),
            }
        })
    }

    fn watch(
        &self,
        params: WatchParams,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<WatchSubscription, LocationError> {
        let fixes = Arc::clone(&self.fixes);
        let cursor = Arc::clone(&self.cursor);
        let pace = self.pace.unwrap_or(Duration::from_millis(params.interval_ms));
        let mut scripted_error = self.script.lock().ok().and_then(|mut s| s.watch_error.take());

        Ok(WatchSubscription::spawn(params, move |mut stop| async move {
            forward(&events, ProviderEvent::Status(ProviderStatus::WatchStarted(params)));
            let mut last_sent: Option<Fix> = None;
            let mut sent = 0usize;

            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = sleep(pace) => {}
                }

                let idx = cursor.load(Ordering::SeqCst);
                let fix = match fixes.get(idx) {
                    Some(fix) => fix.clone(),
                    None => {
                        forward(&events, ProviderEvent::Status(ProviderStatus::Exhausted));
                        let _ = (&mut stop).await;
                        break;
                    }
                };
                cursor.store(idx + 1, Ordering::SeqCst);

                let moved = last_sent
                    .as_ref()
                    .map(|prev| distance_between(prev, &fix) >= params.distance_filter_m)
                    .unwrap_or(true);
                if !moved {
                    continue;
                }
                last_sent = Some(fix.clone());
                if !forward(&events, ProviderEvent::Fix(fix)) {
                    break;
                }
                sent += 1;

                if scripted_error.as_ref().map(|(after, _)| *after == sent).unwrap_or(false) {
                    if let Some((_, error)) = scripted_error.take() {
                        let fatal = error == LocationError::PermissionDenied;
                        forward(&events, ProviderEvent::Error(error));
                        if fatal {
                            break;
                        }
                    }
                }
            }

            forward(&events, ProviderEvent::Status(ProviderStatus::WatchStopped));
        }))
    }
}
