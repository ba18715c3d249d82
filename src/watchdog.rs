use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Silence detector for the fix stream.
///
/// The session touches it on every delivered fix and after every watch
/// (re)start; a periodic check compares the elapsed time against the threshold.
#[derive(Debug)]
pub struct FixWatchdog {
    last_fix: Mutex<Instant>,
    stale_after: Duration,
    check_every: Duration,
    recoveries: AtomicU32,
}

impl FixWatchdog {
    pub fn new(stale_after_ms: u64, check_every_ms: u64) -> Self {
        FixWatchdog {
            last_fix: Mutex::new(Instant::now()),
            stale_after: Duration::from_millis(stale_after_ms),
            check_every: Duration::from_millis(check_every_ms.max(1)),
            recoveries: AtomicU32::new(0),
        }
    }

    pub fn touch(&self) {
        if let Ok(mut t) = self.last_fix.lock() {
            *t = Instant::now();
        }
    }

    pub fn time_since_last_fix(&self) -> Option<Duration> {
        self.last_fix.lock().ok().map(|t| t.elapsed())
    }

    pub fn is_stale(&self) -> bool {
        self.time_since_last_fix()
            .map(|d| d >= self.stale_after)
            .unwrap_or(false)
    }

    pub fn check_interval(&self) -> Duration {
        self.check_every
    }

    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of stale recoveries run so far
    pub fn recoveries(&self) -> u32 {
        self.recoveries.load(Ordering::Relaxed)
    }
}
