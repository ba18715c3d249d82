//! Best-effort shipping of filter decision logs for offline tuning.
//!
//! Rejections and resets are always queued; acceptances are sampled. Reported
//! coordinates are rounded to `fuzz_precision` decimals before they leave the
//! process. Pushing never blocks and never fails. Delivery happens on a spawned
//! task guarded by a single in-flight marker, one record at a time, with
//! exponential backoff between attempts. A batch that still fails after the
//! retries is dropped.

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::config::TelemetryConfig;
use crate::error::TelemetryError;
use crate::filter::FilterLog;

const TAG: &str = "[RunningFilter]";

/// Destination for decision records. Receives one record at a time.
pub trait TelemetrySink: Send + Sync {
    fn deliver(&self, record: FilterLog) -> BoxFuture<'_, Result<(), TelemetryError>>;
}

/// Writes every record through the `log` facade at info level
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn deliver(&self, record: FilterLog) -> BoxFuture<'_, Result<(), TelemetryError>> {
        Box::pin(async move {
            let line = serde_json::to_string(&record)
                .map_err(|e| TelemetryError::DeliveryFailed(e.to_string()))?;
            log::info!(target: "telemetry", "{} {}", TAG, line);
            Ok(())
        })
    }
}

/// Appends records as JSON lines to a file
pub struct JsonlFileSink {
    file: Mutex<File>,
}

impl JsonlFileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonlFileSink {
            file: Mutex::new(file),
        })
    }
}

impl TelemetrySink for JsonlFileSink {
    fn deliver(&self, record: FilterLog) -> BoxFuture<'_, Result<(), TelemetryError>> {
        Box::pin(async move {
            let line = serde_json::to_string(&record)
                .map_err(|e| TelemetryError::DeliveryFailed(e.to_string()))?;
            let mut file = self
                .file
                .lock()
                .map_err(|_| TelemetryError::DeliveryFailed("sink file lock poisoned".into()))?;
            writeln!(file, "{}", line).map_err(|e| TelemetryError::DeliveryFailed(e.to_string()))
        })
    }
}

/// Result of one flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub dropped: usize,
    /// Another flush was already running; nothing was taken from the queue
    pub skipped: bool,
}

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TelemetryCounters {
    pub queued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub overflowed: u64,
}

struct Inner {
    config: TelemetryConfig,
    sink: Arc<dyn TelemetrySink>,
    queue: Mutex<VecDeque<FilterLog>>,
    rng: Mutex<StdRng>,
    flushing: AtomicBool,
    /// Signalled whenever an in-flight flush ends, however it ends
    flush_done: Notify,
    closed: AtomicBool,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    queued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    overflowed: AtomicU64,
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct TelemetryReporter {
    inner: Option<Arc<Inner>>,
}

impl TelemetryReporter {
    pub fn new(config: TelemetryConfig, sink: Arc<dyn TelemetrySink>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        TelemetryReporter {
            inner: Some(Arc::new(Inner {
                config,
                sink,
                queue: Mutex::new(VecDeque::new()),
                rng: Mutex::new(rng),
                flushing: AtomicBool::new(false),
                flush_done: Notify::new(),
                closed: AtomicBool::new(false),
                idle_timer: Mutex::new(None),
                queued: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                overflowed: AtomicU64::new(0),
            })),
        }
    }

    /// A reporter that discards everything
    pub fn disabled() -> Self {
        TelemetryReporter { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner
            .as_ref()
            .map(|i| !i.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Offers one record. Returns true if it was queued.
    ///
    /// Flushes are spawned onto the current tokio runtime; outside a runtime
    /// the record simply waits in the queue for an explicit `flush`.
    pub fn push(&self, record: FilterLog) -> bool {
        let inner = match &self.inner {
            Some(inner) if !inner.closed.load(Ordering::SeqCst) => inner,
            _ => return false,
        };

        let anomaly = record.is_anomaly();
        if !anomaly && !inner.sampled() {
            return false;
        }

        let record = fuzz(record, inner.config.fuzz_precision);
        let len = {
            let mut queue = match inner.queue.lock() {
                Ok(q) => q,
                Err(_) => return false,
            };
            queue.push_back(record);
            if queue.len() > inner.config.queue_capacity {
                queue.pop_front();
                inner.overflowed.fetch_add(1, Ordering::Relaxed);
                log::warn!("{} Remote queue overflow, dropping oldest log", TAG);
            }
            queue.len()
        };
        inner.queued.fetch_add(1, Ordering::Relaxed);

        if anomaly || len >= inner.config.batch_size {
            Inner::spawn_flush(inner);
        } else {
            Inner::schedule_idle_flush(inner);
        }
        true
    }

    /// Delivers everything currently queued.
    pub async fn flush(&self) -> FlushReport {
        match &self.inner {
            Some(inner) => Inner::flush(inner).await,
            None => FlushReport::default(),
        }
    }

    pub fn queued_len(&self) -> usize {
        self.inner
            .as_ref()
            .and_then(|i| i.queue.lock().ok().map(|q| q.len()))
            .unwrap_or(0)
    }

    pub fn counters(&self) -> TelemetryCounters {
        match &self.inner {
            Some(i) => TelemetryCounters {
                queued: i.queued.load(Ordering::Relaxed),
                delivered: i.delivered.load(Ordering::Relaxed),
                dropped: i.dropped.load(Ordering::Relaxed),
                overflowed: i.overflowed.load(Ordering::Relaxed),
            },
            None => TelemetryCounters::default(),
        }
    }

    /// Stops accepting records, cancels the idle timer and makes one final flush.
    pub async fn shutdown(&self) -> FlushReport {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return FlushReport::default(),
        };
        inner.closed.store(true, Ordering::SeqCst);
        inner.cancel_idle_timer();

        // Wait out a flush spawned before shutdown so the final pass sees the whole queue
        loop {
            let done = inner.flush_done.notified();
            if !inner.flushing.load(Ordering::SeqCst) {
                break;
            }
            done.await;
        }
        Inner::flush(inner).await
    }
}

impl Inner {
    fn sampled(&self) -> bool {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen::<f64>() < self.config.sample_rate,
            Err(_) => false,
        }
    }

    fn spawn_flush(this: &Arc<Self>) {
        if let Ok(handle) = Handle::try_current() {
            let inner = Arc::clone(this);
            handle.spawn(async move {
                Inner::flush(&inner).await;
            });
        }
    }

    fn schedule_idle_flush(this: &Arc<Self>) {
        let handle = match Handle::try_current() {
            Ok(h) => h,
            Err(_) => return,
        };
        let mut timer = match this.idle_timer.lock() {
            Ok(t) => t,
            Err(_) => return,
        };
        if timer.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let inner = Arc::clone(this);
        let delay = Duration::from_millis(this.config.idle_flush_ms);
        *timer = Some(handle.spawn(async move {
            sleep(delay).await;
            // Detach before flushing so cancel_idle_timer cannot abort this task mid-delivery
            if let Ok(mut slot) = inner.idle_timer.lock() {
                slot.take();
            }
            Inner::flush(&inner).await;
        }));
    }

    fn cancel_idle_timer(&self) {
        if let Ok(mut timer) = self.idle_timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }

    async fn flush(this: &Arc<Self>) -> FlushReport {
        this.cancel_idle_timer();

        if this.flushing.swap(true, Ordering::SeqCst) {
            return FlushReport {
                skipped: true,
                ..FlushReport::default()
            };
        }
        let in_flight = FlushGuard(this);

        let batch: Vec<FilterLog> = match this.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let report = if batch.is_empty() {
            FlushReport::default()
        } else {
            this.deliver_with_retry(batch).await
        };
        drop(in_flight);

        // Records pushed while this flush was in flight
        let pending = this.queue.lock().map(|q| !q.is_empty()).unwrap_or(false);
        if pending && !this.closed.load(Ordering::SeqCst) {
            Inner::schedule_idle_flush(this);
        }
        report
    }

    /// Retries resume from the record that failed; earlier records are not resent.
    async fn deliver_with_retry(&self, batch: Vec<FilterLog>) -> FlushReport {
        let max_retries = self.config.max_retries;
        let mut next = 0;
        let mut attempt: u32 = 1;

        loop {
            let mut failure = None;
            while next < batch.len() {
                match self.sink.deliver(batch[next].clone()).await {
                    Ok(()) => next += 1,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            let err = match failure {
                None => break,
                Some(e) => e,
            };

            log::error!("{} flush attempt {} failed: {}", TAG, attempt, err);
            if attempt > max_retries {
                let dropped = batch.len() - next;
                log::error!(
                    "{} batch dropped after {} retries ({} records lost)",
                    TAG,
                    max_retries,
                    dropped
                );
                self.delivered.fetch_add(next as u64, Ordering::Relaxed);
                self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
                return FlushReport {
                    delivered: next,
                    dropped,
                    skipped: false,
                };
            }

            let backoff = backoff_ms(self.config.retry_base_ms, attempt);
            log::warn!(
                "{} retrying in {}ms ({}/{})",
                TAG,
                backoff,
                attempt,
                max_retries
            );
            sleep(Duration::from_millis(backoff)).await;
            attempt += 1;
        }

        self.delivered.fetch_add(batch.len() as u64, Ordering::Relaxed);
        FlushReport {
            delivered: batch.len(),
            dropped: 0,
            skipped: false,
        }
    }
}

/// Clears the in-flight marker when a flush ends, including by panic or cancellation.
struct FlushGuard<'a>(&'a Inner);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.flushing.store(false, Ordering::SeqCst);
        self.0.flush_done.notify_waiters();
    }
}

/// `base * 2^(attempt - 1)`, saturating
fn backoff_ms(base: u64, attempt: u32) -> u64 {
    base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
}

fn fuzz(mut record: FilterLog, precision: u32) -> FilterLog {
    let scale = 10f64.powi(precision as i32);
    record.lat = record.lat.map(|v| (v * scale).round() / scale);
    record.lng = record.lng.map(|v| (v * scale).round() / scale);
    record
}
