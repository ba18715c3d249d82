//! Positioning session controller.
//!
//! Owns exactly one provider subscription and runs the lifecycle:
//!
//! ```text
//! uninitialized -> initializing -> acquiring_fix -> watching <-> watching (mode switched)
//!        any state -> error (provider failure)      any state -> destroyed (terminal)
//! ```
//!
//! Provider events are drained in arrival order by one dispatcher task per
//! subscription. Plausible live fixes update the current position, the signal
//! classification and the durable cache, then go out on the fix stream.
//! Failures are recorded in [`SessionStatus`] and never returned to callers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

use crate::cache::FixCache;
use crate::config::SessionConfig;
use crate::error::{ErrorCode, LocationError};
use crate::provider::{FixRequest, PositioningProvider, ProviderEvent, ProviderKind, ProviderStatus, WatchSubscription};
use crate::types::{classify_signal, CachedFix, Fix, FixMode, SignalStrength, WatchMode, WatchParams};
use crate::watchdog::FixWatchdog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    AcquiringFix,
    Watching,
    Error,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&LocationError> for SessionError {
    fn from(e: &LocationError) -> Self {
        SessionError {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// Point-in-time view of the session for UI and status files
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub provider: ProviderKind,
    pub mode: Option<WatchMode>,
    pub watch_params: Option<WatchParams>,
    pub current_fix: Option<Fix>,
    pub signal: SignalStrength,
    pub last_error: Option<SessionError>,
    /// No fix within the stale timeout while watching
    pub stale: bool,
    pub fixes_delivered: u64,
    pub stale_recoveries: u32,
}

struct Core {
    state: SessionState,
    mode: Option<WatchMode>,
    watch_params: Option<WatchParams>,
    current_fix: Option<Fix>,
    signal: SignalStrength,
    last_error: Option<SessionError>,
    stale: bool,
    fixes_delivered: u64,
}

struct ActiveWatch {
    mode: WatchMode,
    params: WatchParams,
    subscription: WatchSubscription,
    dispatcher: JoinHandle<()>,
}

struct Shared {
    provider: Arc<dyn PositioningProvider>,
    cache: Arc<dyn FixCache>,
    config: SessionConfig,
    core: Mutex<Core>,
    alive: AtomicBool,
    /// Held for the whole startup sequence; `resume` waits on it
    lifecycle: tokio::sync::Mutex<bool>,
    /// Serialises watch start/stop so only one subscription ever polls the provider
    watch: tokio::sync::Mutex<Option<ActiveWatch>>,
    request_seq: AtomicU64,
    fast_fix_in_flight: AtomicBool,
    fix_tx: Mutex<Option<mpsc::Sender<Fix>>>,
    fix_rx: Mutex<Option<mpsc::Receiver<Fix>>>,
    watchdog: FixWatchdog,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
}

/// Explicitly owned positioning session. Clones share the same session.
#[derive(Clone)]
pub struct PositioningSession {
    shared: Arc<Shared>,
}

impl PositioningSession {
    pub fn new(provider: Arc<dyn PositioningProvider>, cache: Arc<dyn FixCache>, config: SessionConfig) -> Self {
        let (fix_tx, fix_rx) = mpsc::channel(config.stream_capacity.max(1));
        let watchdog = FixWatchdog::new(config.watchdog.stale_timeout_ms, config.watchdog.check_interval_ms);
        PositioningSession {
            shared: Arc::new(Shared {
                provider,
                cache,
                config,
                core: Mutex::new(Core {
                    state: SessionState::Uninitialized,
                    mode: None,
                    watch_params: None,
                    current_fix: None,
                    signal: SignalStrength::None,
                    last_error: None,
                    stale: false,
                    fixes_delivered: 0,
                }),
                alive: AtomicBool::new(true),
                lifecycle: tokio::sync::Mutex::new(false),
                watch: tokio::sync::Mutex::new(None),
                request_seq: AtomicU64::new(0),
                fast_fix_in_flight: AtomicBool::new(false),
                fix_tx: Mutex::new(Some(fix_tx)),
                fix_rx: Mutex::new(Some(fix_rx)),
                watchdog,
                watchdog_task: Mutex::new(None),
            }),
        }
    }

    /// The ordered stream of plausible live fixes. Can be taken once.
    pub fn take_fix_stream(&self) -> Option<mpsc::Receiver<Fix>> {
        self.shared.fix_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.shared.with_core(|c| c.state).unwrap_or(SessionState::Error)
    }

    pub fn current_mode(&self) -> Option<WatchMode> {
        self.shared.with_core(|c| c.mode).flatten()
    }

    pub fn current_fix(&self) -> Option<Fix> {
        self.shared.with_core(|c| c.current_fix.clone()).flatten()
    }

    pub fn status(&self) -> SessionStatus {
        let provider = self.shared.provider.kind();
        let recoveries = self.shared.watchdog.recoveries();
        self.shared
            .with_core(|c| SessionStatus {
                state: c.state,
                provider,
                mode: c.mode,
                watch_params: c.watch_params,
                current_fix: c.current_fix.clone(),
                signal: c.signal,
                last_error: c.last_error.clone(),
                stale: c.stale,
                fixes_delivered: c.fixes_delivered,
                stale_recoveries: recoveries,
            })
            .unwrap_or(SessionStatus {
                state: SessionState::Error,
                provider,
                mode: None,
                watch_params: None,
                current_fix: None,
                signal: SignalStrength::None,
                last_error: None,
                stale: false,
                fixes_delivered: 0,
                stale_recoveries: recoveries,
            })
    }

    /// Runs the startup sequence once: provider handshake, cache hydration,
    /// fast fix, browse watch. Later calls return the current state.
    pub async fn init(&self) -> SessionState {
        let shared = &self.shared;
        let mut done = shared.lifecycle.lock().await;
        if !self.is_alive() {
            return SessionState::Destroyed;
        }
        if *done {
            return self.state();
        }
        *done = true;

        shared.set_state(SessionState::Initializing);
        log::info!("Initializing positioning session ({})", shared.provider.name());

        let handshake = shared.provider.init().await;
        if !self.is_alive() {
            return SessionState::Destroyed;
        }

        if let Some(cached) = shared.cache.load() {
            log::info!("Hydrated cached fix ({:.6}, {:.6}) from {}", cached.lat, cached.lng, cached.timestamp);
            shared.deliver(cached.into_fix());
        }

        if let Err(e) = handshake {
            log::error!("Provider init failed: {}", e);
            shared.record_error(&e);
            shared.set_state(SessionState::Error);
            return self.state();
        }

        shared.set_state(SessionState::AcquiringFix);
        let startup = &shared.config.startup;
        match self
            .request_fix(FixMode::Fast, startup.fast_fix_timeout_ms, startup.fast_fix_cache_max_age_ms)
            .await
        {
            Ok(Some(fix)) => log::info!("Fast fix acquired (accuracy {:?})", fix.accuracy),
            Ok(None) => {}
            Err(e) => {
                if self.current_fix().is_some() {
                    log::warn!("Fast fix failed ({}), keeping cached position", e);
                } else {
                    log::warn!("Fast fix failed ({}), no position yet", e);
                    shared.record_error(&e);
                }
            }
        }
        if !self.is_alive() {
            return SessionState::Destroyed;
        }

        let mode = startup.initial_mode;
        self.start_watch(mode, shared.config.watch.params_for(mode)).await;

        if shared.config.watchdog.enabled {
            self.spawn_watchdog();
        }
        drop(done);
        self.state()
    }

    /// One-shot fix. `Precise` ignores provider-held fixes. Failures are recorded
    /// in the status and read as `None`; so does a result superseded by a newer request.
    pub async fn get_current_fix(&self, mode: FixMode, timeout_ms: u64, cache_max_age_ms: u64) -> Option<Fix> {
        match self.request_fix(mode, timeout_ms, cache_max_age_ms).await {
            Ok(fix) => fix,
            Err(e) => {
                self.shared.record_error(&e);
                None
            }
        }
    }

    /// Fast fix with the refresh profile. A fix obtained while the session is
    /// in `error` also brings the watch back.
    pub async fn force_refresh(&self) -> Option<Fix> {
        let was_error = self.state() == SessionState::Error;
        let startup = &self.shared.config.startup;
        let fix = self
            .get_current_fix(FixMode::Fast, startup.refresh_timeout_ms, startup.refresh_cache_max_age_ms)
            .await;
        if was_error && fix.is_some() && self.is_alive() {
            log::info!("Positioning available again, restoring watch");
            self.ensure_watch().await;
        }
        fix
    }

    /// Starts a watch. A live subscription with the same mode and parameters is
    /// kept; anything else is stopped first.
    pub async fn start_watch(&self, mode: WatchMode, params: WatchParams) -> bool {
        let mut slot = self.shared.watch.lock().await;
        if !self.is_alive() {
            return false;
        }
        if let Some(active) = slot.as_ref() {
            if active.mode == mode && active.params == params && active.subscription.is_active() {
                return true;
            }
        }
        if let Some(old) = slot.take() {
            self.shared.stop_active(old).await;
        }
        self.install_watch(&mut slot, mode, params)
    }

    /// Switches cadence profile; `params` overrides the configured profile for `mode`.
    /// An override that would leave running no tighter than browse is refused.
    pub async fn switch_mode(&self, mode: WatchMode, params: Option<WatchParams>) -> bool {
        let profiles = &self.shared.config.watch;
        let params = match params {
            None => profiles.params_for(mode),
            Some(custom) => {
                let ordered = match mode {
                    WatchMode::Running => custom.is_tighter_than(&profiles.browse),
                    WatchMode::Browse => profiles.running.is_tighter_than(&custom),
                };
                if !ordered {
                    log::warn!(
                        "Refusing {} override every {}ms / {}m: running must stay tighter than browse",
                        mode,
                        custom.interval_ms,
                        custom.distance_filter_m
                    );
                    return false;
                }
                custom
            }
        };
        if self.current_mode() != Some(mode) {
            log::info!("Switching watch mode {:?} -> {}", self.current_mode(), mode);
        }
        self.start_watch(mode, params).await
    }

    pub async fn stop_watch(&self) {
        let mut slot = self.shared.watch.lock().await;
        if let Some(old) = slot.take() {
            self.shared.stop_active(old).await;
        }
        let _ = self.shared.with_core(|c| c.watch_params = None);
    }

    /// Foreground resume: wait out any in-flight init, refresh the fix, and
    /// restart the watch if its subscription died.
    pub async fn resume(&self) -> bool {
        {
            let _init = self.shared.lifecycle.lock().await;
        }
        if !self.is_alive() {
            return false;
        }

        self.force_refresh().await;
        if !self.is_alive() {
            return false;
        }
        self.ensure_watch().await
    }

    /// Restarts the watch unless a live subscription is already running.
    async fn ensure_watch(&self) -> bool {
        let mut slot = self.shared.watch.lock().await;
        if !self.is_alive() {
            return false;
        }
        let (mode, params) = match slot.as_ref() {
            Some(active) if active.subscription.is_active() => return true,
            Some(active) => (active.mode, active.params),
            None => {
                let mode = self.current_mode().unwrap_or(self.shared.config.startup.initial_mode);
                (mode, self.shared.config.watch.params_for(mode))
            }
        };
        log::warn!("No live watch subscription, restarting in {} mode", mode);
        if let Some(old) = slot.take() {
            self.shared.stop_active(old).await;
        }
        let started = self.install_watch(&mut slot, mode, params);
        drop(slot);

        if started && self.shared.config.watchdog.enabled {
            self.spawn_watchdog();
        }
        started
    }

    /// Cancels the watch, the watchdog and any pending refresh. Terminal.
    pub async fn destroy(&self) {
        let shared = &self.shared;
        if !shared.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        // Invalidate in-flight fix requests
        shared.request_seq.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut task) = shared.watchdog_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }

        let mut slot = shared.watch.lock().await;
        if let Some(old) = slot.take() {
            shared.stop_active(old).await;
        }
        drop(slot);

        // Closing the sender ends the consumer's stream
        if let Ok(mut tx) = shared.fix_tx.lock() {
            tx.take();
        }
        let _ = shared.with_core(|c| {
            c.watch_params = None;
            c.state = SessionState::Destroyed;
        });
        log::info!("Positioning session destroyed");
    }

    async fn request_fix(&self, mode: FixMode, timeout_ms: u64, cache_max_age_ms: u64) -> Result<Option<Fix>, LocationError> {
        let shared = &self.shared;
        if !self.is_alive() {
            return Ok(None);
        }

        let request_id = shared.request_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let request = FixRequest {
            timeout_ms,
            cache_max_age_ms: match mode {
                FixMode::Fast => cache_max_age_ms,
                FixMode::Precise => 0,
            },
        };
        log::debug!("Fix request #{} {:?} timeout={}ms cacheMaxAge={}ms", request_id, mode, timeout_ms, request.cache_max_age_ms);

        shared.fast_fix_in_flight.store(true, Ordering::SeqCst);
        let result = timeout(Duration::from_millis(timeout_ms), shared.provider.current_fix(request)).await;
        if shared.request_seq.load(Ordering::SeqCst) == request_id {
            shared.fast_fix_in_flight.store(false, Ordering::SeqCst);
        }

        if !self.is_alive() {
            return Ok(None);
        }
        if shared.request_seq.load(Ordering::SeqCst) != request_id {
            log::warn!("Fix request #{} superseded by a newer request, discarding", request_id);
            return Ok(None);
        }

        let fix = match result {
            Err(_) => return Err(LocationError::Timeout(timeout_ms)),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(fix)) => fix,
        };
        if shared.deliver(fix.clone()) {
            Ok(Some(fix))
        } else {
            Err(LocationError::Unknown("provider returned an implausible fix".into()))
        }
    }

    fn install_watch(&self, slot: &mut Option<ActiveWatch>, mode: WatchMode, params: WatchParams) -> bool {
        let shared = &self.shared;
        let (tx, rx) = mpsc::channel(shared.config.stream_capacity.max(1));
        match shared.provider.watch(params, tx) {
            Ok(subscription) => {
                let dispatcher = tokio::spawn(dispatch(Arc::downgrade(shared), rx));
                *slot = Some(ActiveWatch {
                    mode,
                    params,
                    subscription,
                    dispatcher,
                });
                shared.watchdog.touch();
                let _ = shared.with_core(|c| {
                    c.mode = Some(mode);
                    c.watch_params = Some(params);
                });
                shared.set_state(SessionState::Watching);
                log::info!(
                    "Watch started: {} mode, every {}ms, distance filter {}m",
                    mode,
                    params.interval_ms,
                    params.distance_filter_m
                );
                true
            }
            Err(e) => {
                log::error!("Failed to start {} watch: {}", mode, e);
                shared.record_error(&e);
                shared.set_state(SessionState::Error);
                false
            }
        }
    }

    /// Starts the watchdog loop unless one is already running.
    fn spawn_watchdog(&self) {
        let mut task = match self.shared.watchdog_task.lock() {
            Ok(task) => task,
            Err(_) => return,
        };
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let every = self.shared.watchdog.check_interval();
        *task = Some(tokio::spawn(async move {
            loop {
                sleep(every).await;
                let shared = match weak.upgrade() {
                    Some(s) => s,
                    None => break,
                };
                if !shared.alive.load(Ordering::SeqCst) {
                    break;
                }
                let watching = shared.with_core(|c| c.state == SessionState::Watching).unwrap_or(false);
                if !watching || !shared.watchdog.is_stale() {
                    continue;
                }
                PositioningSession { shared }.recover_stale().await;
            }
        }));
    }

    /// Fresh fast fix, then restart the current watch.
    async fn recover_stale(&self) {
        let shared = &self.shared;
        let silent = shared.watchdog.time_since_last_fix().unwrap_or_default();
        log::warn!("No fix for {:.1}s while watching, recovering", silent.as_secs_f64());
        let _ = shared.with_core(|c| {
            c.stale = true;
            c.signal = SignalStrength::Weak;
        });

        if shared.fast_fix_in_flight.load(Ordering::SeqCst) {
            log::info!("Stale recovery skipped: fix request already in flight");
            return;
        }
        shared.watchdog.record_recovery();

        if self.force_refresh().await.is_none() {
            log::warn!("Stale recovery fast fix failed");
        }
        if !self.is_alive() {
            return;
        }

        let mut slot = shared.watch.lock().await;
        if !self.is_alive() {
            return;
        }
        if let Some(old) = slot.take() {
            let (mode, params) = (old.mode, old.params);
            shared.stop_active(old).await;
            self.install_watch(&mut slot, mode, params);
        }
        // A fix delivered during recovery already cleared the stale flag
        let _ = shared.with_core(|c| {
            if c.stale {
                c.signal = SignalStrength::Weak;
            }
        });
    }
}

impl Shared {
    fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> Option<R> {
        self.core.lock().ok().map(|mut c| f(&mut c))
    }

    fn set_state(&self, next: SessionState) {
        let _ = self.with_core(|c| {
            if c.state == SessionState::Destroyed || c.state == next {
                return;
            }
            log::info!("Session state: {:?} -> {:?}", c.state, next);
            c.state = next;
        });
    }

    fn record_error(&self, e: &LocationError) {
        log::warn!("Positioning error [{:?}]: {}", e.code(), e);
        let _ = self.with_core(|c| c.last_error = Some(SessionError::from(e)));
    }

    /// Applies one fix. Returns false if it was dropped as implausible.
    fn deliver(&self, fix: Fix) -> bool {
        if let Err(why) = fix.plausibility() {
            log::warn!("Dropping implausible fix ({}, {}): {}", fix.lat, fix.lng, why);
            return false;
        }

        let live = fix.source.is_live();
        let applied = self
            .with_core(|c| {
                if !live {
                    // A cached position never replaces a live one
                    if c.current_fix.as_ref().map(|f| f.source.is_live()).unwrap_or(false) {
                        return false;
                    }
                    c.current_fix = Some(fix.clone());
                    return true;
                }
                if c.state == SessionState::Error {
                    let next = if c.watch_params.is_some() {
                        SessionState::Watching
                    } else {
                        SessionState::AcquiringFix
                    };
                    log::info!("Session state: {:?} -> {:?} (live fix)", c.state, next);
                    c.state = next;
                }
                c.current_fix = Some(fix.clone());
                c.signal = classify_signal(fix.accuracy);
                c.stale = false;
                c.last_error = None;
                c.fixes_delivered += 1;
                true
            })
            .unwrap_or(false);

        if !applied || !live {
            return applied;
        }

        self.watchdog.touch();
        if let Err(e) = self.cache.store(&CachedFix::from(&fix)) {
            log::warn!("Failed to persist last known fix: {}", e);
        }

        let tx = self.fix_tx.lock().ok().and_then(|tx| tx.clone());
        if let Some(tx) = tx {
            match tx.try_send(fix) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Fix stream full, dropping fix");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Fix stream consumer gone");
                }
            }
        }
        true
    }

    fn handle_event(&self, event: ProviderEvent) {
        match event {
            ProviderEvent::Fix(fix) => {
                self.deliver(fix);
            }
            ProviderEvent::Status(ProviderStatus::WatchStarted(params)) => {
                log::debug!("Provider watch running: {:?}", params);
            }
            ProviderEvent::Status(ProviderStatus::WatchStopped) => {
                log::debug!("Provider watch stopped");
            }
            ProviderEvent::Status(ProviderStatus::Exhausted) => {
                log::info!("Provider has no further fixes");
            }
            ProviderEvent::Error(e) => {
                self.record_error(&e);
                if matches!(e, LocationError::PermissionDenied | LocationError::ProviderUnavailable(_)) {
                    self.set_state(SessionState::Error);
                }
            }
        }
    }

    /// Stops a subscription and drains whatever it already queued.
    async fn stop_active(&self, old: ActiveWatch) {
        let grace = Duration::from_millis(self.config.stop_timeout_ms);
        let ActiveWatch {
            mode,
            subscription,
            mut dispatcher,
            ..
        } = old;

        subscription.stop(grace).await;
        if timeout(grace, &mut dispatcher).await.is_err() {
            dispatcher.abort();
        }
        log::info!("Watch stopped ({} mode)", mode);
    }
}

async fn dispatch(shared: Weak<Shared>, mut events: mpsc::Receiver<ProviderEvent>) {
    while let Some(event) = events.recv().await {
        let shared = match shared.upgrade() {
            Some(s) => s,
            None => break,
        };
        if !shared.alive.load(Ordering::SeqCst) {
            break;
        }
        shared.handle_event(event);
    }
}
