//! Positioning backends behind one interface.
//!
//! A provider answers one-shot fix requests and runs watch subscriptions that
//! push [`ProviderEvent`]s into a channel the session drains in order. Two
//! backends ship: [`TermuxProvider`] (device GPS through Termux:API) and
//! [`ReplayProvider`] (recorded or synthetic fixes, the fallback).

pub mod replay;
pub mod termux;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::error::LocationError;
use crate::types::{Fix, WatchParams};

pub use replay::{load_fix_log, ReplayProvider};
pub use termux::TermuxProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// High-accuracy device positioning
    Native,
    /// Lower-fidelity stand-in
    Fallback,
}

/// One-shot fix request profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixRequest {
    pub timeout_ms: u64,
    /// A fix the provider already holds is good enough if it is at most this old
    pub cache_max_age_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderStatus {
    WatchStarted(WatchParams),
    WatchStopped,
    /// The source has nothing more to deliver but the subscription stays open
    Exhausted,
}

/// Everything a watch subscription reports, in delivery order
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Fix(Fix),
    Status(ProviderStatus),
    Error(LocationError),
}

pub trait PositioningProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn name(&self) -> &str;

    /// Availability and permission handshake. Called once before anything else.
    fn init(&self) -> BoxFuture<'_, Result<(), LocationError>>;

    fn current_fix(&self, request: FixRequest) -> BoxFuture<'_, Result<Fix, LocationError>>;

    /// Starts a subscription feeding `events`. Must be called inside a tokio runtime.
    fn watch(
        &self,
        params: WatchParams,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<WatchSubscription, LocationError>;
}

/// Handle to a running watch task
pub struct WatchSubscription {
    params: WatchParams,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WatchSubscription {
    /// Spawns `body` with a stop signal it must honour.
    pub fn spawn<F, Fut>(params: WatchParams, body: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        WatchSubscription {
            params,
            stop_tx: Some(stop_tx),
            task: tokio::spawn(body(stop_rx)),
        }
    }

    pub fn params(&self) -> WatchParams {
        self.params
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signals the task and waits up to `grace` for it to wind down, aborting it
    /// otherwise. Returns false if the task had to be aborted.
    pub async fn stop(mut self, grace: Duration) -> bool {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match timeout(grace, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                log::warn!("Watch task did not stop within {:?}, aborting", grace);
                self.task.abort();
                false
            }
        }
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        if self.stop_tx.is_some() {
            self.task.abort();
        }
    }
}

/// Sends without blocking; a full channel drops the event. Returns false once the receiver is gone.
pub(crate) fn forward(events: &mpsc::Sender<ProviderEvent>, event: ProviderEvent) -> bool {
    match events.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            log::warn!("Provider event channel full, dropping event");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_stops_gracefully() {
        let sub = WatchSubscription::spawn(WatchParams::new(1000, 3.0), |stop| async move {
            let _ = stop.await;
        });
        assert!(sub.is_active());
        assert!(sub.stop(Duration::from_millis(500)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_aborted_when_unresponsive() {
        let sub = WatchSubscription::spawn(WatchParams::new(1000, 3.0), |_stop| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert!(!sub.stop(Duration::from_millis(2000)).await);
    }

    #[tokio::test]
    async fn test_forward_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        assert!(forward(&tx, ProviderEvent::Status(ProviderStatus::WatchStopped)));
        // Full: dropped but still open
        assert!(forward(&tx, ProviderEvent::Status(ProviderStatus::WatchStopped)));
        drop(rx);
        assert!(!forward(&tx, ProviderEvent::Status(ProviderStatus::WatchStopped)));
    }
}
