//! Device GPS through the Termux:API `termux-location` command.
//!
//! `-r last` answers instantly from the platform cache, `-r once` waits for a
//! fresh lock. Watches poll `-r once` at the requested interval and drop fixes
//! inside the distance filter before they reach the channel.

use futures::future::BoxFuture;
use serde::Deserialize;
use std::io::ErrorKind;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};

use super::{forward, FixRequest, PositioningProvider, ProviderEvent, ProviderKind, ProviderStatus, WatchSubscription};
use crate::error::LocationError;
use crate::geodesy::distance_between;
use crate::types::{now_ms, Fix, FixSource, WatchParams};

const BINARY: &str = "termux-location";
const HANDSHAKE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Deserialize)]
struct TermuxLocation {
    latitude: f64,
    longitude: f64,
    accuracy: Option<f64>,
    speed: Option<f64>,
    /// Age of the fix when it was printed
    #[serde(rename = "elapsedMs")]
    elapsed_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct TermuxProvider {
    /// Android location provider: gps, network or passive
    location_provider: String,
}

impl Default for TermuxProvider {
    fn default() -> Self {
        Self::new("gps")
    }
}

impl TermuxProvider {
    pub fn new(location_provider: &str) -> Self {
        TermuxProvider {
            location_provider: location_provider.to_string(),
        }
    }

    async fn request(&self, mode: &str, timeout_ms: u64) -> Result<(Fix, i64), LocationError> {
        let run = Command::new(BINARY)
            .args(["-p", self.location_provider.as_str(), "-r", mode])
            .kill_on_drop(true)
            .output();

        let output = match timeout(Duration::from_millis(timeout_ms), run).await {
            Err(_) => return Err(LocationError::Timeout(timeout_ms)),
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(LocationError::ProviderUnavailable(format!("{} not installed", BINARY)))
            }
            Ok(Err(e)) => return Err(LocationError::Unknown(e.to_string())),
            Ok(Ok(output)) => output,
        };

        let text = String::from_utf8_lossy(&output.stdout);
        if text.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.trim().is_empty() {
                return Err(LocationError::Timeout(timeout_ms));
            }
            return Err(LocationError::from_message(stderr.trim()));
        }
        parse_location(&text, now_ms())
    }
}

/// Parses one `termux-location` JSON object. Returns the fix and its reported age in ms.
fn parse_location(text: &str, now: i64) -> Result<(Fix, i64), LocationError> {
    match serde_json::from_str::<TermuxLocation>(text.trim()) {
        Ok(loc) => {
            let age = loc.elapsed_ms.unwrap_or(0).max(0);
            let mut fix = Fix::new(loc.latitude, loc.longitude, now - age).with_source(FixSource::Native);
            fix.accuracy = loc.accuracy;
            fix.speed = loc.speed;
            Ok((fix, age))
        }
        Err(_) => Err(LocationError::from_message(text.trim())),
    }
}

impl PositioningProvider for TermuxProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Native
    }

    fn name(&self) -> &str {
        "termux"
    }

    fn init(&self) -> BoxFuture<'_, Result<(), LocationError>> {
        Box::pin(async move {
            match self.request("last", HANDSHAKE_TIMEOUT_MS).await {
                Ok(_) => Ok(()),
                // No cached position yet is fine; the binary answered
                Err(LocationError::Timeout(_)) => Ok(()),
                Err(e @ LocationError::PermissionDenied) | Err(e @ LocationError::ProviderUnavailable(_)) => Err(e),
                Err(e) => {
                    log::warn!("termux-location handshake returned {}, continuing", e);
                    Ok(())
                }
            }
        })
    }

    fn current_fix(&self, request: FixRequest) -> BoxFuture<'_, Result<Fix, LocationError>> {
        Box::pin(async move {
            if let Ok((fix, age)) = self.request("last", request.timeout_ms).await {
                if age as u64 <= request.cache_max_age_ms {
                    return Ok(fix);
                }
            }
            self.request("once", request.timeout_ms)
                .await
                .map(|(fix, _)| fix)
        })
    }

    fn watch(
        &self,
        params: WatchParams,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<WatchSubscription, LocationError> {
        let provider = self.clone();
        Ok(WatchSubscription::spawn(params, move |mut stop| async move {
            forward(&events, ProviderEvent::Status(ProviderStatus::WatchStarted(params)));

            let mut ticker = interval(Duration::from_millis(params.interval_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // A single read may take longer than the poll interval while the GPS warms up
            let read_timeout = params.interval_ms.max(10_000);
            let mut last_sent: Option<Fix> = None;

            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {}
                }

                let result = tokio::select! {
                    _ = &mut stop => break,
                    r = provider.request("once", read_timeout) => r,
                };

                let open = match result {
                    Ok((fix, _)) => {
                        let moved = last_sent
                            .as_ref()
                            .map(|prev| distance_between(prev, &fix) >= params.distance_filter_m)
                            .unwrap_or(true);
                        if !moved {
                            continue;
                        }
                        last_sent = Some(fix.clone());
                        forward(&events, ProviderEvent::Fix(fix))
                    }
                    Err(LocationError::PermissionDenied) => {
                        forward(&events, ProviderEvent::Error(LocationError::PermissionDenied));
                        break;
                    }
                    Err(e) => forward(&events, ProviderEvent::Error(e)),
                };
                if !open {
                    break;
                }
            }

            forward(&events, ProviderEvent::Status(ProviderStatus::WatchStopped));
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        let json = r#"{
            "latitude": 39.9042,
            "longitude": 116.4074,
            "altitude": 50.0,
            "accuracy": 8.5,
            "vertical_accuracy": 3.0,
            "bearing": 0.0,
            "speed": 2.5,
            "elapsedMs": 120,
            "provider": "gps"
        }"#;
        let (fix, age) = parse_location(json, 1_000_000).unwrap();
        assert_eq!(age, 120);
        assert_eq!(fix.timestamp, 999_880);
        assert_eq!(fix.accuracy, Some(8.5));
        assert_eq!(fix.speed, Some(2.5));
        assert_eq!(fix.source, FixSource::Native);
    }

    #[test]
    fn test_parse_permission_error() {
        let err = parse_location("Error: Location permission denied", 0).unwrap_err();
        assert_eq!(err, LocationError::PermissionDenied);
    }

    #[test]
    fn test_parse_garbage_is_unknown() {
        let err = parse_location("{\"foo\": 1}", 0).unwrap_err();
        assert!(matches!(err, LocationError::Unknown(_)));
    }

    #[test]
    fn test_kind_is_native() {
        let provider = TermuxProvider::default();
        assert_eq!(provider.kind(), ProviderKind::Native);
        assert_eq!(provider.name(), "termux");
    }
}
