use serde::{Deserialize, Serialize};

/// Accuracy at or below this radius (meters) counts as a good signal.
pub const SIGNAL_GOOD_MAX_ACCURACY_M: f64 = 50.0;
/// Accuracy at or below this radius (meters) counts as a weak signal.
pub const SIGNAL_WEAK_MAX_ACCURACY_M: f64 = 200.0;

/// Half-width (degrees) of the box around (0, 0) treated as a bogus "Null Island" fix.
const NULL_ISLAND_TOLERANCE_DEG: f64 = 0.001;

/// Where a fix came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixSource {
    /// Last-known position hydrated from durable cache at cold start
    Cache,
    /// High-accuracy native positioning backend
    #[default]
    Native,
    /// Lower-fidelity fallback backend
    Fallback,
}

impl FixSource {
    /// Live sources rank above the cache; a cached fix never replaces a live one.
    pub fn is_live(self) -> bool {
        !matches!(self, FixSource::Cache)
    }
}

/// A single timestamped position sample. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude", alias = "lon")]
    pub lng: f64,
    /// Provider-reported uncertainty radius in meters
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Provider-reported ground speed in m/s
    #[serde(default)]
    pub speed: Option<f64>,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub source: FixSource,
}

impl Fix {
    pub fn new(lat: f64, lng: f64, timestamp: i64) -> Self {
        Self {
            lat,
            lng,
            accuracy: None,
            speed: None,
            timestamp,
            source: FixSource::Native,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_source(mut self, source: FixSource) -> Self {
        self.source = source;
        self
    }

    /// Checks that the coordinates could be a real position.
    ///
    /// Rejects non-finite values, out-of-range latitude/longitude and the
    /// (0, 0) "Null Island" fix some providers emit before they have a lock.
    pub fn plausibility(&self) -> Result<(), &'static str> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err("non-finite coordinate");
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err("latitude out of range");
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err("longitude out of range");
        }
        if self.lat.abs() < NULL_ISLAND_TOLERANCE_DEG && self.lng.abs() < NULL_ISLAND_TOLERANCE_DEG {
            return Err("null island coordinate");
        }
        if let Some(accuracy) = self.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err("invalid accuracy");
            }
        }
        Ok(())
    }

    pub fn is_plausible(&self) -> bool {
        self.plausibility().is_ok()
    }

    pub fn signal_strength(&self) -> SignalStrength {
        classify_signal(self.accuracy)
    }
}

/// Positioning cadence profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Passive map browsing, low power
    Browse,
    /// Active run tracking, high frequency
    Running,
}

impl std::fmt::Display for WatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchMode::Browse => write!(f, "browse"),
            WatchMode::Running => write!(f, "running"),
        }
    }
}

/// One-shot fix profile: `Fast` may answer from a recent provider-held fix,
/// `Precise` always waits for a fresh lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixMode {
    Fast,
    Precise,
}

/// Polling interval and distance filter handed to the provider when a watch starts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WatchParams {
    pub interval_ms: u64,
    pub distance_filter_m: f64,
}

impl WatchParams {
    pub fn new(interval_ms: u64, distance_filter_m: f64) -> Self {
        Self {
            interval_ms,
            distance_filter_m,
        }
    }

    /// True when both the interval and the distance filter are strictly smaller.
    pub fn is_tighter_than(&self, other: &WatchParams) -> bool {
        self.interval_ms < other.interval_ms && self.distance_filter_m < other.distance_filter_m
    }
}

/// Coarse signal classification for user-facing feedback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStrength {
    Good,
    Weak,
    #[default]
    None,
}

/// `accuracy <= 50 -> good`, `<= 200 -> weak`, otherwise `none`.
/// A fix without an accuracy figure is treated as having no usable signal.
pub fn classify_signal(accuracy: Option<f64>) -> SignalStrength {
    match accuracy {
        Some(a) if a <= SIGNAL_GOOD_MAX_ACCURACY_M => SignalStrength::Good,
        Some(a) if a <= SIGNAL_WEAK_MAX_ACCURACY_M => SignalStrength::Weak,
        _ => SignalStrength::None,
    }
}

/// Last known position persisted across restarts for an optimistic cold start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedFix {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: i64,
}

impl CachedFix {
    pub fn into_fix(self) -> Fix {
        Fix::new(self.lat, self.lng, self.timestamp).with_source(FixSource::Cache)
    }
}

impl From<&Fix> for CachedFix {
    fn from(fix: &Fix) -> Self {
        CachedFix {
            lat: fix.lat,
            lng: fix.lng,
            timestamp: fix.timestamp,
        }
    }
}

/// Wall-clock epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_classification() {
        assert_eq!(classify_signal(Some(5.0)), SignalStrength::Good);
        assert_eq!(classify_signal(Some(50.0)), SignalStrength::Good);
        assert_eq!(classify_signal(Some(50.1)), SignalStrength::Weak);
        assert_eq!(classify_signal(Some(200.0)), SignalStrength::Weak);
        assert_eq!(classify_signal(Some(201.0)), SignalStrength::None);
        assert_eq!(classify_signal(None), SignalStrength::None);
    }

    #[test]
    fn test_plausibility() {
        assert!(Fix::new(39.9042, 116.4074, 0).is_plausible());
        assert_eq!(
            Fix::new(0.0, 0.0, 0).plausibility(),
            Err("null island coordinate")
        );
        assert!(!Fix::new(f64::NAN, 116.4, 0).is_plausible());
        assert!(!Fix::new(91.0, 116.4, 0).is_plausible());
        assert!(!Fix::new(39.9, 181.0, 0).is_plausible());
        assert!(!Fix::new(39.9, 116.4, 0).with_accuracy(-1.0).is_plausible());
        // Equator and prime meridian on their own are fine
        assert!(Fix::new(0.0, 10.0, 0).is_plausible());
    }

    #[test]
    fn test_watch_params_tightness() {
        let browse = WatchParams::new(5000, 10.0);
        let running = WatchParams::new(1000, 3.0);
        assert!(running.is_tighter_than(&browse));
        assert!(!browse.is_tighter_than(&running));
        assert!(!WatchParams::new(1000, 10.0).is_tighter_than(&browse));
    }

    #[test]
    fn test_cached_fix_roundtrip_tags_source() {
        let fix = Fix::new(39.9042, 116.4074, 1_700_000_000_000).with_accuracy(8.0);
        let cached = CachedFix::from(&fix);
        let hydrated = cached.into_fix();
        assert_eq!(hydrated.source, FixSource::Cache);
        assert!(!hydrated.source.is_live());
        assert_eq!(hydrated.lat, fix.lat);
        assert_eq!(hydrated.accuracy, None);
    }

    #[test]
    fn test_fix_deserializes_with_defaults() {
        let fix: Fix =
            serde_json::from_str(r#"{"lat": 39.9, "lng": 116.4, "timestamp": 1000}"#).unwrap();
        assert_eq!(fix.accuracy, None);
        assert_eq!(fix.source, FixSource::Native);
    }
}
