use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error code recorded in session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PermissionDenied,
    Timeout,
    ProviderUnavailable,
    Unknown,
}

/// Positioning failures. Recorded in session state, never thrown past the session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location request timed out after {0} ms")]
    Timeout(u64),

    #[error("Positioning provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Unknown positioning error: {0}")]
    Unknown(String),
}

impl LocationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LocationError::PermissionDenied => ErrorCode::PermissionDenied,
            LocationError::Timeout(_) => ErrorCode::Timeout,
            LocationError::ProviderUnavailable(_) => ErrorCode::ProviderUnavailable,
            LocationError::Unknown(_) => ErrorCode::Unknown,
        }
    }

    /// Maps a free-form provider message onto the taxonomy.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("denied") || lower.contains("permission") {
            LocationError::PermissionDenied
        } else if lower.contains("timeout") || lower.contains("timed out") {
            LocationError::Timeout(0)
        } else if lower.contains("unavailable") || lower.contains("not available") || lower.contains("disabled") {
            LocationError::ProviderUnavailable(message.to_string())
        } else {
            LocationError::Unknown(message.to_string())
        }
    }
}

/// Telemetry delivery failure. Retried, then dropped; never affects tracking.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("Telemetry delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Why the fix filter turned a fix down. A routine decision, not a failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("[accuracy] accuracy {accuracy:.1}m > {threshold:.0}m threshold")]
    Accuracy { accuracy: f64, threshold: f64 },

    #[error("[jitter] jitter: {distance:.1}m < {radius:.1}m")]
    Jitter { distance: f64, radius: f64 },

    #[error("[distance] distance {distance:.1}m < {min:.1}m min")]
    Distance { distance: f64, min: f64 },

    #[error("[speed] speed {:.1}km/h > {:.1}km/h max", .speed * 3.6, .max * 3.6)]
    Speed { speed: f64, max: f64 },

    #[error(
        "[acceleration] acceleration {acceleration:.1}m/s² > {max:.1}m/s² max (speed jump: {:.1} -> {:.1} km/h)",
        .from_speed * 3.6,
        .to_speed * 3.6
    )]
    Acceleration {
        acceleration: f64,
        max: f64,
        from_speed: f64,
        to_speed: f64,
    },

    #[error("[interval] time diff too short: {elapsed_ms}ms")]
    Interval { elapsed_ms: i64 },
}

impl RejectReason {
    pub fn kind(&self) -> &'static str {
        match self {
            RejectReason::Accuracy { .. } => "accuracy",
            RejectReason::Jitter { .. } => "jitter",
            RejectReason::Distance { .. } => "distance",
            RejectReason::Speed { .. } => "speed",
            RejectReason::Acceleration { .. } => "acceleration",
            RejectReason::Interval { .. } => "interval",
        }
    }
}

/// Crate-level errors for configuration and persistence.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache I/O error: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Location error: {0}")]
    Location(#[from] LocationError),

    #[error("Run already in progress")]
    AlreadyRunning,

    #[error("No run in progress")]
    NotRunning,

    #[error("Invalid run state: {0}")]
    InvalidState(String),
}

pub type TrackerResult<T> = Result<T, TrackerError>;
