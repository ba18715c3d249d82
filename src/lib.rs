//! GPS run tracking: positioning session, fix filtering, trajectory
//! accumulation with loop closure, and diagnostics telemetry.

pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod geodesy;
pub mod live_status;
pub mod provider;
pub mod session;
pub mod telemetry;
pub mod tracker;
pub mod trajectory;
pub mod types;
pub mod watchdog;

pub use cache::{FileFixCache, FixCache, MemoryFixCache};
pub use config::TrackerConfig;
pub use error::{ErrorCode, LocationError, RejectReason, TelemetryError, TrackerError, TrackerResult};
pub use filter::{FilterDecision, FilterLog, FilterState, FixFilter};
pub use provider::{PositioningProvider, ProviderEvent, ProviderKind, ReplayProvider, TermuxProvider};
pub use session::{PositioningSession, SessionState, SessionStatus};
pub use telemetry::{TelemetryReporter, TelemetrySink};
pub use tracker::{IngestOutcome, RunState, RunStats, RunSummary, RunTracker};
pub use trajectory::{estimate_calories, format_duration, format_pace, ClosedTerritory, TrajectoryAccumulator};
pub use types::{classify_signal, CachedFix, Fix, FixMode, FixSource, SignalStrength, WatchMode, WatchParams};
