//! Event types broadcast by `DuckmixEngine`.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `EngineStatusEvent` | `subscribe_status()` |
//! | `DuckingEvent` | `subscribe_ducking()` |
//! | `ActivityEvent` | `subscribe_activity()` |

use serde::{Deserialize, Serialize};

use crate::ducking::DuckReason;

// ---------------------------------------------------------------------------
// Ducking events
// ---------------------------------------------------------------------------

/// Emitted whenever the ducking target volume changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuckingEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub target_volume: f32,
    pub current_volume: f32,
    /// Which source drove the decision.
    pub reason: DuckReason,
    pub remote_level: f32,
    pub mic_level: f32,
}

// ---------------------------------------------------------------------------
// Activity events
// ---------------------------------------------------------------------------

/// Which input an activity sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivitySource {
    Remote,
    Microphone,
}

/// Emitted for each remote or microphone block that reaches the levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub seq: u64,
    pub source: ActivitySource,
    /// Raw block level in [0.0, 1.0].
    pub level: f32,
    /// Smoothed activity after this block.
    pub smoothed: f32,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Created, output format not yet bound.
    Idle,
    /// Output format bound; not playing.
    Configured,
    /// Music loop and ducking tick active.
    Running,
    /// Stopped after running; may be restarted.
    Stopped,
    /// Output could not be opened. The engine stays configured.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ducking_event_serializes_with_camel_case_and_lowercase_reason() {
        let event = DuckingEvent {
            seq: 4,
            target_volume: 0.1,
            current_volume: 0.35,
            reason: DuckReason::Agent,
            remote_level: 0.03,
            mic_level: 0.0,
        };

        let json = serde_json::to_value(&event).expect("serialize ducking event");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["reason"], "agent");
        let target = json["targetVolume"]
            .as_f64()
            .expect("targetVolume should serialize as number");
        assert!((target - 0.1).abs() < 1e-5);
        assert!(json.get("micLevel").is_some());

        let round_trip: DuckingEvent =
            serde_json::from_value(json).expect("deserialize ducking event");
        assert_eq!(round_trip.reason, DuckReason::Agent);
    }

    #[test]
    fn engine_status_event_serializes_with_lowercase_status() {
        let event = EngineStatusEvent {
            status: EngineStatus::Configured,
            detail: None,
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "configured");
        assert!(json["detail"].is_null());

        let round_trip: EngineStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, EngineStatus::Configured);
    }

    #[test]
    fn activity_source_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<ActivitySource>(r#""Remote""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn activity_event_round_trips() {
        let event = ActivityEvent {
            seq: 9,
            source: ActivitySource::Microphone,
            level: 0.2,
            smoothed: 0.06,
        };
        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["source"], "microphone");

        let round_trip: ActivityEvent =
            serde_json::from_value(json).expect("deserialize activity event");
        assert_eq!(round_trip.source, ActivitySource::Microphone);
        assert_eq!(round_trip.seq, 9);
    }
}
