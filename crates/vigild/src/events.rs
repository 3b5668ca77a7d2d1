//! Tagged records published on hub topics.
//!
//! Everything crossing the WebSocket edge is one of these shapes; nothing
//! downstream has to parse free-form maps.

use crate::gate::CheckOutcome;
use crate::store::Student;
use serde::Serialize;

/// Camera worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Offline,
    Connecting,
    Streaming,
    Failed,
}

/// Live worker status, mirrored into the camera topic and the WS hello.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: CameraState,
    pub fps: f32,
    pub frame_count: u64,
}

impl WorkerStatus {
    pub fn offline() -> Self {
        Self {
            state: CameraState::Offline,
            fps: 0.0,
            frame_count: 0,
        }
    }

    /// The `{type:"status"}` message shape.
    pub fn to_event(&self, camera_id: i64) -> serde_json::Value {
        serde_json::json!({
            "type": "status",
            "camera_id": camera_id,
            "state": self.state,
            "connected": self.state == CameraState::Streaming,
            "running": self.state != CameraState::Offline,
            "fps": self.fps,
            "frame_count": self.frame_count,
        })
    }
}

/// Outcome vocabulary used everywhere a recognition is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionStatus {
    Success,
    AlreadyAttended,
    Suppressed,
}

impl From<&CheckOutcome> for RecognitionStatus {
    fn from(outcome: &CheckOutcome) -> Self {
        match outcome {
            CheckOutcome::Created { .. } => RecognitionStatus::Success,
            CheckOutcome::Already { .. } => RecognitionStatus::AlreadyAttended,
            CheckOutcome::Suppressed => RecognitionStatus::Suppressed,
        }
    }
}

/// One recognized person inside a recognition event.
#[derive(Debug, Clone, Serialize)]
pub struct RecognizedPerson {
    pub person: Student,
    pub confidence: f32,
    pub status: RecognitionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in_time: Option<String>,
}

/// The `{type:"recognition"}` message published when at least one match
/// passed the cooldown.
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionEvent {
    pub camera_id: i64,
    pub recognized: Vec<RecognizedPerson>,
    pub timestamp: String,
}

impl RecognitionEvent {
    pub fn to_event(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "recognition",
            "camera_id": self.camera_id,
            "recognized": self.recognized,
            "timestamp": self.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_event_shape() {
        let status = WorkerStatus {
            state: CameraState::Streaming,
            fps: 24.5,
            frame_count: 100,
        };
        let event = status.to_event(3);
        assert_eq!(event["type"], "status");
        assert_eq!(event["connected"], true);
        assert_eq!(event["running"], true);
        assert_eq!(event["state"], "streaming");
    }

    #[test]
    fn test_offline_status_not_running() {
        let event = WorkerStatus::offline().to_event(1);
        assert_eq!(event["connected"], false);
        assert_eq!(event["running"], false);
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(
            RecognitionStatus::from(&CheckOutcome::Suppressed),
            RecognitionStatus::Suppressed
        );
        assert_eq!(
            RecognitionStatus::from(&CheckOutcome::Already {
                check_in_time: chrono::NaiveTime::MIN
            }),
            RecognitionStatus::AlreadyAttended
        );
    }
}
