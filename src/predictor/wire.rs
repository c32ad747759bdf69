use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::media::Dimensions;

// Label the predictor emits when it has nothing to say.
pub const NO_PREDICTION: &str = "---";

// Outbound NDJSON messages. Frame payloads are base64 JPEG strings.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Sent once by the channel itself right after the transport opens; it
    // carries the session namespace for this connection attempt.
    SessionInit {
        session_id: String,
        timestamp: i64,
    },
    Frame {
        data: String,
        timestamp: i64,
        dimensions: Dimensions,
    },
    VideoFrame {
        data: String,
        timestamp: i64,
        dimensions: Dimensions,
        current_time: f64,
    },
    VideoMetadata {
        duration: f64,
        dimensions: Dimensions,
        session_type: String,
    },
    RecordingFrame {
        data: String,
        timestamp: i64,
        frame_index: usize,
        total_frames: usize,
        is_complete: bool,
    },
    ClearSentence {
        timestamp: i64,
    },
    ProcessingStopped {
        timestamp: i64,
    },
    VideoEnded {
        timestamp: i64,
    },
}

// Inbound messages. Unknown types and missing optional fields are non-fatal:
// absent fields simply leave the corresponding state untouched.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Analysis { data: AnalysisData },
    PredictionUpdate { data: PredictionData },
    Error { data: ErrorData },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AnalysisData {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub processing_time: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PredictionData {
    #[serde(default)]
    pub prediction: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub all_predictions: Option<IndexMap<String, f64>>,
    #[serde(default)]
    pub has_hand_detection: Option<bool>,
    #[serde(default)]
    pub sequence_ready: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub current_time: Option<f64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub message: Option<String>,
}

// The latest prediction as session state. Replaced wholesale per inbound
// message; never merged field by field.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f64,
    pub all_predictions: Option<IndexMap<String, f64>>,
    pub hand_detected: bool,
    pub sequence_ready: bool,
    pub server_timestamp: Option<i64>,
}

impl Prediction {
    pub fn from_update(data: &PredictionData) -> Option<Self> {
        let label = data.prediction.clone()?;
        Some(Self {
            label,
            confidence: data.confidence.unwrap_or(0.0),
            all_predictions: data.all_predictions.clone(),
            hand_detected: data.has_hand_detection.unwrap_or(false),
            sequence_ready: data.sequence_ready.unwrap_or(false),
            server_timestamp: data.timestamp,
        })
    }

    // Confidence is only meaningful for non-sentinel labels.
    pub fn is_meaningful(&self) -> bool {
        !self.label.is_empty() && self.label != NO_PREDICTION
    }
}
