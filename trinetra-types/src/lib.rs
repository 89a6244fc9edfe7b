//! Data model shared by the trinetra pipeline services.
//!
//! Everything that crosses a process boundary — frame-bus entries, event-bus
//! payloads — is defined here, so that the ingestor, inference worker and
//! identity resolver agree on one wire format.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod envelope;

pub use envelope::{EnvelopeError, FrameEnvelope};

/// Kafka topic carrying [`InferenceEvent`]s, keyed by camera id.
pub const DETECTIONS_TOPIC: &str = "trinetra.detections";
/// Kafka topic carrying [`ResolvedIdentity`] events, keyed by camera id.
pub const IDENTITIES_TOPIC: &str = "trinetra.identities";
/// Kafka topic carrying [`AlertEvent`]s. No key.
pub const ALERTS_TOPIC: &str = "trinetra.alerts";

/// Prefix of the per-camera frame streams on the frame bus.
pub const FRAME_STREAM_PREFIX: &str = "frames:";
/// Consumer group shared by all inference workers.
pub const INFERENCE_GROUP: &str = "inference-workers";

/// Dimensionality of the face embedding vectors.
pub const EMBEDDING_DIM: usize = 512;
/// COCO class id retained by the detector.
pub const PERSON_CLASS_ID: u32 = 0;

/// Name of the frame stream for one camera.
pub fn frame_stream_name(camera_id: &CameraId) -> String {
    format!("{}{}", FRAME_STREAM_PREFIX, camera_id)
}

/// Seconds since the Unix epoch, as carried in all event timestamps.
pub fn unix_time_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// L2 norm of an embedding slice.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Camera name as configured for a deployment, e.g. `cam_entrance_01`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, Eq, PartialOrd, Ord, Hash)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(s: String) -> Self {
        CameraId(s)
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CameraId {
    fn from(s: &str) -> Self {
        CameraId(s.to_string())
    }
}

/// Stable customer identity as enrolled in the face gallery.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize, Eq, PartialOrd, Ord, Hash)]
pub struct CustomerId(String);

impl CustomerId {
    pub fn new(s: String) -> Self {
        CustomerId(s)
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CustomerId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CustomerId {
    fn from(s: &str) -> Self {
        CustomerId(s.to_string())
    }
}

/// Role of a camera in the store layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraType {
    Entrance,
    FaceCapture,
    Tracking,
    Billing,
    Vehicle,
    /// Camera types this build does not know about deserialize to this.
    #[serde(other)]
    Unknown,
}

impl CameraType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraType::Entrance => "entrance",
            CameraType::FaceCapture => "face_capture",
            CameraType::Tracking => "tracking",
            CameraType::Billing => "billing",
            CameraType::Vehicle => "vehicle",
            CameraType::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for CameraType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "entrance" => CameraType::Entrance,
            "face_capture" => CameraType::FaceCapture,
            "tracking" => CameraType::Tracking,
            "billing" => CameraType::Billing,
            "vehicle" => CameraType::Vehicle,
            _ => CameraType::Unknown,
        })
    }
}

impl std::fmt::Display for CameraType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

/// One person detection within a frame.
///
/// `bbox` is `[x1, y1, x2, y2]`, normalized to `[0, 1]` of the frame. The
/// `track_id` field is reserved: no tracker assigns ids yet and it is always 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub track_id: u32,
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    /// Bbox area in normalized units.
    pub fn area(&self) -> f32 {
        let [x1, y1, x2, y2] = self.bbox;
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }
}

/// Per-frame output of the inference worker.
///
/// `detections` and `embeddings` are aligned 1:1: the i-th embedding belongs
/// to the i-th detection. A frame with no people yields empty arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceEvent {
    pub camera_id: CameraId,
    pub camera_type: CameraType,
    pub ingest_ts: f64,
    pub worker_ts: f64,
    pub detections: Vec<Detection>,
    pub embeddings: Vec<Vec<f32>>,
}

impl InferenceEvent {
    pub fn is_aligned(&self) -> bool {
        self.detections.len() == self.embeddings.len()
    }
}

/// How a [`ResolvedIdentity`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Accepted nearest neighbor from the gallery.
    Ann,
    /// No acceptable candidate; `customer_id` is null.
    Unknown,
}

/// Output of the identity resolver for one inference event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub event_id: Uuid,
    pub camera_id: CameraId,
    pub camera_type: CameraType,
    pub track_id: u32,
    pub customer_id: Option<CustomerId>,
    pub confidence: f32,
    pub match_method: MatchMethod,
    pub ingest_ts: f64,
    pub resolve_ts: f64,
    pub bbox: Vec<f32>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    UnknownAtBilling,
    /// Reserved for deployments enrolling `vip_tier` in the gallery payload.
    VipDetected,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::UnknownAtBilling => "UNKNOWN_AT_BILLING",
            AlertType::VipDetected => "VIP_DETECTED",
        }
    }
}

/// Downstream-facing alert emitted by the identity resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: Uuid,
    pub alert_type: AlertType,
    pub camera_id: CameraId,
    pub customer_id: Option<CustomerId>,
    pub severity: Severity,
    pub ts: f64,
    pub metadata: serde_json::Value,
}

#[test]
fn test_camera_type_wire_names() {
    let ty: CameraType = serde_json::from_str("\"face_capture\"").unwrap();
    assert_eq!(ty, CameraType::FaceCapture);
    assert_eq!(serde_json::to_string(&CameraType::Billing).unwrap(), "\"billing\"");
    // Forward compatibility: unknown type names must not fail deserialization.
    let ty: CameraType = serde_json::from_str("\"thermal\"").unwrap();
    assert_eq!(ty, CameraType::Unknown);
}

#[test]
fn test_inference_event_json_shape() {
    let event = InferenceEvent {
        camera_id: "cam_entrance_01".into(),
        camera_type: CameraType::Entrance,
        ingest_ts: 1000.5,
        worker_ts: 1000.6,
        detections: vec![Detection {
            track_id: 0,
            bbox: [0.1, 0.2, 0.3, 0.4],
            confidence: 0.9,
            class_id: PERSON_CLASS_ID,
        }],
        embeddings: vec![vec![0.0; EMBEDDING_DIM]],
    };
    assert!(event.is_aligned());

    let value: serde_json::Value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["camera_id"], "cam_entrance_01");
    assert_eq!(value["camera_type"], "entrance");
    assert_eq!(value["detections"][0]["class_id"], 0);
    assert_eq!(value["embeddings"][0].as_array().unwrap().len(), EMBEDDING_DIM);

    let back: InferenceEvent = serde_json::from_value(value).unwrap();
    assert_eq!(back, event);
}

#[test]
fn test_resolved_identity_unknown_serializes_null() {
    let resolved = ResolvedIdentity {
        event_id: Uuid::nil(),
        camera_id: "cam_billing_01".into(),
        camera_type: CameraType::Billing,
        track_id: 0,
        customer_id: None,
        confidence: 0.0,
        match_method: MatchMethod::Unknown,
        ingest_ts: 10.0,
        resolve_ts: 11.0,
        bbox: vec![],
        embedding: vec![],
    };
    let value = serde_json::to_value(&resolved).unwrap();
    assert!(value["customer_id"].is_null());
    assert_eq!(value["match_method"], "unknown");
}

#[test]
fn test_alert_wire_names() {
    let alert = AlertEvent {
        alert_id: Uuid::nil(),
        alert_type: AlertType::UnknownAtBilling,
        camera_id: "cam_billing_01".into(),
        customer_id: None,
        severity: Severity::Medium,
        ts: 5.0,
        metadata: serde_json::json!({"track_id": 0}),
    };
    let value = serde_json::to_value(&alert).unwrap();
    assert_eq!(value["alert_type"], "UNKNOWN_AT_BILLING");
    assert_eq!(value["severity"], "MEDIUM");
}

#[test]
fn test_detection_area() {
    let det = Detection {
        track_id: 0,
        bbox: [0.5, 0.5, 0.25, 0.75],
        confidence: 0.5,
        class_id: 0,
    };
    // Degenerate (inverted) boxes clamp to zero area.
    assert_eq!(det.area(), 0.0);
}
