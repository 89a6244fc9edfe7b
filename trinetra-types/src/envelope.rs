//! The semi-typed record crossing the frame bus.
//!
//! Frame-bus entries are field maps on the wire. [`FrameEnvelope`] is the
//! typed form; conversion applies the schema check once, at the edge, so the
//! rest of the worker never sees raw field maps.

use bytes::Bytes;

use crate::{CameraId, CameraType};

/// Field names of a frame-bus entry.
const FIELD_CAMERA_ID: &str = "camera_id";
const FIELD_CAMERA_TYPE: &str = "camera_type";
const FIELD_INGEST_TS: &str = "ingest_ts";
const FIELD_FRAME: &str = "frame";

#[derive(thiserror::Error, Debug)]
pub enum EnvelopeError {
    #[error("missing field \"{0}\"")]
    MissingField(&'static str),
    #[error("field \"{field}\" is not valid UTF-8")]
    NotUtf8 { field: &'static str },
    #[error("field \"ingest_ts\" is not a decimal timestamp: {0:?}")]
    BadTimestamp(String),
}

/// One frame as published by the stream ingestor.
///
/// `frame` is a JPEG-encoded 640×640 image; the ingestor resizes before
/// encoding, so consumers never need the original resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEnvelope {
    pub camera_id: CameraId,
    pub camera_type: CameraType,
    /// Seconds since epoch at capture time, carried as a decimal string.
    pub ingest_ts: f64,
    pub frame: Bytes,
}

impl FrameEnvelope {
    /// Field pairs in wire order, for stream append.
    pub fn to_field_pairs(&self) -> Vec<(&'static str, Vec<u8>)> {
        vec![
            (FIELD_CAMERA_ID, self.camera_id.as_str().as_bytes().to_vec()),
            (
                FIELD_CAMERA_TYPE,
                self.camera_type.as_str().as_bytes().to_vec(),
            ),
            (
                FIELD_INGEST_TS,
                format!("{}", self.ingest_ts).into_bytes(),
            ),
            (FIELD_FRAME, self.frame.to_vec()),
        ]
    }

    /// Parse wire field pairs, validating the schema.
    ///
    /// The four known fields are required; fields added by newer producers
    /// are ignored.
    pub fn from_field_pairs(pairs: &[(String, Vec<u8>)]) -> Result<Self, EnvelopeError> {
        fn find<'a>(
            pairs: &'a [(String, Vec<u8>)],
            name: &'static str,
        ) -> Result<&'a [u8], EnvelopeError> {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_slice())
                .ok_or(EnvelopeError::MissingField(name))
        }

        fn utf8<'a>(raw: &'a [u8], field: &'static str) -> Result<&'a str, EnvelopeError> {
            std::str::from_utf8(raw).map_err(|_| EnvelopeError::NotUtf8 { field })
        }

        let camera_id = utf8(find(pairs, FIELD_CAMERA_ID)?, FIELD_CAMERA_ID)?;
        let camera_type = utf8(find(pairs, FIELD_CAMERA_TYPE)?, FIELD_CAMERA_TYPE)?;
        let ingest_raw = utf8(find(pairs, FIELD_INGEST_TS)?, FIELD_INGEST_TS)?;
        let ingest_ts: f64 = ingest_raw
            .parse()
            .map_err(|_| EnvelopeError::BadTimestamp(ingest_raw.to_string()))?;
        let frame = find(pairs, FIELD_FRAME)?;

        Ok(FrameEnvelope {
            camera_id: CameraId::new(camera_id.to_string()),
            camera_type: camera_type.parse().unwrap_or(CameraType::Unknown),
            ingest_ts,
            frame: Bytes::copy_from_slice(frame),
        })
    }
}

#[test]
fn test_envelope_round_trip() {
    let envelope = FrameEnvelope {
        camera_id: "cam_face_01".into(),
        camera_type: CameraType::FaceCapture,
        ingest_ts: 1234.0625,
        frame: Bytes::from_static(b"\xff\xd8jpeg\xff\xd9"),
    };
    let pairs: Vec<(String, Vec<u8>)> = envelope
        .to_field_pairs()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    let back = FrameEnvelope::from_field_pairs(&pairs).unwrap();
    assert_eq!(back, envelope);
}

#[test]
fn test_envelope_missing_field() {
    let pairs = vec![("camera_id".to_string(), b"cam_x".to_vec())];
    match FrameEnvelope::from_field_pairs(&pairs) {
        Err(EnvelopeError::MissingField("camera_type")) => {}
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_envelope_bad_timestamp() {
    let envelope = FrameEnvelope {
        camera_id: "cam_x".into(),
        camera_type: CameraType::Tracking,
        ingest_ts: 1.0,
        frame: Bytes::new(),
    };
    let mut pairs: Vec<(String, Vec<u8>)> = envelope
        .to_field_pairs()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    pairs[2].1 = b"not-a-number".to_vec();
    assert!(matches!(
        FrameEnvelope::from_field_pairs(&pairs),
        Err(EnvelopeError::BadTimestamp(_))
    ));
}

#[test]
fn test_envelope_ignores_extra_fields() {
    let mut pairs: Vec<(String, Vec<u8>)> = FrameEnvelope {
        camera_id: "cam_x".into(),
        camera_type: CameraType::Entrance,
        ingest_ts: 2.5,
        frame: Bytes::from_static(b"x"),
    }
    .to_field_pairs()
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    pairs.push(("sequence".to_string(), b"17".to_vec()));
    assert!(FrameEnvelope::from_field_pairs(&pairs).is_ok());
}
