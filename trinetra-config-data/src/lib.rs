//! Deployment configuration files.
//!
//! Two TOML artifacts are loaded at service startup: the camera definitions
//! consumed by the stream ingestor, and the camera travel matrix consumed by
//! the identity resolver's spatiotemporal gate. Parse errors here are the
//! only errors in the system that are allowed to abort a process, and only
//! at startup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use trinetra_types::{CameraId, CameraType};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, Error>;

fn default_capture_fps() -> u32 {
    30
}

/// One camera as configured for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    pub id: CameraId,
    #[serde(rename = "type")]
    pub camera_type: CameraType,
    /// Capture source. Either an HTTP MJPEG URL or a `synthetic:` spec for
    /// camera-less development and tests.
    pub source: String,
    /// Frame rate the sampler aims to forward to the frame bus. Falls back
    /// to the service-wide `TARGET_FPS` when omitted.
    pub target_fps: Option<u32>,
    /// Frame rate the capture source delivers.
    #[serde(default = "default_capture_fps")]
    pub capture_fps: u32,
}

impl CameraConfig {
    /// Target forwarding rate, with the service-wide default applied.
    pub fn effective_target_fps(&self, default_target_fps: u32) -> u32 {
        self.target_fps.unwrap_or(default_target_fps).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CamerasConfig {
    pub cameras: Vec<CameraConfig>,
}

/// Parse the camera definitions file.
pub fn parse_cameras_file<P: AsRef<std::path::Path>>(fname: P) -> Result<CamerasConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let cfg: CamerasConfig = toml::from_str(&contents)?;
    if cfg.cameras.is_empty() {
        return Err(Error::Invalid("no cameras configured".into()));
    }
    for cam in &cfg.cameras {
        if cam.target_fps == Some(0) || cam.capture_fps == 0 {
            return Err(Error::Invalid(format!(
                "camera \"{}\": fps values must be positive",
                cam.id
            )));
        }
    }
    Ok(cfg)
}

/// Minimum seconds a person needs to move between any two cameras.
///
/// The matrix is a static per-deployment artifact derived from the store
/// floor plan. Missing pairs fall back to [`TravelMatrix::DEFAULT_MIN_TRAVEL_S`].
/// The algorithm does not require symmetry, although deployments should
/// configure symmetric values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TravelMatrix {
    entries: BTreeMap<CameraId, BTreeMap<CameraId, f64>>,
}

impl TravelMatrix {
    pub const DEFAULT_MIN_TRAVEL_S: f64 = 3.0;

    pub fn new(entries: BTreeMap<CameraId, BTreeMap<CameraId, f64>>) -> Self {
        TravelMatrix { entries }
    }

    /// Minimum travel time between two cameras, in seconds.
    pub fn min_travel(&self, from: &CameraId, to: &CameraId) -> f64 {
        self.entries
            .get(from)
            .and_then(|row| row.get(to))
            .copied()
            .unwrap_or(Self::DEFAULT_MIN_TRAVEL_S)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|row| row.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TravelMatrixFile {
    travel: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Parse the travel matrix file.
///
/// Format: `travel.<from_cam>.<to_cam> = <min_seconds>`.
pub fn parse_travel_matrix_file<P: AsRef<std::path::Path>>(fname: P) -> Result<TravelMatrix> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let file: TravelMatrixFile = toml::from_str(&contents)?;

    let mut entries = BTreeMap::new();
    for (from, row) in file.travel {
        let mut out_row = BTreeMap::new();
        for (to, seconds) in row {
            if seconds < 0.0 {
                return Err(Error::Invalid(format!(
                    "travel.{from}.{to}: negative travel time"
                )));
            }
            out_row.insert(CameraId::new(to), seconds);
        }
        entries.insert(CameraId::new(from), out_row);
    }
    Ok(TravelMatrix::new(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parse_cameras() {
        let f = write_temp(
            r#"
[[cameras]]
id = "cam_entrance_01"
type = "entrance"
source = "http://10.0.0.11/stream.mjpg"

[[cameras]]
id = "cam_billing_01"
type = "billing"
source = "synthetic:motion"
target_fps = 10
capture_fps = 25
"#,
        );
        let cfg = parse_cameras_file(f.path()).unwrap();
        assert_eq!(cfg.cameras.len(), 2);
        assert_eq!(cfg.cameras[0].camera_type, CameraType::Entrance);
        assert_eq!(cfg.cameras[0].capture_fps, 30);
        assert_eq!(cfg.cameras[0].effective_target_fps(15), 15);
        assert_eq!(cfg.cameras[1].capture_fps, 25);
        assert_eq!(cfg.cameras[1].effective_target_fps(15), 10);
    }

    #[test]
    fn reject_zero_fps() {
        let f = write_temp(
            r#"
[[cameras]]
id = "cam_x"
type = "tracking"
source = "synthetic:still"
target_fps = 0
"#,
        );
        assert!(matches!(parse_cameras_file(f.path()), Err(Error::Invalid(_))));
    }

    #[test]
    fn travel_matrix_lookup_and_default() {
        let f = write_temp(
            r#"
[travel.cam_entrance_01]
cam_billing_01 = 10.0
cam_face_01 = 2.0

[travel.cam_billing_01]
cam_entrance_01 = 10.0
"#,
        );
        let matrix = parse_travel_matrix_file(f.path()).unwrap();
        assert_eq!(
            matrix.min_travel(&"cam_entrance_01".into(), &"cam_billing_01".into()),
            10.0
        );
        // Unconfigured pair falls back to the default.
        assert_eq!(
            matrix.min_travel(&"cam_face_01".into(), &"cam_vehicle_01".into()),
            TravelMatrix::DEFAULT_MIN_TRAVEL_S
        );
    }

    #[test]
    fn travel_matrix_rejects_negative() {
        let f = write_temp(
            r#"
[travel.cam_a]
cam_b = -1.0
"#,
        );
        assert!(matches!(
            parse_travel_matrix_file(f.path()),
            Err(Error::Invalid(_))
        ));
    }
}
