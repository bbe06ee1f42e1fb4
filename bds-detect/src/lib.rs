//! Detector adapter.
//!
//! The object detector itself is an external component (GPU inference); this
//! crate defines the capability interface the pipeline consumes and two
//! in-tree backends: a scripted mock for unit tests and a replay backend that
//! serves precomputed detections from disk, which is what makes end-to-end
//! runs deterministic without a GPU.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::info;

use bds_types::{BoundingBox, CamId, Detection, FrameBundle, ObjectClass};

/// Default minimum confidence a detection must have to be reported.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.40;

#[derive(thiserror::Error, Debug)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("no detections recorded for camera {camera} frame {frame_id} in {path}")]
    MissingReplayKey {
        camera: CamId,
        frame_id: u64,
        path: Utf8PathBuf,
    },
    #[error("IO error: {}", error)]
    Io {
        #[from]
        error: std::io::Error,
    },
    #[error("serde_json error: {}", error)]
    SerdeJson {
        #[from]
        error: serde_json::Error,
    },
}

pub type Result<M> = std::result::Result<M, DetectorError>;

/// Capability interface over the external object detector.
///
/// Contract: implementations return only detections with confidence at or
/// above their configured threshold, with bounding boxes in pixel
/// coordinates of the input image.
pub trait Detector: Send {
    /// Detect objects in one camera image.
    fn detect(&mut self, camera: &CamId, image: &Utf8Path, frame_id: u64)
        -> Result<Vec<Detection>>;

    /// Detect objects in every image of a synchronized bundle.
    ///
    /// The default implementation loops over [`Detector::detect`]; backends
    /// with real batched inference override this.
    fn detect_batch(&mut self, bundle: &FrameBundle) -> Result<BTreeMap<CamId, Vec<Detection>>> {
        let mut out = BTreeMap::new();
        for (camera, image) in &bundle.images {
            let detections = self.detect(camera, image, bundle.frame_id)?;
            out.insert(camera.clone(), detections);
        }
        Ok(out)
    }
}

fn apply_threshold(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections.retain(|d| d.confidence >= threshold);
    detections
}

/// Scripted detector for tests: detections are registered per camera and
/// frame ahead of time.
#[derive(Debug, Default)]
pub struct MockDetector {
    scripted: BTreeMap<(CamId, u64), Vec<Detection>>,
    confidence_threshold: f32,
}

impl MockDetector {
    pub fn new(confidence_threshold: f32) -> Self {
        Self {
            scripted: BTreeMap::new(),
            confidence_threshold,
        }
    }

    pub fn insert(&mut self, camera: CamId, frame_id: u64, detections: Vec<Detection>) {
        self.scripted.insert((camera, frame_id), detections);
    }
}

impl Detector for MockDetector {
    fn detect(
        &mut self,
        camera: &CamId,
        _image: &Utf8Path,
        frame_id: u64,
    ) -> Result<Vec<Detection>> {
        let detections = self
            .scripted
            .get(&(camera.clone(), frame_id))
            .cloned()
            .unwrap_or_default();
        Ok(apply_threshold(detections, self.confidence_threshold))
    }
}

/// One record in a replay file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub camera: String,
    pub frame_id: u64,
    pub class: String,
    pub bbox: [f32; 4],
    pub center: [f32; 2],
    pub confidence: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReplayFile {
    detections: Vec<ReplayRecord>,
}

/// Serves precomputed detections keyed by `(camera, frame_id)` from a JSON
/// file on disk.
#[derive(Debug)]
pub struct ReplayDetector {
    path: Utf8PathBuf,
    by_key: BTreeMap<(CamId, u64), Vec<Detection>>,
    confidence_threshold: f32,
    /// When false, a missing key yields an empty detection list instead of
    /// an error. Strict mode is for tests that must notice replay gaps.
    strict: bool,
}

impl ReplayDetector {
    pub fn from_path(path: &Utf8Path, confidence_threshold: f32) -> Result<Self> {
        let reader = std::fs::File::open(path).map_err(|e| {
            DetectorError::Unavailable(format!("cannot open replay file {path}: {e}"))
        })?;
        let file: ReplayFile = serde_json::from_reader(reader)?;

        let mut by_key: BTreeMap<(CamId, u64), Vec<Detection>> = BTreeMap::new();
        for rec in file.detections {
            let camera = CamId::new(rec.camera.clone());
            let detection = Detection {
                camera: camera.clone(),
                class: ObjectClass::from_name(&rec.class),
                bbox: BoundingBox {
                    x1: rec.bbox[0],
                    y1: rec.bbox[1],
                    x2: rec.bbox[2],
                    y2: rec.bbox[3],
                },
                center: (rec.center[0], rec.center[1]),
                confidence: rec.confidence,
            };
            by_key
                .entry((camera, rec.frame_id))
                .or_default()
                .push(detection);
        }
        info!("replay detector: {} keys loaded from {path}", by_key.len());

        Ok(Self {
            path: path.to_owned(),
            by_key,
            confidence_threshold,
            strict: false,
        })
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

impl Detector for ReplayDetector {
    fn detect(
        &mut self,
        camera: &CamId,
        _image: &Utf8Path,
        frame_id: u64,
    ) -> Result<Vec<Detection>> {
        match self.by_key.get(&(camera.clone(), frame_id)) {
            Some(detections) => Ok(apply_threshold(
                detections.clone(),
                self.confidence_threshold,
            )),
            None if self.strict => Err(DetectorError::MissingReplayKey {
                camera: camera.clone(),
                frame_id,
                path: self.path.clone(),
            }),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(camera: &CamId, class: ObjectClass, confidence: f32) -> Detection {
        Detection {
            camera: camera.clone(),
            class,
            bbox: BoundingBox {
                x1: 100.0,
                y1: 100.0,
                x2: 140.0,
                y2: 130.0,
            },
            center: (120.0, 115.0),
            confidence,
        }
    }

    #[test]
    fn mock_filters_by_confidence() {
        let cam = CamId::new("Camera_A");
        let mut det = MockDetector::new(0.40);
        det.insert(
            cam.clone(),
            7,
            vec![
                detection(&cam, ObjectClass::Airplane, 0.95),
                detection(&cam, ObjectClass::Flock, 0.39),
            ],
        );

        let got = det.detect(&cam, Utf8Path::new("frame_7.jpg"), 7).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].class, ObjectClass::Airplane);
    }

    #[test]
    fn mock_unknown_frame_is_empty() {
        let cam = CamId::new("Camera_A");
        let mut det = MockDetector::new(0.40);
        let got = det.detect(&cam, Utf8Path::new("frame_0.jpg"), 0).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn replay_detector_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.json");
        let file = ReplayFile {
            detections: vec![
                ReplayRecord {
                    camera: "Camera_A".to_string(),
                    frame_id: 0,
                    class: "Airplane".to_string(),
                    bbox: [10.0, 20.0, 30.0, 40.0],
                    center: [20.0, 30.0],
                    confidence: 0.9,
                },
                ReplayRecord {
                    camera: "Camera_A".to_string(),
                    frame_id: 0,
                    class: "Flock".to_string(),
                    bbox: [50.0, 50.0, 70.0, 60.0],
                    center: [60.0, 55.0],
                    confidence: 0.2,
                },
            ],
        };
        std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

        let path = Utf8PathBuf::from_path_buf(path).unwrap();
        let mut det = ReplayDetector::from_path(&path, 0.40).unwrap();

        let cam = CamId::new("Camera_A");
        let got = det.detect(&cam, Utf8Path::new("frame_0.jpg"), 0).unwrap();
        assert_eq!(got.len(), 1); // the 0.2-confidence flock is filtered
        assert_eq!(got[0].class, ObjectClass::Airplane);
        assert_eq!(got[0].bbox.center(), (20.0, 30.0));

        // Non-strict: unknown frame is an empty list.
        assert!(det.detect(&cam, Utf8Path::new("x"), 99).unwrap().is_empty());

        // Strict: unknown frame is an error.
        let mut det = det.strict();
        assert!(matches!(
            det.detect(&cam, Utf8Path::new("x"), 99),
            Err(DetectorError::MissingReplayKey { frame_id: 99, .. })
        ));
    }

    #[test]
    fn replay_missing_file_is_unavailable() {
        let err = ReplayDetector::from_path(Utf8Path::new("/no/such/file.json"), 0.4).unwrap_err();
        assert!(matches!(err, DetectorError::Unavailable(_)));
    }
}
