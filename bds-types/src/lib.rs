//! Shared type definitions for the bird detection system.
//!
//! Everything that crosses a crate boundary in the pipeline lives here: the
//! object classes emitted by the detector, per-camera detections, synchronized
//! frame bundles, triangulated world points, risk levels and the TCP wire
//! protocol.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

pub mod wire;
pub use wire::{EventCodec, WireMessage};

/// Largest world coordinate magnitude accepted from triangulation.
///
/// Candidates beyond this are numerical blow-ups (near-parallel rays) and are
/// rejected.
pub const MAX_WORLD_COORD: f64 = 10_000.0;

/// Nominal capture frame rate used to scale per-frame differences to seconds.
pub const NOMINAL_FPS: f64 = 30.0;

/// Name of a camera as used in recording directories and parameter files.
///
/// For the simulated airfield these are single letters ("A", "B", ...), but
/// any name matching the parameter filename prefix works.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CamId(String);

impl CamId {
    pub fn new<S: Into<String>>(s: S) -> Self {
        CamId(s.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Class of a detected aviation object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectClass {
    Airplane,
    Flock,
    /// A class the detector reports but the pipeline does not model.
    ///
    /// Preserved so that replayed detection files round-trip; matched only
    /// against the identical class name.
    Other(String),
}

impl ObjectClass {
    pub fn from_name(name: &str) -> Self {
        match name {
            "Airplane" => ObjectClass::Airplane,
            "Flock" => ObjectClass::Flock,
            other => ObjectClass::Other(other.to_string()),
        }
    }

    pub fn is_flock(&self) -> bool {
        matches!(self, ObjectClass::Flock)
    }
}

impl Serialize for ObjectClass {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectClass {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(ObjectClass::from_name(&name))
    }
}

impl std::fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectClass::Airplane => write!(f, "Airplane"),
            ObjectClass::Flock => write!(f, "Flock"),
            ObjectClass::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Axis-aligned pixel bounding box, `(x1, y1)` top-left, `(x2, y2)`
/// bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// One detection in one camera image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub camera: CamId,
    pub class: ObjectClass,
    pub bbox: BoundingBox,
    /// Pixel center. Usually the bbox center, but composite detections built
    /// by merging keep a confidence-weighted center instead.
    pub center: (f32, f32),
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
}

/// One synchronized frame across all monitored cameras.
///
/// Invariant: `images` holds at least two cameras.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBundle {
    /// Monotonically increasing bundle number assigned by the frame source.
    pub frame_id: u64,
    /// Wall-clock (or recorded) timestamp, seconds since the Unix epoch.
    pub timestamp: f64,
    pub images: BTreeMap<CamId, Utf8PathBuf>,
    /// Name of the recording session directory the images came from.
    pub recording_session: String,
}

/// A 3D world position reconstructed from a pair of cameras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriangulatedPoint {
    pub frame_id: u64,
    pub class: ObjectClass,
    pub position: Point3<f64>,
    /// Mean confidence of the contributing detections.
    pub confidence: f32,
    /// The ordered camera pair that produced this point. After merging of
    /// multi-pair candidates this is the first contributing pair.
    pub cameras: (CamId, CamId),
}

impl TriangulatedPoint {
    /// Whether the position satisfies the coordinate-magnitude invariant.
    pub fn is_within_world_bounds(&self) -> bool {
        self.position.iter().all(|c| c.abs() <= MAX_WORLD_COORD)
    }
}

/// Bird-strike risk level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    #[serde(rename = "BR_LOW")]
    Low,
    #[serde(rename = "BR_MEDIUM")]
    Medium,
    #[serde(rename = "BR_HIGH")]
    High,
}

impl RiskLevel {
    /// Wire representation (`BR_LOW`, `BR_MEDIUM`, `BR_HIGH`).
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "BR_LOW",
            RiskLevel::Medium => "BR_MEDIUM",
            RiskLevel::High => "BR_HIGH",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

/// Seconds since the Unix epoch, as carried in wire messages and bundles.
pub fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }

    #[test]
    fn risk_level_wire_names() {
        let json = serde_json::to_string(&RiskLevel::Medium).unwrap();
        assert_eq!(json, "\"BR_MEDIUM\"");
        let back: RiskLevel = serde_json::from_str("\"BR_HIGH\"").unwrap();
        assert_eq!(back, RiskLevel::High);
    }

    #[test]
    fn object_class_name_roundtrip() {
        for name in ["Airplane", "Flock", "Drone"] {
            let class = ObjectClass::from_name(name);
            let json = serde_json::to_string(&class).unwrap();
            assert_eq!(json, format!("\"{name}\""));
            let back: ObjectClass = serde_json::from_str(&json).unwrap();
            assert_eq!(back, class);
        }
    }

    #[test]
    fn bbox_center() {
        let bbox = BoundingBox {
            x1: 10.0,
            y1: 20.0,
            x2: 30.0,
            y2: 60.0,
        };
        assert_eq!(bbox.center(), (20.0, 40.0));
        assert_eq!(bbox.width(), 20.0);
        assert_eq!(bbox.height(), 40.0);
    }

    #[test]
    fn world_bounds_invariant() {
        let mut pt = TriangulatedPoint {
            frame_id: 0,
            class: ObjectClass::Airplane,
            position: Point3::new(5.0, 10.0, 200.0),
            confidence: 0.9,
            cameras: (CamId::new("A"), CamId::new("B")),
        };
        assert!(pt.is_within_world_bounds());
        pt.position = Point3::new(0.0, 0.0, 10_000.1);
        assert!(!pt.is_within_world_bounds());
    }
}
