//! Cross-camera matching and 3D reconstruction of per-frame detections.

use std::collections::BTreeMap;

use itertools::Itertools;
use nalgebra::geometry::{Point2, Point3};
use tracing::debug;

use bds_mvg::{triangulate_dlt, CameraSystem, MvgError};
use bds_types::{BoundingBox, CamId, Detection, ObjectClass, TriangulatedPoint, MAX_WORLD_COORD};

#[derive(Debug, Clone)]
pub struct TriangulatorConfig {
    /// Flock detections within this pixel distance of each other in one
    /// camera are merged into a composite before matching.
    pub pixel_merge_distance: f32,
    /// Triangulated flock positions within this XZ distance are merged.
    pub distance_threshold_m: f64,
}

impl Default for TriangulatorConfig {
    fn default() -> Self {
        Self {
            pixel_merge_distance: 100.0,
            distance_threshold_m: 100.0,
        }
    }
}

/// Matches detections across camera pairs and reconstructs world positions.
#[derive(Debug, Clone, Default)]
pub struct Triangulator {
    config: TriangulatorConfig,
}

/// One reconstructed candidate before cross-pair merging.
struct Candidate {
    position: Point3<f64>,
    confidence: f32,
    cameras: (CamId, CamId),
    /// Number of camera pairs merged into this candidate.
    weight: usize,
}

impl Triangulator {
    pub fn new(config: TriangulatorConfig) -> Self {
        Self { config }
    }

    /// Reconstruct 3D points for one frame. An empty result is normal when
    /// detections match in fewer than two cameras.
    pub fn triangulate_frame(
        &self,
        system: &CameraSystem,
        frame_id: u64,
        detections: &BTreeMap<CamId, Vec<Detection>>,
    ) -> Vec<TriangulatedPoint> {
        // One representative detection per (camera, class): the first
        // detection for rigid classes, the merged composite for flocks.
        let mut by_class: BTreeMap<ObjectClass, BTreeMap<CamId, Detection>> = BTreeMap::new();
        for (camera, dets) in detections {
            if system.cam_by_name(camera).is_none() {
                debug!("dropping detections from uncalibrated camera {camera}");
                continue;
            }
            let flocks: Vec<&Detection> = dets.iter().filter(|d| d.class.is_flock()).collect();
            if let Some(composite) =
                merge_camera_flocks(&flocks, self.config.pixel_merge_distance)
            {
                by_class
                    .entry(ObjectClass::Flock)
                    .or_default()
                    .insert(camera.clone(), composite);
            }
            for det in dets.iter().filter(|d| !d.class.is_flock()) {
                by_class
                    .entry(det.class.clone())
                    .or_default()
                    .entry(camera.clone())
                    .or_insert_with(|| det.clone());
            }
        }

        let mut out = Vec::new();
        for (class, per_camera) in by_class {
            let candidates = self.pair_candidates(system, &per_camera);
            if candidates.is_empty() {
                continue;
            }
            let merged = if class.is_flock() {
                merge_flock_candidates(candidates, self.config.distance_threshold_m)
            } else {
                vec![merge_candidates(candidates)]
            };
            for c in merged {
                out.push(TriangulatedPoint {
                    frame_id,
                    class: class.clone(),
                    position: c.position,
                    confidence: c.confidence,
                    cameras: c.cameras,
                });
            }
        }
        out
    }

    /// DLT over every camera pair seeing the class, with outlier rejection.
    fn pair_candidates(
        &self,
        system: &CameraSystem,
        per_camera: &BTreeMap<CamId, Detection>,
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for ((cam_a, det_a), (cam_b, det_b)) in per_camera.iter().tuple_combinations() {
            let px_a = Point2::new(det_a.center.0 as f64, det_a.center.1 as f64);
            let px_b = Point2::new(det_b.center.0 as f64, det_b.center.1 as f64);
            let position = match system.triangulate_pair(cam_a, cam_b, &px_a, &px_b) {
                Ok(p) => p,
                Err(MvgError::NearZeroW) => {
                    debug!("rejecting {cam_a}/{cam_b} candidate: point at infinity");
                    continue;
                }
                Err(e) => {
                    debug!("triangulation failed for {cam_a}/{cam_b}: {e}");
                    continue;
                }
            };
            if position.iter().any(|c| c.abs() > MAX_WORLD_COORD) {
                debug!(
                    "rejecting {cam_a}/{cam_b} candidate: coordinate blow-up {position:?}"
                );
                continue;
            }
            candidates.push(Candidate {
                position,
                confidence: (det_a.confidence + det_b.confidence) / 2.0,
                cameras: (cam_a.clone(), cam_b.clone()),
                weight: 1,
            });
        }
        candidates
    }
}

/// Merge flock detections of one camera whose centers are closer than
/// `pixel_distance`: confidence-weighted center, envelope bbox, mean
/// confidence. Returns the composite of the first cluster, or `None` when
/// the camera saw no flock.
fn merge_camera_flocks(flocks: &[&Detection], pixel_distance: f32) -> Option<Detection> {
    let first = *flocks.first()?;
    let mut members: Vec<&Detection> = vec![first];
    let mut center = first.center;
    for det in flocks[1..].iter().copied() {
        let dx = det.center.0 - center.0;
        let dy = det.center.1 - center.1;
        if (dx * dx + dy * dy).sqrt() <= pixel_distance {
            members.push(det);
            // running confidence-weighted center
            let total: f32 = members.iter().map(|d| d.confidence).sum();
            if total > 0.0 {
                center = (
                    members.iter().map(|d| d.center.0 * d.confidence).sum::<f32>() / total,
                    members.iter().map(|d| d.center.1 * d.confidence).sum::<f32>() / total,
                );
            }
        }
    }
    let bbox = BoundingBox {
        x1: members.iter().map(|d| d.bbox.x1).fold(f32::INFINITY, f32::min),
        y1: members.iter().map(|d| d.bbox.y1).fold(f32::INFINITY, f32::min),
        x2: members.iter().map(|d| d.bbox.x2).fold(f32::NEG_INFINITY, f32::max),
        y2: members.iter().map(|d| d.bbox.y2).fold(f32::NEG_INFINITY, f32::max),
    };
    let confidence = members.iter().map(|d| d.confidence).sum::<f32>() / members.len() as f32;
    Some(Detection {
        camera: first.camera.clone(),
        class: ObjectClass::Flock,
        bbox,
        center,
        confidence,
    })
}

/// Element-wise mean of candidates, weighted by contributing pair count.
fn merge_candidates(candidates: Vec<Candidate>) -> Candidate {
    debug_assert!(!candidates.is_empty());
    let total_weight: f64 = candidates.iter().map(|c| c.weight as f64).sum();
    let mut pos = Point3::origin();
    for c in &candidates {
        let w = c.weight as f64 / total_weight;
        pos.coords += c.position.coords * w;
    }
    let confidence =
        candidates.iter().map(|c| c.confidence).sum::<f32>() / candidates.len() as f32;
    let weight = candidates.iter().map(|c| c.weight).sum();
    let cameras = candidates[0].cameras.clone();
    Candidate {
        position: pos,
        confidence,
        cameras,
        weight,
    }
}

/// Merge flock candidates lying within `distance_m` of each other in the XZ
/// plane by (weighted) averaging.
fn merge_flock_candidates(candidates: Vec<Candidate>, distance_m: f64) -> Vec<Candidate> {
    let mut clusters: Vec<Vec<Candidate>> = Vec::new();
    for cand in candidates {
        let home = clusters.iter_mut().find(|cluster| {
            cluster.iter().any(|other| {
                let dx = cand.position.x - other.position.x;
                let dz = cand.position.z - other.position.z;
                (dx * dx + dz * dz).sqrt() <= distance_m
            })
        });
        match home {
            Some(cluster) => cluster.push(cand),
            None => clusters.push(vec![cand]),
        }
    }
    clusters.into_iter().map(merge_candidates).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use bds_mvg::Camera;

    fn test_system() -> CameraSystem {
        let make = |x: f64| {
            let text = format!(
                r#"{{
                    "imageWidth": 640, "imageHeight": 480,
                    "projectionMatrix": {{"m00": 1.875, "m11": 2.5}},
                    "position_UnityWorld": {{"x": {x}, "y": 10.0, "z": 0.0}},
                    "rotation_UnityWorld": {{"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0}}
                }}"#
            );
            let params = serde_json::from_str(&text).unwrap();
            Camera::from_capture_parameters(&params).unwrap()
        };
        let mut cams = BTreeMap::new();
        cams.insert(CamId::new("Camera_A"), make(0.0));
        cams.insert(CamId::new("Camera_B"), make(10.0));
        CameraSystem::new(cams).unwrap()
    }

    fn detection_at(camera: &str, class: ObjectClass, center: (f32, f32), conf: f32) -> Detection {
        Detection {
            camera: CamId::new(camera),
            class,
            bbox: BoundingBox {
                x1: center.0 - 10.0,
                y1: center.1 - 10.0,
                x2: center.0 + 10.0,
                y2: center.1 + 10.0,
            },
            center,
            confidence: conf,
        }
    }

    /// Detections for a world point, as each camera would report it.
    fn project(system: &CameraSystem, class: ObjectClass, pt: Point3<f64>, conf: f32)
        -> BTreeMap<CamId, Vec<Detection>>
    {
        let mut out: BTreeMap<CamId, Vec<Detection>> = BTreeMap::new();
        for (cam_id, cam) in system.cams() {
            let px = cam.project_3d_to_pixel(&pt);
            out.entry(cam_id.clone()).or_default().push(detection_at(
                cam_id.as_str(),
                class.clone(),
                (px.x as f32, px.y as f32),
                conf,
            ));
        }
        out
    }

    #[test]
    fn reconstructs_airplane_position() {
        let system = test_system();
        let pt = Point3::new(5.0, 10.0, 200.0);
        let detections = project(&system, ObjectClass::Airplane, pt, 0.9);

        let tri = Triangulator::default();
        let points = tri.triangulate_frame(&system, 3, &detections);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].class, ObjectClass::Airplane);
        assert_eq!(points[0].frame_id, 3);
        assert_relative_eq!(points[0].position, pt, epsilon = 0.5);
        assert!(points[0].is_within_world_bounds());
        assert_relative_eq!(points[0].confidence, 0.9);
    }

    #[test]
    fn classes_triangulated_independently() {
        let system = test_system();
        let mut detections = project(&system, ObjectClass::Airplane, Point3::new(5.0, 10.0, 200.0), 0.9);
        for (cam, dets) in project(&system, ObjectClass::Flock, Point3::new(-20.0, 5.0, 150.0), 0.8) {
            detections.get_mut(&cam).unwrap().extend(dets);
        }

        let tri = Triangulator::default();
        let points = tri.triangulate_frame(&system, 0, &detections);
        assert_eq!(points.len(), 2);
        for p in &points {
            match p.class {
                ObjectClass::Airplane => assert_relative_eq!(p.position.z, 200.0, epsilon = 0.5),
                ObjectClass::Flock => assert_relative_eq!(p.position.z, 150.0, epsilon = 0.5),
                _ => panic!("unexpected class"),
            }
        }
    }

    #[test]
    fn fragmented_flock_yields_one_composite_point() {
        // Three flock boxes within 80 px of each other in camera A must not
        // fragment into multiple 3D flocks.
        let system = test_system();
        let pt = Point3::new(-20.0, 5.0, 150.0);
        let mut detections = project(&system, ObjectClass::Flock, pt, 0.8);
        let cam_a = CamId::new("Camera_A");
        let base = detections[&cam_a][0].center;
        detections.get_mut(&cam_a).unwrap().push(detection_at(
            "Camera_A",
            ObjectClass::Flock,
            (base.0 + 50.0, base.1),
            0.6,
        ));
        detections.get_mut(&cam_a).unwrap().push(detection_at(
            "Camera_A",
            ObjectClass::Flock,
            (base.0 - 40.0, base.1 + 30.0),
            0.4,
        ));

        let tri = Triangulator::default();
        let points = tri.triangulate_frame(&system, 0, &detections);
        let flocks: Vec<_> = points.iter().filter(|p| p.class.is_flock()).collect();
        assert_eq!(flocks.len(), 1);
    }

    #[test]
    fn composite_flock_center_is_confidence_weighted() {
        let a = detection_at("Camera_A", ObjectClass::Flock, (100.0, 100.0), 0.6);
        let b = detection_at("Camera_A", ObjectClass::Flock, (140.0, 100.0), 0.2);
        let merged = merge_camera_flocks(&[&a, &b], 100.0).unwrap();
        // center pulled toward the more confident detection
        assert_relative_eq!(merged.center.0, (100.0 * 0.6 + 140.0 * 0.2) / 0.8);
        assert_relative_eq!(merged.confidence, 0.4);
        // envelope bbox spans both members
        assert_relative_eq!(merged.bbox.x1, 90.0);
        assert_relative_eq!(merged.bbox.x2, 150.0);
    }

    #[test]
    fn distant_flocks_stay_separate_in_camera() {
        let a = detection_at("Camera_A", ObjectClass::Flock, (100.0, 100.0), 0.6);
        let b = detection_at("Camera_A", ObjectClass::Flock, (400.0, 100.0), 0.2);
        let merged = merge_camera_flocks(&[&a, &b], 100.0).unwrap();
        // the far detection is not merged; the first cluster wins
        assert_relative_eq!(merged.center.0, 100.0);
    }

    #[test]
    fn parallel_rays_produce_no_output() {
        // Same pixel in both cameras: rays are parallel, the DLT solution is
        // at infinity and the candidate must be silently dropped.
        let system = test_system();
        let mut detections = BTreeMap::new();
        for cam in ["Camera_A", "Camera_B"] {
            detections.insert(
                CamId::new(cam),
                vec![detection_at(cam, ObjectClass::Airplane, (320.0, 240.0), 0.9)],
            );
        }
        let tri = Triangulator::default();
        assert!(tri.triangulate_frame(&system, 0, &detections).is_empty());
    }

    #[test]
    fn single_camera_detection_is_not_triangulated() {
        let system = test_system();
        let mut detections = BTreeMap::new();
        detections.insert(
            CamId::new("Camera_A"),
            vec![detection_at("Camera_A", ObjectClass::Airplane, (320.0, 240.0), 0.9)],
        );
        let tri = Triangulator::default();
        assert!(tri.triangulate_frame(&system, 0, &detections).is_empty());
    }

    #[test]
    fn output_respects_world_bounds() {
        // Nearly-parallel rays triangulate far outside the world volume and
        // must be rejected by the coordinate bound.
        let system = test_system();
        let mut detections = BTreeMap::new();
        detections.insert(
            CamId::new("Camera_A"),
            vec![detection_at("Camera_A", ObjectClass::Airplane, (320.0, 240.0), 0.9)],
        );
        detections.insert(
            CamId::new("Camera_B"),
            vec![detection_at("Camera_B", ObjectClass::Airplane, (320.05, 240.0), 0.9)],
        );
        let tri = Triangulator::default();
        for p in tri.triangulate_frame(&system, 0, &detections) {
            assert!(p.is_within_world_bounds());
        }
    }
}
