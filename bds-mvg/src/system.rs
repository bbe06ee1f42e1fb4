use std::collections::BTreeMap;

use camino::Utf8Path;
use nalgebra::geometry::{Point2, Point3};
use tracing::{info, warn};

use bds_types::CamId;

use crate::{triangulate_dlt, Camera, MvgError, Result};

const PARAMS_SUFFIX: &str = "_parameters.json";

/// All calibrated cameras observing the shared airspace, keyed by name.
///
/// Immutable after load; at least two cameras are required.
#[derive(Debug, Clone)]
pub struct CameraSystem {
    cams_by_name: BTreeMap<CamId, Camera>,
}

impl CameraSystem {
    pub fn new(cams_by_name: BTreeMap<CamId, Camera>) -> Result<Self> {
        if cams_by_name.len() < 2 {
            return Err(MvgError::NotEnoughCameras);
        }
        Ok(Self { cams_by_name })
    }

    /// Load every `<CameraName>_parameters.json` in a recording directory.
    ///
    /// The camera name is the filename prefix, which also names the
    /// directory holding that camera's frames. A file that fails to parse
    /// makes the whole load fail: a recording with a bad calibration cannot
    /// be triangulated.
    pub fn from_recording_dir(dir: &Utf8Path) -> Result<Self> {
        let mut cams = BTreeMap::new();
        for entry in dir.read_dir_utf8()? {
            let entry = entry?;
            let fname = entry.file_name();
            let Some(prefix) = fname.strip_suffix(PARAMS_SUFFIX) else {
                continue;
            };
            let cam = Camera::from_path(entry.path()).map_err(|e| match e {
                MvgError::SerdeJson { error } => {
                    MvgError::InvalidCameraParams(format!("{fname}: {error}"))
                }
                other => other,
            })?;
            let cc = cam.extrinsics().camcenter();
            info!(
                "loaded camera {prefix}: {}x{} at ({:.1}, {:.1}, {:.1})",
                cam.width(),
                cam.height(),
                cc[0],
                cc[1],
                cc[2]
            );
            cams.insert(CamId::new(prefix), cam);
        }
        if cams.len() < 2 {
            warn!(
                "recording directory {dir} has {} camera parameter file(s), need at least 2",
                cams.len()
            );
        }
        Self::new(cams)
    }

    #[inline]
    pub fn cams(&self) -> &BTreeMap<CamId, Camera> {
        &self.cams_by_name
    }

    #[inline]
    pub fn cam_by_name(&self, name: &CamId) -> Option<&Camera> {
        self.cams_by_name.get(name)
    }

    pub fn cam_names(&self) -> impl Iterator<Item = &CamId> {
        self.cams_by_name.keys()
    }

    /// Triangulate one world point from a pixel in each of two named cameras.
    pub fn triangulate_pair(
        &self,
        name_a: &CamId,
        name_b: &CamId,
        px_a: &Point2<f64>,
        px_b: &Point2<f64>,
    ) -> Result<Point3<f64>> {
        let cam_a = self
            .cam_by_name(name_a)
            .ok_or_else(|| MvgError::UnknownCamera(name_a.to_string()))?;
        let cam_b = self
            .cam_by_name(name_b)
            .ok_or_else(|| MvgError::UnknownCamera(name_b.to_string()))?;
        triangulate_dlt(cam_a, cam_b, px_a, px_b)
    }
}
