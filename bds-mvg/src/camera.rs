#![allow(non_snake_case)]

use cam_geom::ExtrinsicParameters;
use nalgebra::{OMatrix, Point2, Point3, Quaternion, UnitQuaternion, U3, U4};
use opencv_ros_camera::RosOpenCvIntrinsics;
use serde::Deserialize;

use crate::{MvgError, Result};

/// Per-camera parameter record as written by the capture source.
///
/// Additional fields in the file are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureParameters {
    #[serde(rename = "imageWidth")]
    pub image_width: usize,
    #[serde(rename = "imageHeight")]
    pub image_height: usize,
    #[serde(rename = "projectionMatrix")]
    pub projection_matrix: ProjectionDescriptor,
    #[serde(rename = "position_UnityWorld")]
    pub position: WorldPosition,
    #[serde(rename = "rotation_UnityWorld")]
    pub rotation: WorldRotation,
}

/// The two projection-matrix entries needed to recover focal lengths.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectionDescriptor {
    pub m00: f64,
    pub m11: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorldPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Unit quaternion in `(x, y, z, w)` component order.
#[derive(Debug, Clone, Deserialize)]
pub struct WorldRotation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

/// A calibrated pinhole camera with a cached 3×4 projection matrix.
///
/// The world frame is Y-up with Z forward, matching the capture source. No
/// Y-flip is applied; pixel `v` grows with camera-frame `y`.
#[derive(Debug, Clone)]
pub struct Camera {
    width: usize,
    height: usize,
    inner: cam_geom::Camera<f64, RosOpenCvIntrinsics<f64>>,
    m: OMatrix<f64, U3, U4>,
}

impl Camera {
    pub fn new(
        width: usize,
        height: usize,
        extrinsics: ExtrinsicParameters<f64>,
        intrinsics: RosOpenCvIntrinsics<f64>,
    ) -> Self {
        let m = {
            let p33 = intrinsics.p.fixed_view::<3, 3>(0, 0);
            p33 * extrinsics.matrix()
        };
        let inner = cam_geom::Camera::new(intrinsics, extrinsics);
        Self {
            width,
            height,
            inner,
            m,
        }
    }

    /// Build a camera from a capture parameter record.
    ///
    /// Focal lengths are recovered from the normalized projection matrix as
    /// `fx = m00·w/2`, `fy = m11·h/2`; the principal point is the image
    /// center. The stored quaternion rotates camera to world, so its inverse
    /// is the world-to-camera rotation.
    pub fn from_capture_parameters(params: &CaptureParameters) -> Result<Self> {
        if params.image_width == 0 || params.image_height == 0 {
            return Err(MvgError::InvalidCameraParams(
                "zero image dimensions".to_string(),
            ));
        }
        let m00 = params.projection_matrix.m00;
        let m11 = params.projection_matrix.m11;
        if !(m00.is_finite() && m11.is_finite()) || m00 == 0.0 || m11 == 0.0 {
            return Err(MvgError::InvalidCameraParams(format!(
                "bad projection entries m00={m00} m11={m11}"
            )));
        }

        let width = params.image_width as f64;
        let height = params.image_height as f64;
        let fx = m00 * width / 2.0;
        let fy = m11 * height / 2.0;
        let cx = width / 2.0;
        let cy = height / 2.0;
        let intrinsics = RosOpenCvIntrinsics::from_params(fx, 0.0, fy, cx, cy);

        let r = &params.rotation;
        let quat = Quaternion::new(r.w, r.x, r.y, r.z);
        if quat.norm() < 1e-12 {
            return Err(MvgError::InvalidCameraParams(
                "zero-norm rotation quaternion".to_string(),
            ));
        }
        // from_quaternion renormalizes.
        let cam_to_world = UnitQuaternion::from_quaternion(quat);
        let camcenter = Point3::new(params.position.x, params.position.y, params.position.z);
        let extrinsics =
            ExtrinsicParameters::from_rotation_and_camcenter(cam_to_world.inverse(), camcenter);

        Ok(Camera::new(
            params.image_width,
            params.image_height,
            extrinsics,
            intrinsics,
        ))
    }

    /// Load a camera from a parameter JSON file.
    pub fn from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let reader = std::fs::File::open(path)?;
        let params: CaptureParameters = serde_json::from_reader(reader)?;
        Self::from_capture_parameters(&params)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// The cached projection matrix `P = K·[R|t]`.
    #[inline]
    pub fn pmat(&self) -> &OMatrix<f64, U3, U4> {
        &self.m
    }

    #[inline]
    pub fn extrinsics(&self) -> &ExtrinsicParameters<f64> {
        self.inner.extrinsics()
    }

    #[inline]
    pub fn intrinsics(&self) -> &RosOpenCvIntrinsics<f64> {
        self.inner.intrinsics()
    }

    /// Project a world point to pixel coordinates.
    pub fn project_3d_to_pixel(&self, pt3d: &Point3<f64>) -> Point2<f64> {
        let cc = self.m * pt3d.to_homogeneous();
        Point2::new(cc[0] / cc[2], cc[1] / cc[2])
    }
}
