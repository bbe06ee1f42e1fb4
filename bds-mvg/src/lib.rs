//! Camera geometry and multi-view triangulation.
//!
//! Cameras are loaded from the capture source's per-camera parameter files
//! and expose a cached 3×4 projection matrix. Pairs of cameras reconstruct
//! 3D world points with the direct linear transform.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MvgError {
    #[error("invalid camera parameters: {0}")]
    InvalidCameraParams(String),
    #[error("SVD failed")]
    SvdFailed,
    #[error("triangulated point at infinity")]
    NearZeroW,
    #[error("fewer than two cameras")]
    NotEnoughCameras,
    #[error("unknown camera: {0}")]
    UnknownCamera(String),
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

pub type Result<M> = std::result::Result<M, MvgError>;

mod camera;
pub use crate::camera::{Camera, CaptureParameters};

mod system;
pub use crate::system::CameraSystem;

mod dlt;
pub use crate::dlt::triangulate_dlt;
