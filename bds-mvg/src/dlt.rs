#![allow(non_snake_case)]

use nalgebra::{Matrix4, Point2, Point3, RowVector4};

use crate::{Camera, MvgError, Result};

/// Homogeneous `w` below this is treated as a point at infinity.
const NEAR_ZERO_W: f64 = 1e-8;

/// Triangulate one world point from a pixel observation in each of two
/// cameras using the direct linear transform.
///
/// Each observation contributes the two constraint rows `u·P₂ − P₀` and
/// `v·P₂ − P₁`; the homogeneous solution is the right singular vector of the
/// 4×4 design matrix with the smallest singular value, dehomogenized by its
/// fourth component.
pub fn triangulate_dlt(
    cam_a: &Camera,
    cam_b: &Camera,
    px_a: &Point2<f64>,
    px_b: &Point2<f64>,
) -> Result<Point3<f64>> {
    let mut design = Matrix4::<f64>::zeros();
    for (i, (cam, px)) in [(cam_a, px_a), (cam_b, px_b)].into_iter().enumerate() {
        let P = cam.pmat();
        let r0: RowVector4<f64> = P.row(2) * px.x - P.row(0);
        let r1: RowVector4<f64> = P.row(2) * px.y - P.row(1);
        design.set_row(2 * i, &r0);
        design.set_row(2 * i + 1, &r1);
    }

    let svd = design.svd(false, true);
    let v_t = svd.v_t.ok_or(MvgError::SvdFailed)?;
    let min_idx = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .ok_or(MvgError::SvdFailed)?;
    let h = v_t.row(min_idx);

    let w = h[3];
    if w.abs() < NEAR_ZERO_W {
        return Err(MvgError::NearZeroW);
    }
    Ok(Point3::new(h[0] / w, h[1] / w, h[2] / w))
}
