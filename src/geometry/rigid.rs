//! Closed-form rigid alignment between paired 3D point sets.
//!
//! Least-squares absolute orientation via SVD of the cross-covariance
//! matrix (Horn's method with scale fixed to 1). Degenerate inputs (fewer
//! than three pairs, collinear points, a rank-deficient covariance) report
//! failure instead of producing an undefined transform.

use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};

/// Minimum number of point pairs for a 6-DOF rigid estimate.
pub const MIN_PAIRS: usize = 3;

/// Estimate the rigid transform `T` minimizing `sum ||T * source_i - target_i||²`.
///
/// Returns `None` on degenerate input (too few pairs, mismatched lengths,
/// or a covariance matrix whose SVD cannot resolve a rotation).
pub fn estimate_rigid_transform(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
) -> Option<Isometry3<f64>> {
    let n = source.len();
    if n < MIN_PAIRS || n != target.len() {
        return None;
    }

    let centroid_src = centroid(source);
    let centroid_tgt = centroid(target);

    // Cross-covariance H = sum (src_i - c_src) (tgt_i - c_tgt)^T
    let mut h = Matrix3::zeros();
    for (s, t) in source.iter().zip(target.iter()) {
        h += (s - centroid_src) * (t - centroid_tgt).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation_mat = v_t.transpose() * u.transpose();

    // Reflection case: flip the sign of V's last column.
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }

    // A rank-deficient covariance (collinear points) leaves the rotation
    // underdetermined; reject rather than return an arbitrary solution.
    let sv = svd.singular_values;
    if sv[1] < 1e-12 * sv[0].max(1e-300) {
        return None;
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_mat));
    let translation = centroid_tgt - rotation * centroid_src;

    Some(Isometry3::from_parts(Translation3::from(translation), rotation))
}

fn centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    points.iter().sum::<Vector3<f64>>() / points.len() as f64
}

/// Absolute Euler-decomposed angles of the relative rotation `b * a⁻¹`.
///
/// Decomposition order: x = atan2(R21, R22), y = atan2(-R20, sqrt(R21² + R22²)),
/// z = atan2(R10, R00), all as absolute values. Hypothesis merging compares
/// each component against a single angular tolerance.
pub fn rotation_angle_deltas(a: &Isometry3<f64>, b: &Isometry3<f64>) -> [f64; 3] {
    let r = (b.rotation * a.rotation.inverse()).to_rotation_matrix();
    let m = r.matrix();
    let rx = m[(2, 1)].atan2(m[(2, 2)]).abs();
    let ry = (-m[(2, 0)])
        .atan2((m[(2, 1)] * m[(2, 1)] + m[(2, 2)] * m[(2, 2)]).sqrt())
        .abs();
    let rz = m[(1, 0)].atan2(m[(0, 0)]).abs();
    [rx, ry, rz]
}
