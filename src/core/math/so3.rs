//! SO(3) primitives: skew operator, exponential/logarithm maps and the
//! left Jacobian family.
//!
//! Conventions follow the axis-angle parameterization with left
//! perturbations, so `exp(phi) ≈ I + skew(phi)` for small `phi`.

use nalgebra::{Matrix3, Vector3};

/// Angle below which series expansions replace the closed forms.
const SMALL_ANGLE: f64 = 1e-9;

/// Skew-symmetric matrix `[v]x` such that `[v]x u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rotation matrix from an axis-angle vector (Rodrigues formula).
pub fn exp(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    if theta < SMALL_ANGLE {
        return Matrix3::identity() + skew(phi);
    }
    let axis = phi / theta;
    let s = skew(&axis);
    Matrix3::identity() + theta.sin() * s + (1.0 - theta.cos()) * s * s
}

/// Axis-angle vector of a rotation matrix.
///
/// Handles the small-angle and near-pi branches; the returned angle lies in
/// `[0, pi]`.
pub fn log(rot: &Matrix3<f64>) -> Vector3<f64> {
    let cos_theta = ((rot.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();

    if theta < SMALL_ANGLE {
        // First order: the off-diagonal skew part already is phi.
        return 0.5
            * Vector3::new(
                rot[(2, 1)] - rot[(1, 2)],
                rot[(0, 2)] - rot[(2, 0)],
                rot[(1, 0)] - rot[(0, 1)],
            );
    }

    if (std::f64::consts::PI - theta) < 1e-6 {
        // Near pi the skew part vanishes; recover the axis from the
        // symmetric part R + I whose columns are parallel to the axis.
        let sym = rot + Matrix3::identity();
        let mut best_col = 0;
        let mut best_norm = 0.0;
        for c in 0..3 {
            let n = sym.column(c).norm();
            if n > best_norm {
                best_norm = n;
                best_col = c;
            }
        }
        let axis = sym.column(best_col).normalize();
        return theta * axis;
    }

    let factor = theta / (2.0 * theta.sin());
    factor
        * Vector3::new(
            rot[(2, 1)] - rot[(1, 2)],
            rot[(0, 2)] - rot[(2, 0)],
            rot[(1, 0)] - rot[(0, 1)],
        )
}

/// Left Jacobian `J_l(phi)` of SO(3).
pub fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let s = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() + 0.5 * s;
    }
    let t2 = theta * theta;
    let t3 = t2 * theta;
    Matrix3::identity() + ((1.0 - theta.cos()) / t2) * s + ((theta - theta.sin()) / t3) * (s * s)
}

/// Inverse left Jacobian `J_l(phi)^-1` of SO(3).
pub fn left_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let s = skew(phi);
    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * s + (1.0 / 12.0) * (s * s);
    }
    let t2 = theta * theta;
    let coeff = 1.0 / t2 - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() - 0.5 * s + coeff * (s * s)
}

/// Angular distance between two rotations, in degrees.
#[inline]
pub fn angular_distance_deg(rot_a: &Matrix3<f64>, rot_b: &Matrix3<f64>) -> f64 {
    let cos_theta = (((rot_a * rot_b.transpose()).trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
    cos_theta.acos().to_degrees()
}

/// Orthogonality defect `| ||R R^T||_F^2 - 3 |` of a rotation matrix.
#[inline]
pub fn orthogonality_defect(rot: &Matrix3<f64>) -> f64 {
    let gram = rot * rot.transpose();
    (gram.norm_squared() - 3.0).abs()
}

/// Reproject a drifted rotation matrix onto SO(3).
///
/// Uses the polar form `R ← (R R^T)^(-1/2) R`; a no-op while the
/// orthogonality defect stays below `1e-6`.
pub fn reproject_rotation(rot: &Matrix3<f64>) -> Matrix3<f64> {
    if orthogonality_defect(rot) <= 1e-6 {
        return *rot;
    }
    let gram = nalgebra::SymmetricEigen::new(rot * rot.transpose());
    let mut inv_sqrt = Matrix3::zeros();
    for i in 0..3 {
        let val = gram.eigenvalues[i].max(f64::MIN_POSITIVE);
        let v = gram.eigenvectors.column(i);
        inv_sqrt += (1.0 / val.sqrt()) * v * v.transpose();
    }
    inv_sqrt * rot
}
