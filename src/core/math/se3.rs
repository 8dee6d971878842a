//! Rigid transforms on SE(3) with the twist machinery used by the
//! continuous-time trajectory.
//!
//! Twists are ordered translation-first, `xi = [rho, phi]`, and perturbations
//! are applied on the left: `T <- exp(delta) * T`.

use nalgebra::{Matrix3, Matrix4, Matrix6, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use super::so3;

/// A rigid transform stored as rotation matrix plus translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    /// Rotation block.
    pub rotation: Matrix3<f64>,
    /// Translation block.
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    #[inline]
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from rotation and translation.
    #[inline]
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a homogeneous 4x4 matrix (bottom row is ignored).
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        Self {
            rotation: m.fixed_view::<3, 3>(0, 0).into_owned(),
            translation: m.fixed_view::<3, 1>(0, 3).into_owned(),
        }
    }

    /// Homogeneous 4x4 matrix.
    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Composition `self * other`.
    #[inline]
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Inverse transform.
    #[inline]
    pub fn inverse(&self) -> SE3 {
        let rot_inv = self.rotation.transpose();
        SE3 {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply to a point.
    #[inline]
    pub fn transform(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Exponential map from a twist `[rho, phi]`.
    pub fn exp(xi: &Vector6<f64>) -> SE3 {
        let rho = xi.fixed_rows::<3>(0).into_owned();
        let phi = xi.fixed_rows::<3>(3).into_owned();
        SE3 {
            rotation: so3::exp(&phi),
            translation: so3::left_jacobian(&phi) * rho,
        }
    }

    /// Logarithm map to a twist `[rho, phi]`.
    pub fn log(&self) -> Vector6<f64> {
        let phi = so3::log(&self.rotation);
        let rho = so3::left_jacobian_inv(&phi) * self.translation;
        let mut xi = Vector6::zeros();
        xi.fixed_rows_mut::<3>(0).copy_from(&rho);
        xi.fixed_rows_mut::<3>(3).copy_from(&phi);
        xi
    }

    /// Adjoint matrix mapping twists across this transform.
    pub fn adjoint(&self) -> Matrix6<f64> {
        let mut ad = Matrix6::zeros();
        ad.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        ad.fixed_view_mut::<3, 3>(3, 3).copy_from(&self.rotation);
        ad.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(so3::skew(&self.translation) * self.rotation));
        ad
    }

    /// Reproject the rotation block onto SO(3) if it drifted.
    pub fn reprojected(&self) -> SE3 {
        SE3 {
            rotation: so3::reproject_rotation(&self.rotation),
            translation: self.translation,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

/// The se(3) adjoint operator `ad(xi)` ("curly hat") of a twist.
pub fn curlyhat(xi: &Vector6<f64>) -> Matrix6<f64> {
    let rho = xi.fixed_rows::<3>(0).into_owned();
    let phi = xi.fixed_rows::<3>(3).into_owned();
    let mut m = Matrix6::zeros();
    let phi_x = so3::skew(&phi);
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(&phi_x);
    m.fixed_view_mut::<3, 3>(3, 3).copy_from(&phi_x);
    m.fixed_view_mut::<3, 3>(0, 3).copy_from(&so3::skew(&rho));
    m
}

/// Barfoot's `Q(rho, phi)` block of the SE(3) left Jacobian.
fn q_block(rho: &Vector3<f64>, phi: &Vector3<f64>) -> Matrix3<f64> {
    let rx = so3::skew(rho);
    let px = so3::skew(phi);
    let theta = phi.norm();
    if theta < 1e-9 {
        return 0.5 * rx + (1.0 / 6.0) * (px * rx + rx * px);
    }
    let t2 = theta * theta;
    let t3 = t2 * theta;
    let t4 = t3 * theta;
    let t5 = t4 * theta;
    let (sin_t, cos_t) = theta.sin_cos();

    let c1 = (theta - sin_t) / t3;
    let c2 = -(1.0 - 0.5 * t2 - cos_t) / t4;
    let c3 = -0.5 * ((1.0 - 0.5 * t2 - cos_t) / t4 - 3.0 * (theta - sin_t - t3 / 6.0) / t5);

    0.5 * rx
        + c1 * (px * rx + rx * px + px * rx * px)
        + c2 * (px * px * rx + rx * px * px - 3.0 * px * rx * px)
        + c3 * (px * rx * px * px + px * px * rx * px)
}

/// SE(3) left Jacobian `J(xi)`.
pub fn left_jacobian(xi: &Vector6<f64>) -> Matrix6<f64> {
    let rho = xi.fixed_rows::<3>(0).into_owned();
    let phi = xi.fixed_rows::<3>(3).into_owned();
    let jl = so3::left_jacobian(&phi);
    let q = q_block(&rho, &phi);
    let mut j = Matrix6::zeros();
    j.fixed_view_mut::<3, 3>(0, 0).copy_from(&jl);
    j.fixed_view_mut::<3, 3>(3, 3).copy_from(&jl);
    j.fixed_view_mut::<3, 3>(0, 3).copy_from(&q);
    j
}

/// SE(3) inverse left Jacobian `J(xi)^-1`.
pub fn left_jacobian_inv(xi: &Vector6<f64>) -> Matrix6<f64> {
    let rho = xi.fixed_rows::<3>(0).into_owned();
    let phi = xi.fixed_rows::<3>(3).into_owned();
    let jl_inv = so3::left_jacobian_inv(&phi);
    let q = q_block(&rho, &phi);
    let mut j = Matrix6::zeros();
    j.fixed_view_mut::<3, 3>(0, 0).copy_from(&jl_inv);
    j.fixed_view_mut::<3, 3>(3, 3).copy_from(&jl_inv);
    j.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&(-jl_inv * q * jl_inv));
    j
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_twist() -> Vector6<f64> {
        Vector6::new(0.4, -0.2, 0.7, 0.1, -0.3, 0.2)
    }

    #[test]
    fn exp_log_roundtrip() {
        let xi = sample_twist();
        let t = SE3::exp(&xi);
        assert_relative_eq!(t.log(), xi, epsilon = 1e-10);
    }

    #[test]
    fn compose_with_inverse_is_identity() {
        let t = SE3::exp(&sample_twist());
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.rotation, Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn matrix_roundtrip() {
        let t = SE3::exp(&sample_twist());
        let back = SE3::from_matrix(&t.matrix());
        assert_relative_eq!(back.rotation, t.rotation, epsilon = 1e-14);
        assert_relative_eq!(back.translation, t.translation, epsilon = 1e-14);
    }

    #[test]
    fn adjoint_transports_twists() {
        // Ad(T) xi must satisfy exp(Ad(T) xi) = T exp(xi) T^-1.
        let t = SE3::exp(&sample_twist());
        let xi = Vector6::new(0.05, 0.02, -0.03, 0.01, 0.04, -0.02);
        let lhs = SE3::exp(&(t.adjoint() * xi));
        let rhs = t.compose(&SE3::exp(&xi)).compose(&t.inverse());
        assert_relative_eq!(lhs.rotation, rhs.rotation, epsilon = 1e-6);
        assert_relative_eq!(lhs.translation, rhs.translation, epsilon = 1e-6);
    }

    #[test]
    fn left_jacobian_inverse_pair() {
        let xi = sample_twist();
        let prod = left_jacobian(&xi) * left_jacobian_inv(&xi);
        assert_relative_eq!(prod, Matrix6::identity(), epsilon = 1e-9);
    }

    #[test]
    fn left_jacobian_first_order_consistency() {
        // exp(xi + J^-1 * eps) ~= exp(eps_lifted) for the defining relation
        // exp(xi + d) ~= exp(J d) exp(xi).
        let xi = sample_twist();
        let d = Vector6::new(1e-6, -2e-6, 3e-7, 2e-6, -1e-6, 5e-7);
        let lhs = SE3::exp(&(xi + d));
        let rhs = SE3::exp(&(left_jacobian(&xi) * d)).compose(&SE3::exp(&xi));
        assert_relative_eq!(lhs.rotation, rhs.rotation, epsilon = 1e-10);
        assert_relative_eq!(lhs.translation, rhs.translation, epsilon = 1e-10);
    }

    #[test]
    fn curlyhat_is_lie_bracket() {
        // ad(a) b = -ad(b) a.
        let a = sample_twist();
        let b = Vector6::new(-0.1, 0.2, 0.05, 0.3, -0.1, 0.2);
        assert_relative_eq!(curlyhat(&a) * b, -(curlyhat(&b) * a), epsilon = 1e-12);
    }
}
