//! Local surface statistics of a neighbor set.

use nalgebra::{Matrix3, SymmetricEigen, Vector3};

use crate::error::{OdometryError, Result};

/// Second-order statistics of a point neighborhood.
#[derive(Debug, Clone, Copy)]
pub struct Neighborhood {
    /// Barycenter of the neighbors.
    pub center: Vector3<f64>,
    /// Unit normal: eigenvector of the smallest scatter eigenvalue.
    pub normal: Vector3<f64>,
    /// Centered scatter matrix.
    pub covariance: Matrix3<f64>,
    /// Planarity coefficient `(sigma_2 - sigma_3) / sigma_1` with
    /// `sigma_1 >= sigma_2 >= sigma_3` the square roots of the eigenvalues.
    pub a2d: f64,
}

impl Neighborhood {
    /// Fit the neighborhood distribution of `points`.
    ///
    /// Returns [`OdometryError::DegenerateNeighborhood`] when the planarity
    /// coefficient comes out non-finite (all eigenvalues zero, or a scatter
    /// matrix poisoned by non-finite coordinates).
    pub fn estimate(points: &[Vector3<f64>]) -> Result<Self> {
        let mut center = Vector3::zeros();
        for p in points {
            center += p;
        }
        center /= points.len() as f64;

        let mut covariance = Matrix3::zeros();
        for p in points {
            let d = p - center;
            covariance += d * d.transpose();
        }

        let eigen = SymmetricEigen::new(covariance);
        // nalgebra does not order the eigenpairs; sort descending.
        let mut order = [0usize, 1, 2];
        order.sort_unstable_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

        let normal = eigen.eigenvectors.column(order[2]).normalize();
        let sigma_1 = eigen.eigenvalues[order[0]].abs().sqrt();
        let sigma_2 = eigen.eigenvalues[order[1]].abs().sqrt();
        let sigma_3 = eigen.eigenvalues[order[2]].abs().sqrt();
        let a2d = (sigma_2 - sigma_3) / sigma_1;

        if !a2d.is_finite() {
            return Err(OdometryError::DegenerateNeighborhood);
        }

        Ok(Self {
            center,
            normal,
            covariance,
            a2d,
        })
    }
}
