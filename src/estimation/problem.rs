//! Factor-graph problem assembly.
//!
//! A [`CostTerm`] is a nonlinear factor over arena variables. Linearization
//! produces whitened, robust-weighted residual/Jacobian blocks; the solver
//! only ever sees those. Factors are shared via `Arc` so the sliding-window
//! filter and its per-iteration snapshots can reference the same terms.

use std::sync::Arc;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use crate::error::{OdometryError, Result};
use crate::estimation::loss::RobustLoss;
use crate::estimation::state::{StateVector, VarKey};

/// Whitened, robust-weighted linearization of one factor.
#[derive(Debug, Clone)]
pub struct LinearizedTerm {
    /// Referenced variables (parallel to `jacobians`).
    pub keys: Vec<VarKey>,
    /// One `r x 6` Jacobian block per key.
    pub jacobians: Vec<DMatrix<f64>>,
    /// The `r`-dimensional residual.
    pub residual: DVector<f64>,
}

impl LinearizedTerm {
    /// Whiten and robust-weight raw residual/Jacobian blocks.
    pub fn assemble(
        keys: Vec<VarKey>,
        jacobians: Vec<DMatrix<f64>>,
        residual: DVector<f64>,
        noise: &NoiseModel,
        loss: RobustLoss,
    ) -> Self {
        let mut residual = noise.whiten_vector(&residual);
        let mut jacobians: Vec<_> = jacobians.iter().map(|j| noise.whiten_matrix(j)).collect();

        let scale = loss.weight(residual.norm_squared()).sqrt();
        if scale != 1.0 {
            residual *= scale;
            for j in &mut jacobians {
                *j *= scale;
            }
        }

        Self {
            keys,
            jacobians,
            residual,
        }
    }
}

/// A nonlinear factor over arena variables.
pub trait CostTerm: Send + Sync {
    /// Variables this factor reads.
    fn keys(&self) -> Vec<VarKey>;

    /// Linearize at the current state values.
    fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm>;
}

/// Square-root whitener built from a covariance or information matrix.
#[derive(Debug, Clone)]
pub struct NoiseModel {
    sqrt_info: DMatrix<f64>,
}

impl NoiseModel {
    /// From a measurement covariance `cov`: whitener `L^-1` with
    /// `cov = L L^T`.
    pub fn from_covariance(cov: DMatrix<f64>) -> Result<Self> {
        let dim = cov.nrows();
        let chol = Cholesky::<f64, Dyn>::new(cov).ok_or(OdometryError::SolverFailure {
            context: "noise covariance factorization",
        })?;
        let sqrt_info = chol
            .l()
            .solve_lower_triangular(&DMatrix::identity(dim, dim))
            .ok_or(OdometryError::SolverFailure {
                context: "noise covariance inversion",
            })?;
        Ok(Self { sqrt_info })
    }

    /// From a diagonal covariance.
    pub fn from_diagonal_covariance(diag: &[f64]) -> Result<Self> {
        Self::from_covariance(DMatrix::from_diagonal(&DVector::from_row_slice(diag)))
    }

    /// From an information matrix `W`: whitener `L^T` with `W = L L^T`.
    pub fn from_information(info: DMatrix<f64>) -> Result<Self> {
        let chol = Cholesky::<f64, Dyn>::new(info).ok_or(OdometryError::SolverFailure {
            context: "noise information factorization",
        })?;
        Ok(Self {
            sqrt_info: chol.l().transpose(),
        })
    }

    /// Whiten a residual.
    pub fn whiten_vector(&self, v: &DVector<f64>) -> DVector<f64> {
        &self.sqrt_info * v
    }

    /// Whiten a Jacobian block.
    pub fn whiten_matrix(&self, m: &DMatrix<f64>) -> DMatrix<f64> {
        &self.sqrt_info * m
    }
}

/// Anything that accepts cost terms: a standalone [`Problem`] or the
/// sliding-window filter.
pub trait CostCollector {
    /// Add a factor.
    fn add_cost_term(&mut self, term: Arc<dyn CostTerm>);
}

/// A standalone optimization problem over an explicit active set.
#[derive(Default, Clone)]
pub struct Problem {
    pub(crate) active_keys: Vec<VarKey>,
    pub(crate) terms: Vec<Arc<dyn CostTerm>>,
    pub(crate) marginal: Option<super::sliding_window::MarginalPrior>,
}

impl Problem {
    /// Empty problem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll a variable as free.
    pub fn add_state_variable(&mut self, key: VarKey) {
        if !self.active_keys.contains(&key) {
            self.active_keys.push(key);
        }
    }

    /// Number of factors.
    pub fn num_cost_terms(&self) -> usize {
        self.terms.len()
    }

    /// Free variables of this problem.
    pub fn active_keys(&self) -> &[VarKey] {
        &self.active_keys
    }
}

impl CostCollector for Problem {
    fn add_cost_term(&mut self, term: Arc<dyn CostTerm>) {
        self.terms.push(term);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn information_whitening_reproduces_quadratic_form() {
        let info = DMatrix::from_diagonal(&DVector::from_row_slice(&[4.0, 9.0]));
        let noise = NoiseModel::from_information(info).unwrap();
        let e = DVector::from_row_slice(&[1.0, 2.0]);
        let w = noise.whiten_vector(&e);
        // e^T W e = 4 + 36.
        assert_relative_eq!(w.norm_squared(), 40.0, epsilon = 1e-12);
    }

    #[test]
    fn covariance_whitening_inverts_the_scale() {
        let noise = NoiseModel::from_diagonal_covariance(&[0.25, 0.25, 0.25]).unwrap();
        let e = DVector::from_row_slice(&[0.5, 0.0, 0.0]);
        // Whitened norm = e / sigma = 1.0.
        assert_relative_eq!(noise.whiten_vector(&e).norm(), 1.0, epsilon = 1e-12);
    }
}
