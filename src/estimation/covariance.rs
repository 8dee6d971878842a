//! Posterior covariance queries over a finished solve.

use nalgebra::{Cholesky, DMatrix, Dyn, Matrix6};

use crate::error::{OdometryError, Result};
use crate::estimation::gauss_newton::SolveReport;
use crate::estimation::state::VarKey;

/// Dense posterior covariance extracted from the final normal equations.
pub struct Covariance {
    inverse: DMatrix<f64>,
    report_index: std::collections::HashMap<VarKey, usize>,
}

impl Covariance {
    /// Invert the solve's Gauss-Newton Hessian.
    pub fn new(report: &SolveReport) -> Result<Self> {
        let chol = Cholesky::<f64, Dyn>::new(report.hessian.clone()).ok_or(
            OdometryError::SolverFailure {
                context: "covariance extraction",
            },
        )?;
        Ok(Self {
            inverse: chol.inverse(),
            report_index: report.block_index.clone(),
        })
    }

    /// 6x6 cross-covariance block between two variables.
    ///
    /// Returns `None` for variables that were locked or outside the problem.
    pub fn block(&self, a: VarKey, b: VarKey) -> Option<Matrix6<f64>> {
        let &row = self.report_index.get(&a)?;
        let &col = self.report_index.get(&b)?;
        Some(self.inverse.fixed_view::<6, 6>(row, col).into_owned())
    }

    /// Joint covariance over a list of variables, in the given order.
    ///
    /// Variables absent from the problem contribute zero blocks (they were
    /// held constant).
    pub fn joint(&self, keys: &[VarKey]) -> DMatrix<f64> {
        let dim = 6 * keys.len();
        let mut joint = DMatrix::<f64>::zeros(dim, dim);
        for (i, &a) in keys.iter().enumerate() {
            for (j, &b) in keys.iter().enumerate() {
                if let Some(block) = self.block(a, b) {
                    joint.view_mut((6 * i, 6 * j), (6, 6)).copy_from(&block);
                }
            }
        }
        joint
    }
}
