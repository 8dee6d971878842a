//! Dense Gauss-Newton over a factor-graph problem.
//!
//! Every variable perturbs in 6 dimensions, so the normal equations are
//! assembled block-wise into a dense system and solved by Cholesky. Window
//! sizes are bounded by the sliding-window filter, which keeps the dense
//! solve small.

use std::collections::HashMap;

use log::debug;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn, Vector6};

use crate::error::{OdometryError, Result};
use crate::estimation::problem::Problem;
use crate::estimation::state::{StateVector, VarKey};

/// Gauss-Newton settings.
#[derive(Debug, Clone, Copy)]
pub struct GaussNewtonParams {
    /// Maximum number of linearize/solve/update sweeps.
    pub max_iterations: usize,
    /// Emit per-iteration step norms through the `log` facade.
    pub verbose: bool,
}

impl Default for GaussNewtonParams {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            verbose: false,
        }
    }
}

/// Outcome of a solve, retaining the final normal equations for covariance
/// queries.
pub struct SolveReport {
    /// Sweeps executed.
    pub iterations: usize,
    /// Whether the step norm dropped below the termination threshold.
    pub converged: bool,
    /// Final Gauss-Newton Hessian (J^T J over all factors plus the marginal
    /// prior).
    pub hessian: DMatrix<f64>,
    /// Offset of each free variable's 6-dof block inside `hessian`.
    pub block_index: HashMap<VarKey, usize>,
}

/// Step norm below which the sweep loop stops.
const STEP_TOLERANCE: f64 = 1e-10;

/// Run Gauss-Newton on `problem`, updating `states` in place.
pub fn solve(
    problem: &Problem,
    states: &mut StateVector,
    params: &GaussNewtonParams,
) -> Result<SolveReport> {
    // Free variables: active and not locked. Order fixes the block layout.
    let free: Vec<VarKey> = problem
        .active_keys
        .iter()
        .copied()
        .filter(|&k| !states.is_locked(k))
        .collect();
    let block_index: HashMap<VarKey, usize> = free
        .iter()
        .enumerate()
        .map(|(i, &k)| (k, 6 * i))
        .collect();
    let dim = 6 * free.len();

    let mut hessian = DMatrix::<f64>::zeros(dim, dim);
    let mut iterations = 0;
    let mut converged = false;

    for sweep in 0..params.max_iterations.max(1) {
        iterations = sweep + 1;
        hessian.fill(0.0);
        let mut gradient = DVector::<f64>::zeros(dim);

        for term in &problem.terms {
            let lin = term.linearize(states)?;
            for (i, &key_i) in lin.keys.iter().enumerate() {
                let Some(&row) = block_index.get(&key_i) else {
                    continue;
                };
                let jac_i = &lin.jacobians[i];
                let mut grad_block = gradient.rows_mut(row, 6);
                grad_block -= jac_i.transpose() * &lin.residual;
                for (j, &key_j) in lin.keys.iter().enumerate() {
                    let Some(&col) = block_index.get(&key_j) else {
                        continue;
                    };
                    let mut hess_block = hessian.view_mut((row, col), (6, 6));
                    hess_block += jac_i.transpose() * &lin.jacobians[j];
                }
            }
        }

        if let Some(marginal) = &problem.marginal {
            marginal.contribute(states, &block_index, &mut hessian, &mut gradient);
        }

        if dim == 0 {
            converged = true;
            break;
        }

        let chol = Cholesky::<f64, Dyn>::new(hessian.clone()).ok_or(
            OdometryError::SolverFailure {
                context: "gauss-newton normal equations",
            },
        )?;
        let step = chol.solve(&gradient);

        for (&key, &offset) in &block_index {
            let delta = Vector6::from_iterator(step.rows(offset, 6).iter().copied());
            states.apply_step(key, &delta);
        }

        let step_norm = step.norm();
        if params.verbose {
            debug!("gauss-newton sweep {sweep}: step norm {step_norm:.3e}");
        }
        if step_norm < STEP_TOLERANCE {
            converged = true;
            break;
        }
    }

    Ok(SolveReport {
        iterations,
        converged,
        hessian,
        block_index,
    })
}
