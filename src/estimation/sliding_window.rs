//! Sliding-window filter: bounded window of live variables plus a
//! linearized prior absorbing everything marginalized out.
//!
//! Marginalization is a Schur complement over the factors connected to the
//! departing variables, relinearized at the current estimate. The resulting
//! quadratic is kept as a prior over the surviving variables and re-centered
//! only when the window slides again; in between, it contributes its gradient
//! at the current local offset from the stored linearization point.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::info;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use crate::error::{OdometryError, Result};
use crate::estimation::problem::{CostCollector, CostTerm, Problem};
use crate::estimation::state::{StateVector, VarKey, VarValue};

/// Quadratic prior left behind by marginalization.
///
/// Encodes `cost(delta) = const + rhs^T delta + 1/2 delta^T hessian delta`
/// where `delta` stacks each key's local offset from its linearization point.
#[derive(Clone)]
pub struct MarginalPrior {
    keys: Vec<VarKey>,
    hessian: DMatrix<f64>,
    rhs: DVector<f64>,
    lin_points: Vec<VarValue>,
}

impl MarginalPrior {
    /// Variables constrained by this prior.
    pub fn keys(&self) -> &[VarKey] {
        &self.keys
    }

    /// Add this prior's contribution to the assembled normal equations.
    pub fn contribute(
        &self,
        states: &StateVector,
        block_index: &HashMap<VarKey, usize>,
        hessian: &mut DMatrix<f64>,
        gradient: &mut DVector<f64>,
    ) {
        // Gradient at the current state: rhs + H * delta.
        let dim = 6 * self.keys.len();
        let mut delta = DVector::<f64>::zeros(dim);
        for (i, (&key, lin)) in self.keys.iter().zip(&self.lin_points).enumerate() {
            let d = states.local_diff(key, lin);
            delta.rows_mut(6 * i, 6).copy_from(&d);
        }
        let grad = &self.rhs + &self.hessian * delta;

        for (i, &key_i) in self.keys.iter().enumerate() {
            let Some(&row) = block_index.get(&key_i) else {
                continue;
            };
            let mut grad_block = gradient.rows_mut(row, 6);
            grad_block -= grad.rows(6 * i, 6);
            for (j, &key_j) in self.keys.iter().enumerate() {
                let Some(&col) = block_index.get(&key_j) else {
                    continue;
                };
                let mut hess_block = hessian.view_mut((row, col), (6, 6));
                hess_block += self.hessian.view((6 * i, 6 * j), (6, 6));
            }
        }
    }
}

/// Sliding-window factor-graph estimator.
#[derive(Default)]
pub struct SlidingWindowFilter {
    /// Enrolled variable groups, in enrollment order.
    groups: Vec<Vec<VarKey>>,
    /// Groups whose variables have been marginalized (by index into `groups`).
    retired: HashSet<usize>,
    /// Live factors. Factors touching marginalized variables are absorbed
    /// into the prior and removed.
    terms: Vec<Arc<dyn CostTerm>>,
    /// The absorbed past.
    marginal: Option<MarginalPrior>,
}

impl SlidingWindowFilter {
    /// Empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll a group of variables as active window state.
    pub fn add_state_variable(&mut self, group: Vec<VarKey>) {
        self.groups.push(group);
    }

    /// Number of active (not yet marginalized) variable groups.
    pub fn num_variable_groups(&self) -> usize {
        self.groups.len() - self.retired.len()
    }

    /// Number of live factors.
    pub fn num_cost_terms(&self) -> usize {
        self.terms.len()
    }

    /// Active variables, in enrollment order.
    pub fn active_keys(&self) -> Vec<VarKey> {
        self.groups
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.retired.contains(i))
            .flat_map(|(_, g)| g.iter().copied())
            .collect()
    }

    /// A child problem sharing this filter's prior and live factors.
    ///
    /// The ICP inner loop adds its per-iteration factors to the snapshot so
    /// the marginal history stays consistent without mutating the filter.
    pub fn snapshot(&self) -> Problem {
        Problem {
            active_keys: self.active_keys(),
            terms: self.terms.clone(),
            marginal: self.marginal.clone(),
        }
    }

    /// View the whole filter as a problem for the end-of-frame solve.
    pub fn problem(&self) -> Problem {
        self.snapshot()
    }

    /// Schur-complement the given variables out of the filter.
    ///
    /// Locked variables in `keys` are ignored (they are constants, not
    /// estimated state). Every factor touching a marginalized variable is
    /// relinearized at the current estimate, folded into the quadratic prior,
    /// and dropped from the live set.
    pub fn marginalize_variables(&mut self, keys: &[VarKey], states: &StateVector) -> Result<()> {
        // Keep the caller's ordering for deterministic block layout; the set
        // only answers membership queries.
        let mut marg_list: Vec<VarKey> = Vec::new();
        for &k in keys {
            if !states.is_locked(k) && !marg_list.contains(&k) {
                marg_list.push(k);
            }
        }
        let marg_set: HashSet<VarKey> = marg_list.iter().copied().collect();
        if marg_list.is_empty() {
            return Ok(());
        }

        // Factors connected to the departing variables.
        let (absorbed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.terms)
            .into_iter()
            .partition(|t| t.keys().iter().any(|k| marg_set.contains(k)));
        self.terms = kept;

        // Local variable set: departing variables, everything the absorbed
        // factors touch, and everything the existing prior touches.
        let mut local: Vec<VarKey> = Vec::new();
        let mut push_unique = |key: VarKey, local: &mut Vec<VarKey>| {
            if !local.contains(&key) {
                local.push(key);
            }
        };
        for &k in &marg_list {
            push_unique(k, &mut local);
        }
        for term in &absorbed {
            for k in term.keys() {
                if !states.is_locked(k) {
                    push_unique(k, &mut local);
                }
            }
        }
        if let Some(prior) = &self.marginal {
            for &k in prior.keys() {
                push_unique(k, &mut local);
            }
        }
        // Departing variables first, survivors after.
        local.sort_by_key(|k| !marg_set.contains(k));
        let num_marg = 6 * marg_list.len();
        let dim = 6 * local.len();
        let block_index: HashMap<VarKey, usize> = local
            .iter()
            .enumerate()
            .map(|(i, &k)| (k, 6 * i))
            .collect();

        let mut hessian = DMatrix::<f64>::zeros(dim, dim);
        let mut gradient = DVector::<f64>::zeros(dim);
        for term in &absorbed {
            let lin = term.linearize(states)?;
            for (i, &key_i) in lin.keys.iter().enumerate() {
                let Some(&row) = block_index.get(&key_i) else {
                    continue;
                };
                let jac_i = &lin.jacobians[i];
                let mut grad_block = gradient.rows_mut(row, 6);
                grad_block += jac_i.transpose() * &lin.residual;
                for (j, &key_j) in lin.keys.iter().enumerate() {
                    let Some(&col) = block_index.get(&key_j) else {
                        continue;
                    };
                    let mut hess_block = hessian.view_mut((row, col), (6, 6));
                    hess_block += jac_i.transpose() * &lin.jacobians[j];
                }
            }
        }
        if let Some(prior) = self.marginal.take() {
            // `contribute` negates the gradient for the solver; here we want
            // the raw gradient, so negate a scratch copy back.
            let mut neg_gradient = DVector::<f64>::zeros(dim);
            prior.contribute(states, &block_index, &mut hessian, &mut neg_gradient);
            gradient -= neg_gradient;
        }

        // Schur complement onto the survivors.
        let keep_dim = dim - num_marg;
        let h_mm = hessian.view((0, 0), (num_marg, num_marg)).into_owned();
        let h_mk = hessian.view((0, num_marg), (num_marg, keep_dim)).into_owned();
        let h_kk = hessian
            .view((num_marg, num_marg), (keep_dim, keep_dim))
            .into_owned();
        let g_m = gradient.rows(0, num_marg).into_owned();
        let g_k = gradient.rows(num_marg, keep_dim).into_owned();

        let chol = Cholesky::<f64, Dyn>::new(h_mm.clone())
            .or_else(|| {
                // A barely-constrained block can sit on the PSD boundary;
                // nudge once before giving up.
                Cholesky::<f64, Dyn>::new(h_mm + DMatrix::identity(num_marg, num_marg) * 1e-10)
            })
            .ok_or(OdometryError::SolverFailure {
                context: "marginalization",
            })?;
        let h_mm_inv_mk = chol.solve(&h_mk);
        let h_mm_inv_gm = chol.solve(&g_m);

        let new_hessian = h_kk - h_mk.transpose() * h_mm_inv_mk;
        let new_rhs = g_k - h_mk.transpose() * h_mm_inv_gm;
        let survivors: Vec<VarKey> = local[marg_list.len()..].to_vec();
        let lin_points = survivors.iter().map(|&k| states.value(k)).collect();

        self.marginal = Some(MarginalPrior {
            keys: survivors,
            hessian: new_hessian,
            rhs: new_rhs,
            lin_points,
        });

        // Retire every group fully contained in the departing set.
        for (i, group) in self.groups.iter().enumerate() {
            if !self.retired.contains(&i) && group.iter().all(|k| marg_set.contains(k) || states.is_locked(*k)) {
                self.retired.insert(i);
            }
        }

        info!(
            "marginalized {} variables; {} groups remain active",
            marg_list.len(),
            self.num_variable_groups()
        );
        Ok(())
    }
}

impl CostCollector for SlidingWindowFilter {
    fn add_cost_term(&mut self, term: Arc<dyn CostTerm>) {
        self.terms.push(term);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::gauss_newton::{self, GaussNewtonParams};
    use crate::estimation::loss::RobustLoss;
    use crate::estimation::problem::{LinearizedTerm, NoiseModel};
    use approx::assert_relative_eq;
    use nalgebra::Vector6;

    /// `x_to - x_from = offset` with unit noise.
    struct Offset {
        from: VarKey,
        to: VarKey,
        offset: Vector6<f64>,
    }

    impl CostTerm for Offset {
        fn keys(&self) -> Vec<VarKey> {
            vec![self.from, self.to]
        }

        fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
            let residual = states.vector(self.to) - states.vector(self.from) - self.offset;
            let noise = NoiseModel::from_diagonal_covariance(&[1.0; 6])?;
            Ok(LinearizedTerm::assemble(
                vec![self.from, self.to],
                vec![-DMatrix::identity(6, 6), DMatrix::identity(6, 6)],
                DVector::from_iterator(6, residual.iter().copied()),
                &noise,
                RobustLoss::L2,
            ))
        }
    }

    /// Unary pull toward a value.
    struct Anchor {
        key: VarKey,
        value: Vector6<f64>,
    }

    impl CostTerm for Anchor {
        fn keys(&self) -> Vec<VarKey> {
            vec![self.key]
        }

        fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
            let noise = NoiseModel::from_diagonal_covariance(&[1.0; 6])?;
            Ok(LinearizedTerm::assemble(
                vec![self.key],
                vec![DMatrix::identity(6, 6)],
                DVector::from_iterator(
                    6,
                    (states.vector(self.key) - self.value).iter().copied(),
                ),
                &noise,
                RobustLoss::L2,
            ))
        }
    }

    #[test]
    fn marginalized_anchor_still_constrains_the_chain() {
        // x0 anchored at 0, x1 = x0 + 1, x2 = x1 + 1. Marginalize x0, then
        // solve: x1 and x2 must still land at 1 and 2.
        let mut states = StateVector::new();
        let x0 = states.add_vector(Vector6::zeros());
        let x1 = states.add_vector(Vector6::repeat(0.9));
        let x2 = states.add_vector(Vector6::repeat(2.2));

        let mut filter = SlidingWindowFilter::new();
        filter.add_state_variable(vec![x0]);
        filter.add_state_variable(vec![x1]);
        filter.add_state_variable(vec![x2]);
        filter.add_cost_term(Arc::new(Anchor {
            key: x0,
            value: Vector6::zeros(),
        }));
        filter.add_cost_term(Arc::new(Offset {
            from: x0,
            to: x1,
            offset: Vector6::repeat(1.0),
        }));
        filter.add_cost_term(Arc::new(Offset {
            from: x1,
            to: x2,
            offset: Vector6::repeat(1.0),
        }));

        filter.marginalize_variables(&[x0], &states).unwrap();
        assert_eq!(filter.num_variable_groups(), 2);
        assert_eq!(filter.num_cost_terms(), 1); // only x1 -> x2 survives

        let problem = filter.problem();
        gauss_newton::solve(&problem, &mut states, &GaussNewtonParams::default()).unwrap();

        assert_relative_eq!(states.vector(x1), Vector6::repeat(1.0), epsilon = 1e-8);
        assert_relative_eq!(states.vector(x2), Vector6::repeat(2.0), epsilon = 1e-8);
    }

    #[test]
    fn snapshot_solves_do_not_mutate_the_filter() {
        let mut states = StateVector::new();
        let x0 = states.add_vector(Vector6::zeros());
        let x1 = states.add_vector(Vector6::repeat(0.5));

        let mut filter = SlidingWindowFilter::new();
        filter.add_state_variable(vec![x0]);
        filter.add_state_variable(vec![x1]);
        filter.add_cost_term(Arc::new(Anchor {
            key: x0,
            value: Vector6::zeros(),
        }));

        let mut child = filter.snapshot();
        child.add_cost_term(Arc::new(Offset {
            from: x0,
            to: x1,
            offset: Vector6::repeat(1.0),
        }));

        assert_eq!(child.num_cost_terms(), 2);
        assert_eq!(filter.num_cost_terms(), 1);
        gauss_newton::solve(&child, &mut states, &GaussNewtonParams::default()).unwrap();
        assert_relative_eq!(states.vector(x1), Vector6::repeat(1.0), epsilon = 1e-8);
        // The filter still only holds its own factor.
        assert_eq!(filter.num_cost_terms(), 1);
    }

    #[test]
    fn marginalizing_locked_variables_is_a_no_op() {
        let mut states = StateVector::new();
        let x0 = states.add_vector(Vector6::zeros());
        states.set_locked(x0, true);

        let mut filter = SlidingWindowFilter::new();
        filter.add_state_variable(vec![x0]);
        filter.add_cost_term(Arc::new(Anchor {
            key: x0,
            value: Vector6::zeros(),
        }));

        filter.marginalize_variables(&[x0], &states).unwrap();
        assert_eq!(filter.num_cost_terms(), 1);
    }
}
