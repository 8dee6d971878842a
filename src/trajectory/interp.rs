//! Lazy interpolators over the trajectory knots.
//!
//! An interpolator captures knot keys and the closed-form interpolation
//! weights at construction; evaluation reads the arena, so the same
//! interpolator tracks the state as the solver updates it. Outside the knot
//! span the boundary knot is reported (no extrapolation).
//!
//! Jacobians follow the local-coordinate chain with the usual first-order
//! approximations for the derivatives of `J(xi)^-1 v` with respect to `xi`;
//! the approximation error is second order in the between-knot motion and
//! vanishes at the knots.

use nalgebra::{Matrix6, Vector6};

use crate::core::math::se3::{curlyhat, left_jacobian, left_jacobian_inv};
use crate::core::math::SE3;
use crate::estimation::state::{StateVector, VarKey};
use crate::trajectory::gp::InterpWeights;
use crate::trajectory::Knot;

/// Where a query time fell relative to the knots.
#[derive(Debug, Clone)]
pub(crate) enum Span {
    /// Clamped to a single knot (query at, before, or beyond the span).
    AtKnot(Knot),
    /// Strictly between two knots.
    Between {
        k1: Knot,
        k2: Knot,
        weights: InterpWeights,
    },
}

/// Interpolated pose `T_rm(tau)` with Jacobians.
#[derive(Debug, Clone)]
pub struct PoseInterpolator {
    pub(crate) span: Span,
}

/// Interpolated body velocity with Jacobians.
#[derive(Debug, Clone)]
pub struct VelocityInterpolator {
    pub(crate) span: Span,
}

/// Interpolated body acceleration with Jacobians.
#[derive(Debug, Clone)]
pub struct AccelerationInterpolator {
    pub(crate) span: Span,
}

/// Multiply a diagonal 6x6 block (stored as its diagonal) with a vector.
#[inline]
fn diag_mul(d: &Vector6<f64>, v: &Vector6<f64>) -> Vector6<f64> {
    d.component_mul(v)
}

/// Promote a diagonal block to a dense matrix.
#[inline]
fn diag_mat(d: &Vector6<f64>) -> Matrix6<f64> {
    Matrix6::from_diagonal(d)
}

/// Everything the three interpolators need at a query strictly between two
/// knots: values and the per-variable sensitivity chain.
pub(crate) struct SpanEval {
    /// Canonical variable order:
    /// `[T1, w1, dw1, T2, w2, dw2]`.
    pub keys: [VarKey; 6],
    pub pose: SE3,
    pub velocity: Vector6<f64>,
    pub acceleration: Vector6<f64>,
    /// Left-perturbation Jacobians of the pose, per variable.
    pub pose_jac: [Matrix6<f64>; 6],
    pub velocity_jac: [Matrix6<f64>; 6],
    pub acceleration_jac: [Matrix6<f64>; 6],
}

pub(crate) fn eval_between(
    states: &StateVector,
    k1: &Knot,
    k2: &Knot,
    weights: &InterpWeights,
) -> SpanEval {
    let t1 = states.pose(k1.pose);
    let w1 = states.vector(k1.velocity);
    let dw1 = states.vector(k1.acceleration);
    let t2 = states.pose(k2.pose);
    let w2 = states.vector(k2.velocity);
    let dw2 = states.vector(k2.acceleration);

    let t21 = t2.compose(&t1.inverse());
    let xi21 = t21.log();
    let j21_inv = left_jacobian_inv(&xi21);
    let ad21 = t21.adjoint();

    // Local coordinates of knot 2 relative to knot 1.
    let g2v = j21_inv * w2;
    let g2a = -0.5 * curlyhat(&g2v) * w2 + j21_inv * dw2;

    let lam = &weights.lambda;
    let psi = &weights.psi;
    let gamma = |r: usize| -> Vector6<f64> {
        diag_mul(&lam[r][1], &w1)
            + diag_mul(&lam[r][2], &dw1)
            + diag_mul(&psi[r][0], &xi21)
            + diag_mul(&psi[r][1], &g2v)
            + diag_mul(&psi[r][2], &g2a)
    };
    let xi_i = gamma(0);
    let gv = gamma(1);
    let ga = gamma(2);

    let j_i = left_jacobian(&xi_i);
    let pose = SE3::exp(&xi_i).compose(&t1);
    let velocity = j_i * gv;
    let u = ga + 0.5 * curlyhat(&gv) * velocity;
    let acceleration = j_i * u;

    // Sensitivities of the knot-2 local coordinates.
    let d_xi21_t1 = -(j21_inv * ad21);
    let d_xi21_t2 = j21_inv;
    let d_g2v_xi = 0.5 * curlyhat(&w2);
    let d_g2v_w2 = j21_inv;
    let d_g2a_xi = 0.5 * curlyhat(&dw2) + 0.25 * curlyhat(&w2) * curlyhat(&w2);
    let d_g2a_w2 = 0.5 * curlyhat(&w2) * j21_inv - 0.5 * curlyhat(&g2v);
    let d_g2a_dw2 = j21_inv;

    // d(gamma_r)/d(variable), variables in canonical order.
    let row_sens = |r: usize| -> [Matrix6<f64>; 6] {
        let via_xi =
            diag_mat(&psi[r][0]) + diag_mat(&psi[r][1]) * d_g2v_xi + diag_mat(&psi[r][2]) * d_g2a_xi;
        [
            via_xi * d_xi21_t1,
            diag_mat(&lam[r][1]),
            diag_mat(&lam[r][2]),
            via_xi * d_xi21_t2,
            diag_mat(&psi[r][1]) * d_g2v_w2 + diag_mat(&psi[r][2]) * d_g2a_w2,
            diag_mat(&psi[r][2]) * d_g2a_dw2,
        ]
    };
    let d_g0 = row_sens(0);
    let d_g1 = row_sens(1);
    let d_g2 = row_sens(2);

    let ad_exp = SE3::exp(&xi_i).adjoint();
    let half_ad_gv = 0.5 * curlyhat(&gv);
    let half_ad_w = 0.5 * curlyhat(&velocity);
    let half_ad_u = 0.5 * curlyhat(&u);

    let mut pose_jac = [Matrix6::zeros(); 6];
    let mut velocity_jac = [Matrix6::zeros(); 6];
    let mut acceleration_jac = [Matrix6::zeros(); 6];
    for v in 0..6 {
        pose_jac[v] = j_i * d_g0[v];
        velocity_jac[v] = j_i * d_g1[v] - half_ad_gv * d_g0[v];
        let du = d_g2[v] + half_ad_gv * velocity_jac[v] - half_ad_w * d_g1[v];
        acceleration_jac[v] = j_i * du - half_ad_u * d_g0[v];
    }
    // The pose additionally carries the knot-1 group action.
    pose_jac[0] += ad_exp;

    SpanEval {
        keys: [
            k1.pose,
            k1.velocity,
            k1.acceleration,
            k2.pose,
            k2.velocity,
            k2.acceleration,
        ],
        pose,
        velocity,
        acceleration,
        pose_jac,
        velocity_jac,
        acceleration_jac,
    }
}

impl Span {
    fn pose_keys(&self) -> Vec<VarKey> {
        match self {
            Span::AtKnot(k) => vec![k.pose],
            Span::Between { k1, k2, .. } => vec![
                k1.pose,
                k1.velocity,
                k1.acceleration,
                k2.pose,
                k2.velocity,
                k2.acceleration,
            ],
        }
    }
}

impl PoseInterpolator {
    /// Variables the interpolated value depends on.
    pub fn keys(&self) -> Vec<VarKey> {
        self.span.pose_keys()
    }

    /// Current interpolated pose.
    pub fn value(&self, states: &StateVector) -> SE3 {
        match &self.span {
            Span::AtKnot(k) => states.pose(k.pose),
            Span::Between { k1, k2, weights } => eval_between(states, k1, k2, weights).pose,
        }
    }

    /// Left-perturbation Jacobians with respect to the bracketing knot
    /// variables.
    pub fn jacobians(&self, states: &StateVector) -> Vec<(VarKey, Matrix6<f64>)> {
        match &self.span {
            Span::AtKnot(k) => vec![(k.pose, Matrix6::identity())],
            Span::Between { k1, k2, weights } => {
                let eval = eval_between(states, k1, k2, weights);
                eval.keys.iter().copied().zip(eval.pose_jac).collect()
            }
        }
    }
}

impl VelocityInterpolator {
    /// Variables the interpolated value depends on.
    pub fn keys(&self) -> Vec<VarKey> {
        match &self.span {
            Span::AtKnot(k) => vec![k.velocity],
            span => span.pose_keys(),
        }
    }

    /// Current interpolated body velocity.
    pub fn value(&self, states: &StateVector) -> Vector6<f64> {
        match &self.span {
            Span::AtKnot(k) => states.vector(k.velocity),
            Span::Between { k1, k2, weights } => eval_between(states, k1, k2, weights).velocity,
        }
    }

    /// Jacobians with respect to the bracketing knot variables.
    pub fn jacobians(&self, states: &StateVector) -> Vec<(VarKey, Matrix6<f64>)> {
        match &self.span {
            Span::AtKnot(k) => vec![(k.velocity, Matrix6::identity())],
            Span::Between { k1, k2, weights } => {
                let eval = eval_between(states, k1, k2, weights);
                eval.keys.iter().copied().zip(eval.velocity_jac).collect()
            }
        }
    }
}

impl AccelerationInterpolator {
    /// Variables the interpolated value depends on.
    pub fn keys(&self) -> Vec<VarKey> {
        match &self.span {
            Span::AtKnot(k) => vec![k.acceleration],
            span => span.pose_keys(),
        }
    }

    /// Current interpolated body acceleration.
    pub fn value(&self, states: &StateVector) -> Vector6<f64> {
        match &self.span {
            Span::AtKnot(k) => states.vector(k.acceleration),
            Span::Between { k1, k2, weights } => {
                eval_between(states, k1, k2, weights).acceleration
            }
        }
    }

    /// Jacobians with respect to the bracketing knot variables.
    pub fn jacobians(&self, states: &StateVector) -> Vec<(VarKey, Matrix6<f64>)> {
        match &self.span {
            Span::AtKnot(k) => vec![(k.acceleration, Matrix6::identity())],
            Span::Between { k1, k2, weights } => {
                let eval = eval_between(states, k1, k2, weights);
                eval.keys
                    .iter()
                    .copied()
                    .zip(eval.acceleration_jac)
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::gp::interp_weights;
    use approx::assert_relative_eq;

    fn two_knot_setup() -> (StateVector, Knot, Knot, InterpWeights) {
        let mut states = StateVector::new();
        let w = Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.2);
        let t1 = SE3::identity();
        // A consistent constant-velocity pair: T2 = exp(dt * w) * T1.
        let dt = 0.5;
        let t2 = SE3::exp(&(dt * w)).compose(&t1);
        let k1 = Knot {
            time: 0.0,
            pose: states.add_pose(t1),
            velocity: states.add_vector(w),
            acceleration: states.add_vector(Vector6::zeros()),
        };
        let k2 = Knot {
            time: dt,
            pose: states.add_pose(t2),
            velocity: states.add_vector(w),
            acceleration: states.add_vector(Vector6::zeros()),
        };
        let weights = interp_weights(0.25, dt, &Vector6::zeros(), &Vector6::repeat(1.0));
        (states, k1, k2, weights)
    }

    #[test]
    fn constant_velocity_midpoint_lies_on_the_screw() {
        let (states, k1, k2, weights) = two_knot_setup();
        let eval = eval_between(&states, &k1, &k2, &weights);
        let expected = SE3::exp(&(0.25 * states.vector(k1.velocity)));
        assert_relative_eq!(eval.pose.rotation, expected.rotation, epsilon = 1e-6);
        assert_relative_eq!(eval.pose.translation, expected.translation, epsilon = 1e-6);
        assert_relative_eq!(eval.velocity, states.vector(k1.velocity), epsilon = 1e-6);
        assert_relative_eq!(eval.acceleration, Vector6::zeros(), epsilon = 1e-6);
    }

    /// Gentle motion keeps the between-knot twist small, where the
    /// first-order Jacobian terms dominate.
    fn small_motion_setup() -> (StateVector, Knot, Knot, InterpWeights) {
        let mut states = StateVector::new();
        let w1 = Vector6::new(0.04, -0.02, 0.03, 0.01, 0.02, -0.015);
        let w2 = Vector6::new(0.035, -0.025, 0.028, 0.012, 0.018, -0.012);
        let dw = Vector6::new(0.005, 0.002, -0.003, 0.001, -0.002, 0.001);
        let dt = 0.4;
        let t1 = SE3::exp(&Vector6::new(0.2, -0.1, 0.05, 0.03, -0.02, 0.08));
        let t2 = SE3::exp(&(dt * w1)).compose(&t1);
        let k1 = Knot {
            time: 0.0,
            pose: states.add_pose(t1),
            velocity: states.add_vector(w1),
            acceleration: states.add_vector(dw),
        };
        let k2 = Knot {
            time: dt,
            pose: states.add_pose(t2),
            velocity: states.add_vector(w2),
            acceleration: states.add_vector(dw),
        };
        let weights = interp_weights(0.15, dt, &Vector6::zeros(), &Vector6::repeat(1.0));
        (states, k1, k2, weights)
    }

    #[test]
    fn pose_jacobians_match_finite_differences() {
        let (states, k1, k2, weights) = small_motion_setup();
        let eval = eval_between(&states, &k1, &k2, &weights);
        let eps = 1e-6;

        for (slot, &key) in eval.keys.iter().enumerate() {
            for axis in 0..6 {
                let mut step = Vector6::zeros();
                step[axis] = eps;
                let mut perturbed = states.clone();
                perturbed.apply_step(key, &step);
                let plus = eval_between(&perturbed, &k1, &k2, &weights);
                // Numeric left-perturbation of the pose.
                let numeric = plus.pose.compose(&eval.pose.inverse()).log() / eps;
                let analytic = eval.pose_jac[slot].column(axis).into_owned();
                for row in 0..6 {
                    assert_relative_eq!(
                        numeric[row],
                        analytic[row],
                        epsilon = 1e-4,
                        max_relative = 0.05
                    );
                }
            }
        }
    }

    #[test]
    fn velocity_jacobians_match_finite_differences() {
        let (states, k1, k2, weights) = small_motion_setup();
        let eval = eval_between(&states, &k1, &k2, &weights);
        let eps = 1e-6;

        for (slot, &key) in eval.keys.iter().enumerate() {
            for axis in 0..6 {
                let mut step = Vector6::zeros();
                step[axis] = eps;
                let mut perturbed = states.clone();
                perturbed.apply_step(key, &step);
                let plus = eval_between(&perturbed, &k1, &k2, &weights);
                let numeric = (plus.velocity - eval.velocity) / eps;
                let analytic = eval.velocity_jac[slot].column(axis).into_owned();
                for row in 0..6 {
                    assert_relative_eq!(
                        numeric[row],
                        analytic[row],
                        epsilon = 1e-4,
                        max_relative = 0.05
                    );
                }
            }
        }
    }
}
