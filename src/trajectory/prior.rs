//! Between-knot motion-prior factor.
//!
//! The 18-dimensional residual propagates the first knot's local state
//! through the transition matrix and compares against the second knot's
//! local coordinates, whitened by the interval's process-noise covariance:
//! `e = Phi(dt) gamma_1 - gamma_2`.

use nalgebra::{DMatrix, DVector, Matrix6, Vector6};

use crate::core::math::se3::{curlyhat, left_jacobian_inv};
use crate::error::Result;
use crate::estimation::loss::RobustLoss;
use crate::estimation::problem::{CostTerm, LinearizedTerm, NoiseModel};
use crate::estimation::state::{StateVector, VarKey};
use crate::trajectory::gp::DiagBlocks;
use crate::trajectory::Knot;

pub(crate) struct GpPriorFactor {
    k1: Knot,
    k2: Knot,
    phi: DiagBlocks,
    noise: NoiseModel,
}

impl GpPriorFactor {
    pub(crate) fn new(k1: Knot, k2: Knot, phi: DiagBlocks, q: DMatrix<f64>) -> Result<Self> {
        Ok(Self {
            k1,
            k2,
            phi,
            noise: NoiseModel::from_covariance(q)?,
        })
    }
}

/// Stack three 6x6 blocks into an 18x6 column.
fn stack3(top: &Matrix6<f64>, mid: &Matrix6<f64>, bot: &Matrix6<f64>) -> DMatrix<f64> {
    let mut out = DMatrix::<f64>::zeros(18, 6);
    out.view_mut((0, 0), (6, 6))
        .copy_from(&DMatrix::from_column_slice(6, 6, top.as_slice()));
    out.view_mut((6, 0), (6, 6))
        .copy_from(&DMatrix::from_column_slice(6, 6, mid.as_slice()));
    out.view_mut((12, 0), (6, 6))
        .copy_from(&DMatrix::from_column_slice(6, 6, bot.as_slice()));
    out
}

impl CostTerm for GpPriorFactor {
    fn keys(&self) -> Vec<VarKey> {
        vec![
            self.k1.pose,
            self.k1.velocity,
            self.k1.acceleration,
            self.k2.pose,
            self.k2.velocity,
            self.k2.acceleration,
        ]
    }

    fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
        let t1 = states.pose(self.k1.pose);
        let w1 = states.vector(self.k1.velocity);
        let dw1 = states.vector(self.k1.acceleration);
        let t2 = states.pose(self.k2.pose);
        let w2 = states.vector(self.k2.velocity);
        let dw2 = states.vector(self.k2.acceleration);

        let t21 = t2.compose(&t1.inverse());
        let xi21 = t21.log();
        let j21_inv = left_jacobian_inv(&xi21);
        let ad21 = t21.adjoint();
        let g2v = j21_inv * w2;
        let g2a = -0.5 * curlyhat(&g2v) * w2 + j21_inv * dw2;

        let phi = &self.phi;
        let e0 = phi[0][1].component_mul(&w1) + phi[0][2].component_mul(&dw1) - xi21;
        let e1 = phi[1][1].component_mul(&w1) + phi[1][2].component_mul(&dw1) - g2v;
        let e2 = phi[2][1].component_mul(&w1) + phi[2][2].component_mul(&dw1) - g2a;
        let mut residual = DVector::<f64>::zeros(18);
        residual.fixed_rows_mut::<6>(0).copy_from(&e0);
        residual.fixed_rows_mut::<6>(6).copy_from(&e1);
        residual.fixed_rows_mut::<6>(12).copy_from(&e2);

        // Sensitivity of the knot-2 local coordinates to xi21, first order.
        let d_g2v_xi = 0.5 * curlyhat(&w2);
        let d_g2a_xi = 0.5 * curlyhat(&dw2) + 0.25 * curlyhat(&w2) * curlyhat(&w2);
        let d_g2a_w2 = 0.5 * curlyhat(&w2) * j21_inv - 0.5 * curlyhat(&g2v);
        let gamma2_sens = stack3(&Matrix6::identity(), &d_g2v_xi, &d_g2a_xi);

        let zero = Matrix6::zeros();
        let jac_t1 = &gamma2_sens * DMatrix::from_column_slice(6, 6, (j21_inv * ad21).as_slice());
        let jac_w1 = stack3(
            &Matrix6::from_diagonal(&phi[0][1]),
            &Matrix6::from_diagonal(&phi[1][1]),
            &Matrix6::from_diagonal(&phi[2][1]),
        );
        let jac_dw1 = stack3(
            &Matrix6::from_diagonal(&phi[0][2]),
            &Matrix6::from_diagonal(&phi[1][2]),
            &Matrix6::from_diagonal(&phi[2][2]),
        );
        let jac_t2 = -(&gamma2_sens * DMatrix::from_column_slice(6, 6, j21_inv.as_slice()));
        let jac_w2 = -stack3(&zero, &j21_inv, &d_g2a_w2);
        let jac_dw2 = -stack3(&zero, &zero, &j21_inv);

        Ok(LinearizedTerm::assemble(
            self.keys(),
            vec![jac_t1, jac_w1, jac_dw1, jac_t2, jac_w2, jac_dw2],
            residual,
            &self.noise,
            RobustLoss::L2,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::SE3;
    use crate::trajectory::gp::{noise_matrix, transition_blocks};

    fn wnoj_factor(states: &mut StateVector, dt: f64, w: Vector6<f64>) -> GpPriorFactor {
        let t1 = SE3::identity();
        let t2 = SE3::exp(&(dt * w));
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
        let ad = Vector6::zeros();
        let qc = Vector6::repeat(1.0);
        GpPriorFactor::new(
            k1,
            k2,
            transition_blocks(dt, &ad),
            noise_matrix(dt, &ad, &qc),
        )
        .unwrap()
    }

    #[test]
    fn constant_velocity_pair_has_zero_residual() {
        let mut states = StateVector::new();
        let factor = wnoj_factor(
            &mut states,
            0.5,
            Vector6::new(1.0, -0.5, 0.2, 0.0, 0.0, 0.1),
        );
        let lin = factor.linearize(&states).unwrap();
        assert!(lin.residual.norm() < 1e-9, "residual {}", lin.residual.norm());
    }

    #[test]
    fn velocity_mismatch_is_penalized() {
        let mut states = StateVector::new();
        let w = Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let factor = wnoj_factor(&mut states, 0.5, w);
        // Corrupt the second knot's velocity.
        states.set_vector(3 + 1, w + Vector6::repeat(0.2));
        let lin = factor.linearize(&states).unwrap();
        assert!(lin.residual.norm() > 1e-2);
    }
}
