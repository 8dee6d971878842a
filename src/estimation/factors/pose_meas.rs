//! External pose-measurement factor.

use nalgebra::{DMatrix, DVector, Vector6};

use crate::core::math::se3;
use crate::core::math::SE3;
use crate::error::Result;
use crate::estimation::loss::RobustLoss;
use crate::estimation::problem::{CostTerm, LinearizedTerm, NoiseModel};
use crate::estimation::state::{StateVector, VarKey};
use crate::trajectory::PoseInterpolator;

/// Ties the interpolated trajectory pose to a measured world-to-robot
/// transform: `e = log(T_meas * T_rm(tau)^-1)`.
pub struct PoseMeasurementFactor {
    pose: PoseInterpolator,
    measured: SE3,
    noise: NoiseModel,
}

impl PoseMeasurementFactor {
    /// Factor with diagonal covariance `r_pose` over the 6 twist components.
    pub fn new(pose: PoseInterpolator, measured: SE3, r_pose: &Vector6<f64>) -> Result<Self> {
        Ok(Self {
            pose,
            measured,
            noise: NoiseModel::from_diagonal_covariance(r_pose.as_slice())?,
        })
    }
}

impl CostTerm for PoseMeasurementFactor {
    fn keys(&self) -> Vec<VarKey> {
        self.pose.keys()
    }

    fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
        let t_rm = self.pose.value(states);
        let relative = self.measured.compose(&t_rm.inverse());
        let error = relative.log();
        // Left-perturbing T_rm: e <- log(relative * exp(-delta)), so the
        // sensitivity is the negated right-Jacobian inverse of the error.
        let sens = -(se3::left_jacobian_inv(&error) * relative.adjoint());

        let mut keys = Vec::new();
        let mut jacobians = Vec::new();
        for (key, jac) in self.pose.jacobians(states) {
            keys.push(key);
            jacobians.push(
                DMatrix::from_column_slice(6, 6, sens.as_slice())
                    * DMatrix::from_column_slice(6, 6, jac.as_slice()),
            );
        }

        Ok(LinearizedTerm::assemble(
            keys,
            jacobians,
            DVector::from_column_slice(error.as_slice()),
            &self.noise,
            RobustLoss::L2,
        ))
    }
}
