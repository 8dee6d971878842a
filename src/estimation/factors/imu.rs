//! Inertial measurement factors at exact sample times.
//!
//! Both residuals are written in terms of the stored body-centric twist
//! convention (map with respect to robot, expressed in the robot frame): the
//! gyroscope measures the negated angular twist and the accelerometer the
//! negated linear twist rate plus gravity, so the measured quantities enter
//! with a positive sign against the interpolated state.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use crate::core::math::so3;
use crate::error::Result;
use crate::estimation::loss::RobustLoss;
use crate::estimation::problem::{CostTerm, LinearizedTerm, NoiseModel};
use crate::estimation::state::{StateVector, VarKey};
use crate::trajectory::{AccelerationInterpolator, PoseInterpolator, VelocityInterpolator};

/// Merge per-variable 3x6 blocks, summing duplicates while keeping first-seen
/// order.
fn merge_blocks(blocks: Vec<(VarKey, DMatrix<f64>)>) -> (Vec<VarKey>, Vec<DMatrix<f64>>) {
    let mut keys: Vec<VarKey> = Vec::new();
    let mut jacs: Vec<DMatrix<f64>> = Vec::new();
    for (key, block) in blocks {
        if let Some(pos) = keys.iter().position(|&k| k == key) {
            jacs[pos] += block;
        } else {
            keys.push(key);
            jacs.push(block);
        }
    }
    (keys, jacs)
}

/// Gyroscope residual `e = meas - b_gyro + w_ang(tau)`.
pub struct GyroFactor {
    velocity: VelocityInterpolator,
    bias: VarKey,
    measurement: Vector3<f64>,
    noise: NoiseModel,
    loss: RobustLoss,
}

impl GyroFactor {
    /// Factor with diagonal measurement covariance `r_ang`.
    pub fn new(
        velocity: VelocityInterpolator,
        bias: VarKey,
        measurement: Vector3<f64>,
        r_ang: &Vector3<f64>,
        loss: RobustLoss,
    ) -> Result<Self> {
        Ok(Self {
            velocity,
            bias,
            measurement,
            noise: NoiseModel::from_diagonal_covariance(r_ang.as_slice())?,
            loss,
        })
    }
}

impl CostTerm for GyroFactor {
    fn keys(&self) -> Vec<VarKey> {
        let mut keys = self.velocity.keys();
        keys.push(self.bias);
        keys
    }

    fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
        let w = self.velocity.value(states);
        let bias = states.vector(self.bias);
        let error = self.measurement - bias.fixed_rows::<3>(3) + w.fixed_rows::<3>(3);

        let mut blocks: Vec<(VarKey, DMatrix<f64>)> = Vec::new();
        for (key, jac) in self.velocity.jacobians(states) {
            // Only the angular rows of the velocity enter.
            let rows = jac.fixed_view::<3, 6>(3, 0).into_owned();
            blocks.push((key, DMatrix::from_column_slice(3, 6, rows.as_slice())));
        }
        // d e / d bias: -I on the gyro block.
        let mut bias_block = DMatrix::<f64>::zeros(3, 6);
        bias_block
            .view_mut((0, 3), (3, 3))
            .copy_from(&(-Matrix3::identity()));
        blocks.push((self.bias, bias_block));

        let (keys, jacobians) = merge_blocks(blocks);
        Ok(LinearizedTerm::assemble(
            keys,
            jacobians,
            DVector::from_column_slice(error.as_slice()),
            &self.noise,
            self.loss,
        ))
    }
}

/// Accelerometer residual
/// `e = meas - b_acc + dw_lin(tau) + R_rm(tau) R_mi g`.
pub struct AccelFactor {
    pose: PoseInterpolator,
    acceleration: AccelerationInterpolator,
    bias: VarKey,
    t_mi: VarKey,
    measurement: Vector3<f64>,
    gravity: Vector3<f64>,
    noise: NoiseModel,
    loss: RobustLoss,
}

impl AccelFactor {
    /// Factor with diagonal measurement covariance `r_acc` and scalar gravity
    /// magnitude along the inertial z axis.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pose: PoseInterpolator,
        acceleration: AccelerationInterpolator,
        bias: VarKey,
        t_mi: VarKey,
        measurement: Vector3<f64>,
        gravity: f64,
        r_acc: &Vector3<f64>,
        loss: RobustLoss,
    ) -> Result<Self> {
        Ok(Self {
            pose,
            acceleration,
            bias,
            t_mi,
            measurement,
            gravity: Vector3::new(0.0, 0.0, gravity),
            noise: NoiseModel::from_diagonal_covariance(r_acc.as_slice())?,
            loss,
        })
    }
}

impl CostTerm for AccelFactor {
    fn keys(&self) -> Vec<VarKey> {
        let mut keys = self.pose.keys();
        for k in self.acceleration.keys() {
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        keys.push(self.bias);
        keys.push(self.t_mi);
        keys
    }

    fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
        let t_rm = self.pose.value(states);
        let dw = self.acceleration.value(states);
        let bias = states.vector(self.bias);
        let r_mi = states.pose(self.t_mi).rotation;

        let g_m = r_mi * self.gravity;
        let g_r = t_rm.rotation * g_m;
        let error = self.measurement - bias.fixed_rows::<3>(0) + dw.fixed_rows::<3>(0) + g_r;

        let mut blocks: Vec<(VarKey, DMatrix<f64>)> = Vec::new();

        // Linear rows of the acceleration interpolator.
        for (key, jac) in self.acceleration.jacobians(states) {
            let rows = jac.fixed_view::<3, 6>(0, 0).into_owned();
            blocks.push((key, DMatrix::from_column_slice(3, 6, rows.as_slice())));
        }
        // Gravity rotated through the interpolated pose: left-perturbing
        // T_rm by [rho, phi] moves R_rm g_m by phi x (R_rm g_m).
        let mut grav_sens = DMatrix::<f64>::zeros(3, 6);
        grav_sens
            .view_mut((0, 3), (3, 3))
            .copy_from(&(-so3::skew(&g_r)));
        for (key, jac) in self.pose.jacobians(states) {
            let block = &grav_sens * DMatrix::from_column_slice(6, 6, jac.as_slice());
            blocks.push((key, block));
        }
        // Bias: -I on the accelerometer block.
        let mut bias_block = DMatrix::<f64>::zeros(3, 6);
        bias_block
            .view_mut((0, 0), (3, 3))
            .copy_from(&(-Matrix3::identity()));
        blocks.push((self.bias, bias_block));
        // Gravity alignment: only its rotation matters.
        if !states.is_locked(self.t_mi) {
            let mut mi_block = DMatrix::<f64>::zeros(3, 6);
            mi_block
                .view_mut((0, 3), (3, 3))
                .copy_from(&(-(t_rm.rotation * so3::skew(&g_m))));
            blocks.push((self.t_mi, mi_block));
        }

        let (keys, jacobians) = merge_blocks(blocks);
        Ok(LinearizedTerm::assemble(
            keys,
            jacobians,
            DVector::from_column_slice(error.as_slice()),
            &self.noise,
            self.loss,
        ))
    }
}
