//! Point-to-plane registration factor.
//!
//! Residual `e = p_ref - T_ms(tau) * p_raw` with the plane constraint encoded
//! in an information-form noise model `(w n)(w n)^T + eps I`: deviations off
//! the plane normal are weighted by the planarity, deviations along the plane
//! only by the stabilizing epsilon.

use nalgebra::{DMatrix, DVector, Matrix3x6, Vector3};

use crate::core::math::so3;
use crate::core::math::SE3;
use crate::error::Result;
use crate::estimation::loss::RobustLoss;
use crate::estimation::problem::{CostTerm, LinearizedTerm, NoiseModel};
use crate::estimation::state::{StateVector, VarKey};
use crate::trajectory::PoseInterpolator;

/// Stabilizer added to the plane information matrix.
const PLANE_INFO_EPSILON: f64 = 1e-5;

/// One keypoint-to-plane constraint at the keypoint's acquisition time.
pub struct PointPlaneFactor {
    pose: PoseInterpolator,
    /// Raw keypoint premapped into the robot frame (`T_sr^-1 * raw`).
    raw_in_robot: Vector3<f64>,
    /// Anchor point of the fitted plane, world frame.
    reference: Vector3<f64>,
    noise: NoiseModel,
    loss: RobustLoss,
}

impl PointPlaneFactor {
    /// Build the factor from a fitted plane.
    ///
    /// `weight` is the planarity weight applied to the normal; `raw` is the
    /// keypoint in the sensor frame and `t_sr` the fixed sensor-to-robot
    /// extrinsic.
    pub fn new(
        pose: PoseInterpolator,
        raw: &Vector3<f64>,
        reference: Vector3<f64>,
        normal: &Vector3<f64>,
        weight: f64,
        t_sr: &SE3,
        loss: RobustLoss,
    ) -> Result<Self> {
        let weighted = weight * normal;
        let info =
            weighted * weighted.transpose() + PLANE_INFO_EPSILON * nalgebra::Matrix3::identity();
        Ok(Self {
            pose,
            raw_in_robot: t_sr.inverse().transform(raw),
            reference,
            noise: NoiseModel::from_information(DMatrix::from_column_slice(
                3,
                3,
                info.as_slice(),
            ))?,
            loss,
        })
    }
}

impl CostTerm for PointPlaneFactor {
    fn keys(&self) -> Vec<VarKey> {
        self.pose.keys()
    }

    fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
        let t_rm = self.pose.value(states);
        let t_mr = t_rm.inverse();
        // T_ms * raw = T_rm^-1 * (T_sr^-1 * raw).
        let world = t_mr.transform(&self.raw_in_robot);
        let error = self.reference - world;

        // Left-perturbing T_rm by [rho, phi] moves the world point by
        // -R_mr (rho + phi x z) with z the robot-frame point, so the residual
        // gains +R_mr [I | -skew(z)].
        let mut sens = Matrix3x6::<f64>::zeros();
        sens.fixed_view_mut::<3, 3>(0, 0).copy_from(&t_mr.rotation);
        sens.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(-t_mr.rotation * so3::skew(&self.raw_in_robot)));
        let sens = DMatrix::from_column_slice(3, 6, sens.as_slice());

        let mut keys = Vec::new();
        let mut jacobians = Vec::new();
        for (key, jac) in self.pose.jacobians(states) {
            keys.push(key);
            jacobians.push(&sens * DMatrix::from_column_slice(6, 6, jac.as_slice()));
        }

        Ok(LinearizedTerm::assemble(
            keys,
            jacobians,
            DVector::from_column_slice(error.as_slice()),
            &self.noise,
            self.loss,
        ))
    }
}
