//! Per-scan frame state tracked by the odometry engine.

use nalgebra::{Matrix3, SMatrix, Vector3, Vector6};

use crate::core::math::SE3;
use crate::core::types::Point3D;

/// Lifecycle phase of a frame.
///
/// A frame moves strictly forward through these phases; the transition into
/// `SwfSolved` requires the minimum-keypoint check to pass, and
/// `Marginalized` is entered when the frame's knots leave the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// Raw points received.
    Ingress,
    /// Voxel downsampling applied.
    Downsampled,
    /// Motion guess and initial world placement seeded.
    Initialized,
    /// ICP outer loop running.
    IcpIterating,
    /// Final sliding-window solve finished.
    SwfSolved,
    /// Pose committed and map updated.
    Committed,
    /// State variables rolled into the marginal prior.
    Marginalized,
}

/// Estimated state of one scan.
///
/// Created on frame ingress, refined during its own ICP iterations and by
/// later frames' window solves, then frozen once marginalized. `points` holds
/// the downsampled scan until it is folded into the map.
#[derive(Debug, Clone)]
pub struct FrameState {
    /// Timestamp of the earliest point.
    pub begin_timestamp: f64,
    /// Timestamp of the latest point.
    pub end_timestamp: f64,
    /// Stamp at which the trajectory is compared against references.
    pub eval_timestamp: f64,

    /// Sensor-to-world rotation at `begin_timestamp`.
    pub begin_r: Matrix3<f64>,
    /// Sensor-to-world translation at `begin_timestamp`.
    pub begin_t: Vector3<f64>,
    /// Sensor-to-world rotation at `end_timestamp`.
    pub end_r: Matrix3<f64>,
    /// Sensor-to-world translation at `end_timestamp`.
    pub end_t: Vector3<f64>,
    /// Sensor-to-world pose at `eval_timestamp`.
    pub mid_pose: SE3,

    /// Body-centric velocity at `eval_timestamp`.
    pub mid_w: Vector6<f64>,
    /// Body-centric acceleration at `eval_timestamp`.
    pub mid_dw: Vector6<f64>,
    /// IMU bias estimate at `eval_timestamp` (accelerometer then gyro).
    pub mid_b: Vector6<f64>,
    /// Gravity-alignment correction at `eval_timestamp`.
    pub mid_t_mi: SE3,
    /// 18x18 covariance of (pose, velocity, acceleration) at `eval_timestamp`.
    pub mid_state_cov: SMatrix<f64, 18, 18>,

    /// Downsampled points, cleared after the map update.
    pub points: Vec<Point3D>,
    /// Lifecycle phase.
    pub phase: FramePhase,
}

impl FrameState {
    /// Empty frame in the `Ingress` phase.
    pub fn new() -> Self {
        Self {
            begin_timestamp: 0.0,
            end_timestamp: 0.0,
            eval_timestamp: 0.0,
            begin_r: Matrix3::identity(),
            begin_t: Vector3::zeros(),
            end_r: Matrix3::identity(),
            end_t: Vector3::zeros(),
            mid_pose: SE3::identity(),
            mid_w: Vector6::zeros(),
            mid_dw: Vector6::zeros(),
            mid_b: Vector6::zeros(),
            mid_t_mi: SE3::identity(),
            mid_state_cov: SMatrix::zeros(),
            points: Vec::new(),
            phase: FramePhase::Ingress,
        }
    }

    /// Sensor-to-world pose at the frame end.
    pub fn end_pose(&self) -> SE3 {
        SE3::new(self.end_r, self.end_t)
    }

    /// Sensor-to-world pose at the frame begin.
    pub fn begin_pose(&self) -> SE3 {
        SE3::new(self.begin_r, self.begin_t)
    }
}

impl Default for FrameState {
    fn default() -> Self {
        Self::new()
    }
}
