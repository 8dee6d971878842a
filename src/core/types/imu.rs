//! Inertial and pose measurement types.

use nalgebra::Vector3;

use crate::core::math::SE3;

/// One accelerometer + gyroscope sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuData {
    /// Sample time in seconds.
    pub timestamp: f64,
    /// Specific force in the body frame, m/s^2.
    pub lin_acc: Vector3<f64>,
    /// Angular rate in the body frame, rad/s.
    pub ang_vel: Vector3<f64>,
}

/// An external pose measurement (e.g. from a reference localizer).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseData {
    /// Measurement time in seconds.
    pub timestamp: f64,
    /// Measured world-to-robot transform.
    pub pose: SE3,
}
