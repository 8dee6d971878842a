//! LIDAR point representation carried through the whole pipeline.

use nalgebra::Vector3;

/// A single LIDAR return.
///
/// `raw_pt` stays in the sensor frame for the lifetime of the point; `pt` is
/// the world-frame coordinate re-derived whenever the trajectory estimate
/// changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3D {
    /// Coordinate in the sensor frame at acquisition time.
    pub raw_pt: Vector3<f64>,
    /// Current world-frame coordinate.
    pub pt: Vector3<f64>,
    /// Absolute acquisition time in seconds.
    pub timestamp: f64,
    /// Acquisition time normalized to `[0, 1]` within its frame.
    pub alpha_timestamp: f64,
    /// Laser beam index.
    pub beam_id: i32,
    /// Auxiliary radial-velocity / intensity channel.
    pub radial_velocity: f64,
}

impl Point3D {
    /// A point with only the raw coordinate and timestamps set.
    pub fn new(raw_pt: Vector3<f64>, timestamp: f64, alpha_timestamp: f64) -> Self {
        Self {
            raw_pt,
            pt: raw_pt,
            timestamp,
            alpha_timestamp,
            beam_id: 0,
            radial_velocity: 0.0,
        }
    }
}
