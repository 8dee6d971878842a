//! Measurement and prior factors over the trajectory state.

mod imu;
mod point_plane;
mod pose_meas;
mod prior;

pub use imu::{AccelFactor, GyroFactor};
pub use point_plane::PointPlaneFactor;
pub use pose_meas::PoseMeasurementFactor;
pub use prior::{Se3PriorFactor, Se3RelativeFactor, VectorDifferenceFactor, VectorPriorFactor};
