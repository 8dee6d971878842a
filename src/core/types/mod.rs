//! Foundation types shared across the engine.

mod frame;
mod imu;
mod point;

pub use frame::{FramePhase, FrameState};
pub use imu::{ImuData, PoseData};
pub use point::Point3D;
