//! Lie-group math shared by the map, trajectory, and estimation layers.

pub mod se3;
pub mod so3;

pub use se3::{curlyhat, left_jacobian, left_jacobian_inv, SE3};
pub use so3::{angular_distance_deg, reproject_rotation, skew};
