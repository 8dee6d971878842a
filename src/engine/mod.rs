//! Orchestration layer: the odometry engine and its configuration.

pub mod config;
mod odometry;

pub use config::{OdometryConfig, P2pLossFunc};
pub use odometry::{FrameInput, Odometry, RegistrationSummary};
