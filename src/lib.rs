//! GatiLIO - continuous-time LIDAR-inertial odometry
//!
//! # Architecture
//!
//! The crate is organized into 6 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      io/                            │  ← Output infrastructure
//! │               (trajectory dump)                     │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                    engine/                          │  ← Orchestration
//! │          (odometry pipeline, configuration)         │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │          trajectory/        estimation/             │  ← Continuous-time state
//! │   (GP motion prior,      (factor graph, solver,     │    and inference
//! │    interpolation)         sliding window)           │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │              map/           sensors/                │  ← Spatial index and
//! │      (voxel map, planes)  (preprocessing)           │    scan processing
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │              (Lie groups, types)                    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Pipeline
//!
//! Each incoming scan travels through: voxel downsampling → initial world
//! placement from a constant-twist motion guess → ICP outer loop (parallel
//! keypoint transform, parallel plane association, Gauss-Newton over a
//! sliding-window snapshot) → end-of-frame window solve with marginalization
//! → map update with a delayed, trajectory-de-skewed frame.
//!
//! The trajectory is continuous in time: knot states carry pose, body
//! velocity, and body acceleration under a white-noise-on-jerk or Singer
//! motion prior, and every measurement is applied at its exact acquisition
//! time through closed-form Gaussian-process interpolation.

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Fault taxonomy
// ============================================================================
pub mod error;

// ============================================================================
// Layer 3: Scan processing and the spatial index
// ============================================================================
pub mod map;
pub mod sensors;

// ============================================================================
// Layer 4: Inference (factor graph, solver, continuous-time trajectory)
// ============================================================================
pub mod estimation;
pub mod trajectory;

// ============================================================================
// Layer 5: Orchestration
// ============================================================================
pub mod engine;

// ============================================================================
// Layer 6: Output infrastructure
// ============================================================================
pub mod io;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

// Core types
pub use crate::core::math::{se3, so3, SE3};
pub use crate::core::types::{FramePhase, FrameState, ImuData, Point3D, PoseData};

// Errors
pub use error::{OdometryError, Result};

// Map
pub use map::{Neighborhood, Voxel, VoxelMap};

// Preprocessing
pub use sensors::preprocessing::{grid_sampling, sub_sample_frame};

// Estimation
pub use estimation::{
    Covariance, GaussNewtonParams, RobustLoss, SlidingWindowFilter, StateVector,
};

// Trajectory
pub use trajectory::{
    AccelerationInterpolator, Knot, PoseInterpolator, Trajectory, VelocityInterpolator,
};

// Engine
pub use engine::{FrameInput, Odometry, OdometryConfig, P2pLossFunc, RegistrationSummary};

// IO
pub use io::write_trajectory;
