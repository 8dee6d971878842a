//! Shared synthetic-world builders for the end-to-end scenarios.
//!
//! Scans are generated against a closed box room whose walls provide planar
//! structure in every direction. Each scan has a short duration with
//! per-point timestamps spread linearly across it; motion between scans (or
//! during them) is injected through a caller-supplied pose function.

use gati_lio::{FrameInput, OdometryConfig, P2pLossFunc, Point3D, SE3};
use nalgebra::Vector3;

/// Points on the six faces of the cube `[-half, half]^3`, gridded at `step`.
pub fn room_cloud(half: f64, step: f64) -> Vec<Vector3<f64>> {
    let mut points = Vec::new();
    let n = (2.0 * half / step).round() as i32;
    for i in 0..=n {
        for j in 0..=n {
            let a = -half + i as f64 * step;
            let b = -half + j as f64 * step;
            points.push(Vector3::new(a, b, -half));
            points.push(Vector3::new(a, b, half));
            points.push(Vector3::new(a, -half, b));
            points.push(Vector3::new(a, half, b));
            points.push(Vector3::new(-half, a, b));
            points.push(Vector3::new(half, a, b));
        }
    }
    points
}

/// Build a scan of `world` over `[t0, t1]`, observed from the continuous
/// sensor pose `pose_at(t)` (sensor-to-world).
pub fn make_scan(
    world: &[Vector3<f64>],
    t0: f64,
    t1: f64,
    pose_at: impl Fn(f64) -> SE3,
) -> Vec<Point3D> {
    let n = world.len();
    world
        .iter()
        .enumerate()
        .map(|(i, w)| {
            let alpha = i as f64 / (n - 1) as f64;
            let t = t0 + alpha * (t1 - t0);
            let raw = pose_at(t).inverse().transform(w);
            Point3D::new(raw, t, alpha)
        })
        .collect()
}

/// Wrap a scan into a frame input evaluated at the scan midpoint.
pub fn frame_input(points: Vec<Point3D>, t0: f64, t1: f64) -> FrameInput {
    FrameInput {
        eval_time: 0.5 * (t0 + t1),
        points,
        imu: Vec::new(),
        poses: Vec::new(),
    }
}

/// Baseline configuration for the scenario tests: identity extrinsic, two
/// worker threads, and gates compatible with the synthetic room.
pub fn test_config() -> OdometryConfig {
    OdometryConfig {
        num_threads: 2,
        p2p_loss_func: P2pLossFunc::L2,
        ..OdometryConfig::default()
    }
}

/// Rotation about z by `yaw` radians.
pub fn yaw_pose(yaw: f64, translation: Vector3<f64>) -> SE3 {
    SE3::new(
        gati_lio::so3::exp(&Vector3::new(0.0, 0.0, yaw)),
        translation,
    )
}
