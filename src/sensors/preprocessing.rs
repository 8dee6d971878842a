//! Scan preprocessing: voxel downsampling and initial world placement.
//!
//! Downsampling keeps one representative per occupied voxel. Callers that
//! want a random representative shuffle the scan first; the binning itself
//! always keeps the first point it sees per voxel, so results are identical
//! across runs for a fixed shuffle seed.

use nalgebra::{Rotation3, UnitQuaternion};
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::core::math::SE3;
use crate::core::types::Point3D;
use crate::map::Voxel;

use std::collections::HashSet;

/// Keep one point (the first seen) per occupied voxel, in place.
///
/// Input order is preserved, so the retained representative per voxel is
/// fully determined by the caller's shuffle.
pub fn sub_sample_frame(frame: &mut Vec<Point3D>, voxel_size: f64) {
    let mut seen: HashSet<Voxel> = HashSet::with_capacity(frame.len());
    frame.retain(|point| seen.insert(Voxel::containing(&point.raw_pt, voxel_size)));
}

/// Copying variant of [`sub_sample_frame`], used to pick ICP keypoints.
pub fn grid_sampling(frame: &[Point3D], voxel_size: f64) -> Vec<Point3D> {
    let mut keypoints = frame.to_vec();
    sub_sample_frame(&mut keypoints, voxel_size);
    keypoints
}

/// Deterministically shuffle a scan.
pub fn shuffle(frame: &mut [Point3D], seed: u64) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    frame.shuffle(&mut rng);
}

/// Seed world coordinates from a begin/end pose pair.
///
/// Each point gets `world = slerp(q_begin, q_end, alpha) * raw
/// + (1 - alpha) * t_begin + alpha * t_end`, the linear-in-time motion guess
/// that bootstraps ICP before the continuous-time estimate exists.
pub fn seed_world_points(frame: &mut [Point3D], begin_pose: &SE3, end_pose: &SE3) {
    let q_begin =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(begin_pose.rotation));
    let q_end =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(end_pose.rotation));

    for point in frame.iter_mut() {
        let alpha = point.alpha_timestamp;
        let rot = q_begin.slerp(&q_end, alpha).to_rotation_matrix();
        let t = (1.0 - alpha) * begin_pose.translation + alpha * end_pose.translation;
        point.pt = rot * point.raw_pt + t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};
    use std::collections::HashSet;

    fn scan(coords: &[[f64; 3]]) -> Vec<Point3D> {
        coords
            .iter()
            .map(|c| Point3D::new(Vector3::new(c[0], c[1], c[2]), 0.0, 0.0))
            .collect()
    }

    #[test]
    fn subsample_keeps_one_point_per_voxel() {
        let mut frame = scan(&[
            [0.1, 0.1, 0.1],
            [0.2, 0.3, 0.4],
            [1.5, 0.0, 0.0],
            [1.9, 0.0, 0.0],
            [-0.7, 0.0, 0.0],
        ]);
        let distinct: HashSet<_> = frame
            .iter()
            .map(|p| Voxel::containing(&p.raw_pt, 1.0))
            .collect();
        sub_sample_frame(&mut frame, 1.0);
        assert_eq!(frame.len(), distinct.len());
    }

    #[test]
    fn grid_sampling_leaves_input_untouched() {
        let frame = scan(&[[0.1, 0.1, 0.1], [0.2, 0.3, 0.4], [1.5, 0.0, 0.0]]);
        let keypoints = grid_sampling(&frame, 1.0);
        assert_eq!(frame.len(), 3);
        assert_eq!(keypoints.len(), 2);
    }

    #[test]
    fn shuffle_is_deterministic() {
        let mut a = scan(&(0..64).map(|i| [i as f64, 0.0, 0.0]).collect::<Vec<_>>());
        let mut b = a.clone();
        shuffle(&mut a, 7);
        shuffle(&mut b, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn seeding_interpolates_linearly_in_translation() {
        let begin = SE3::identity();
        let end = SE3::new(Matrix3::identity(), Vector3::new(2.0, 0.0, 0.0));
        let mut frame = vec![Point3D::new(Vector3::new(1.0, 1.0, 1.0), 0.5, 0.5)];
        seed_world_points(&mut frame, &begin, &end);
        assert_relative_eq!(frame[0].pt, Vector3::new(2.0, 1.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn seeding_slerps_rotation() {
        let begin = SE3::identity();
        let end = SE3::new(
            crate::core::math::so3::exp(&Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2)),
            Vector3::zeros(),
        );
        let mut frame = vec![Point3D::new(Vector3::new(1.0, 0.0, 0.0), 0.5, 0.5)];
        seed_world_points(&mut frame, &begin, &end);
        let quarter = std::f64::consts::FRAC_PI_4;
        assert_relative_eq!(
            frame[0].pt,
            Vector3::new(quarter.cos(), quarter.sin(), 0.0),
            epsilon = 1e-12
        );
    }
}
