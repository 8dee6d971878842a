//! End-to-end registration scenarios against the synthetic box room.

mod common;

use common::{frame_input, make_scan, room_cloud, test_config, yaw_pose};
use gati_lio::{Odometry, Point3D, Voxel, SE3};
use nalgebra::{Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

use approx::assert_relative_eq;

#[test]
fn single_stationary_frame_seeds_the_map() {
    let mut config = test_config();
    config.size_voxel_map = 1.0;
    config.max_num_points_in_voxel = 20;
    config.min_distance_points = 0.1;
    let mut odometry = Odometry::new(config).unwrap();

    // 1000 uniform samples in [-5, 5]^3 from a stationary sensor at the
    // origin.
    let mut rng = StdRng::seed_from_u64(42);
    let points: Vec<Point3D> = (0..1000)
        .map(|i| {
            let p = Vector3::new(
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
            );
            Point3D::new(p, i as f64 * 1e-4, i as f64 / 999.0)
        })
        .collect();

    let summary = odometry
        .register_frame(gati_lio::FrameInput {
            eval_time: 0.05,
            points,
            imu: Vec::new(),
            poses: Vec::new(),
        })
        .unwrap();

    assert!(summary.success);
    assert_relative_eq!(summary.r_ms, Matrix3::identity(), epsilon = 1e-9);
    assert!(summary.t_ms.norm() < 1e-6);

    // Every retained point landed in the map; the occupied voxel set matches
    // the retained points' keys exactly.
    let expected_keys: HashSet<Voxel> = summary
        .corrected_points
        .iter()
        .map(|p| Voxel::containing(&p.pt, 1.0))
        .collect();
    assert_eq!(odometry.map().num_voxels(), expected_keys.len());
    // The min-distance rule may drop a few near-duplicates, never the first
    // point of a voxel.
    assert!(odometry.map().size() <= summary.corrected_points.len());
    assert!(odometry.map().size() >= expected_keys.len());
}

#[test]
fn two_frames_recover_a_one_meter_translation() {
    let mut config = test_config();
    // The jump happens across an unobserved inter-scan gap; keep the motion
    // prior loose and the plane gate wide enough to capture the offset.
    config.qc_diag = [1e6; 6];
    config.p2p_max_dist = 2.0;
    let mut odometry = Odometry::new(config).unwrap();

    let world = room_cloud(5.0, 0.25);
    let still = |pose: SE3| move |_t: f64| pose;

    let scan0 = make_scan(&world, 0.0, 0.05, still(SE3::identity()));
    assert!(odometry
        .register_frame(frame_input(scan0, 0.0, 0.05))
        .unwrap()
        .success);

    let shifted = SE3::new(Matrix3::identity(), Vector3::new(1.0, 0.0, 0.0));
    let scan1 = make_scan(&world, 1.0, 1.05, still(shifted));
    let summary = odometry
        .register_frame(frame_input(scan1, 1.0, 1.05))
        .unwrap();

    assert!(summary.success);
    assert!(
        (summary.t_ms - Vector3::new(1.0, 0.0, 0.0)).norm() < 5e-3,
        "translation error {}",
        (summary.t_ms - Vector3::new(1.0, 0.0, 0.0)).norm()
    );
    assert!(
        gati_lio::so3::angular_distance_deg(&summary.r_ms, &Matrix3::identity()) < 0.1,
        "rotation error too large"
    );
}

#[test]
fn straight_line_motion_tracks_every_step() {
    let mut config = test_config();
    config.qc_diag = [1e6; 6];
    config.p2p_max_dist = 2.0;
    let mut odometry = Odometry::new(config).unwrap();

    let world = room_cloud(5.0, 0.25);
    let step = 0.2;
    for k in 0..5 {
        let t0 = k as f64 * 0.2;
        let t1 = t0 + 0.05;
        let pose = SE3::new(
            Matrix3::identity(),
            Vector3::new(k as f64 * step, 0.0, 0.0),
        );
        let scan = make_scan(&world, t0, t1, |_t| pose);
        let summary = odometry.register_frame(frame_input(scan, t0, t1)).unwrap();
        assert!(summary.success, "frame {k} failed");
        let expected = Vector3::new(k as f64 * step, 0.0, 0.0);
        let tolerance = if k <= 1 { 5e-3 } else { 1e-3 };
        assert!(
            (summary.t_ms - expected).norm() < tolerance,
            "frame {k}: error {}",
            (summary.t_ms - expected).norm()
        );
    }
}

#[test]
fn constant_yaw_rate_is_tracked_over_ten_frames() {
    let config = test_config();
    let mut odometry = Odometry::new(config).unwrap();

    let world = room_cloud(5.0, 0.25);
    let rate = 0.2;
    let mut last_summary = None;
    for k in 0..=10 {
        let t0 = k as f64 * 0.2;
        let t1 = t0 + 0.02;
        let scan = make_scan(&world, t0, t1, |t| yaw_pose(rate * t, Vector3::zeros()));
        let summary = odometry.register_frame(frame_input(scan, t0, t1)).unwrap();
        assert!(summary.success, "frame {k} failed");
        last_summary = Some(summary);
    }

    // Yaw at the end of frame 10 against truth.
    let summary = last_summary.unwrap();
    let t_end = 10.0 * 0.2 + 0.02;
    let truth = gati_lio::so3::exp(&Vector3::new(0.0, 0.0, rate * t_end));
    let yaw_error = gati_lio::so3::angular_distance_deg(&summary.r_ms, &truth);
    assert!(yaw_error < 0.5, "yaw error {yaw_error} deg");

    // The estimated body-frame angular rate: the stored twist is the
    // map-with-respect-to-robot convention, so a +0.2 rad/s platform yaw
    // appears as -0.2 on the angular z component.
    let frames = odometry.trajectory();
    let mid_w = frames[10].mid_w;
    assert!(
        (mid_w[5] + rate).abs() < 0.02 * rate,
        "angular rate estimate {} vs {}",
        mid_w[5],
        -rate
    );
}

#[test]
fn empty_input_is_a_soft_failure() {
    let mut odometry = Odometry::new(test_config()).unwrap();
    let summary = odometry
        .register_frame(gati_lio::FrameInput::default())
        .unwrap();
    assert!(!summary.success);
    assert!(odometry.trajectory().is_empty());
}

#[test]
fn frame_without_map_overlap_aborts_and_recovers() {
    let mut config = test_config();
    config.qc_diag = [1e6; 6];
    let mut odometry = Odometry::new(config).unwrap();

    let world = room_cloud(5.0, 0.25);
    let scan0 = make_scan(&world, 0.0, 0.05, |_t| SE3::identity());
    assert!(odometry
        .register_frame(frame_input(scan0, 0.0, 0.05))
        .unwrap()
        .success);

    // A scan of unrelated far-away geometry: association finds nothing.
    let far_world: Vec<Vector3<f64>> = room_cloud(5.0, 0.25)
        .into_iter()
        .map(|p| p + Vector3::new(500.0, 0.0, 0.0))
        .collect();
    let scan1 = make_scan(&far_world, 0.2, 0.25, |_t| SE3::identity());
    let summary = odometry
        .register_frame(frame_input(scan1, 0.2, 0.25))
        .unwrap();
    assert!(!summary.success);

    // The engine continues from the last committed state.
    let scan2 = make_scan(&world, 0.4, 0.45, |_t| SE3::identity());
    let summary = odometry
        .register_frame(frame_input(scan2, 0.4, 0.45))
        .unwrap();
    assert!(summary.success);
    assert!(summary.t_ms.norm() < 5e-3);
}
