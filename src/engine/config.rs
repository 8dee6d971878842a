//! Engine configuration.
//!
//! Plain-old-data options with serde support; validation happens once at
//! engine construction and malformed values are fatal.

use serde::{Deserialize, Serialize};

use nalgebra::{Matrix4, Vector3, Vector6};

use crate::core::math::{so3, SE3};
use crate::error::{OdometryError, Result};
use crate::estimation::RobustLoss;

/// Robust loss selector for the point-to-plane terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum P2pLossFunc {
    /// Plain least squares.
    L2,
    /// Dynamic covariance scaling.
    Dcs,
    /// Cauchy.
    Cauchy,
    /// Geman-McClure.
    Gm,
}

/// All recognized engine options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryConfig {
    /// Downsample grid applied to incoming scans.
    pub voxel_size: f64,
    /// Downsample grid during the initialization regime.
    pub init_voxel_size: f64,
    /// Keypoint selection grid.
    pub sample_voxel_size: f64,
    /// Keypoint selection grid during the initialization regime.
    pub init_sample_voxel_size: f64,
    /// Map voxel grid size.
    pub size_voxel_map: f64,
    /// Maximum stored points per map voxel.
    pub max_num_points_in_voxel: usize,
    /// Minimum spacing between stored points inside a voxel.
    pub min_distance_points: f64,
    /// Voxels farther than this from the sensor are evicted.
    pub max_distance: f64,
    /// Frame index below which the initialization regime applies (wider
    /// neighbor search, coarser grids).
    pub init_num_frames: usize,

    /// Minimum neighbors for a usable plane fit.
    pub min_number_neighbors: usize,
    /// Neighbor candidates gathered per keypoint.
    pub max_number_neighbors: usize,
    /// Point-to-plane acceptance gate, meters.
    pub p2p_max_dist: f64,
    /// Robust loss on point-to-plane terms.
    pub p2p_loss_func: P2pLossFunc,
    /// Scale parameter of the robust loss.
    pub p2p_loss_sigma: f64,
    /// Exponent on the planarity coefficient.
    pub power_planarity: f64,
    /// Minimum accepted residuals per frame; fewer aborts the frame.
    pub min_number_keypoints: usize,

    /// ICP outer iterations.
    pub num_iters_icp: usize,
    /// Gauss-Newton iterations per outer iteration.
    pub max_iterations: usize,
    /// Early-stop threshold on the summed begin/end rotation delta, degrees.
    pub threshold_orientation_norm: f64,
    /// Early-stop threshold on the summed begin/end translation delta,
    /// meters.
    pub threshold_translation_norm: f64,

    /// Additional knots between consecutive scan ends.
    pub num_extra_states: usize,
    /// Frames to wait before folding a scan into the map.
    pub delay_adding_points: usize,

    /// Motion-prior power spectral density diagonal.
    pub qc_diag: [f64; 6],
    /// Singer time-constant diagonal; zeros select the
    /// constant-acceleration prior.
    pub ad_diag: [f64; 6],

    /// Enable inertial factors.
    pub use_imu: bool,
    /// Emit accelerometer residuals alongside the gyro residuals.
    pub imu_use_accel: bool,
    /// Accelerometer noise diagonal.
    pub r_imu_acc: [f64; 3],
    /// Gyroscope noise diagonal.
    pub r_imu_ang: [f64; 3],
    /// Bias random-walk covariance (isotropic).
    pub q_imu: f64,
    /// Initial bias prior covariance (isotropic).
    pub p0_imu: f64,
    /// Gravity magnitude along the inertial z axis.
    pub gravity: f64,
    /// Gravity-alignment random-walk covariance diagonal.
    pub qg_diag: [f64; 6],
    /// Estimate the gravity alignment only while initializing, then freeze.
    pub t_mi_init_only: bool,
    /// Drive the gravity alignment from externally supplied ground truth and
    /// lock it (debug only).
    pub use_t_mi_gt: bool,

    /// Enable external pose-measurement factors.
    pub use_pose_meas: bool,
    /// Pose-measurement noise diagonal over the 6 twist components.
    pub r_pose: [f64; 6],

    /// Fixed sensor-to-robot extrinsic, row major.
    pub t_sr: [[f64; 4]; 4],

    /// Worker threads for the in-frame parallel sections.
    pub num_threads: usize,
    /// Per-sweep solver chatter.
    pub verbose: bool,
    /// Per-frame diagnostic logging.
    pub debug_print: bool,
    /// Directory receiving the shutdown trajectory dump.
    pub debug_path: String,
}

impl Default for OdometryConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.5,
            init_voxel_size: 0.2,
            sample_voxel_size: 1.5,
            init_sample_voxel_size: 1.0,
            size_voxel_map: 1.0,
            max_num_points_in_voxel: 20,
            min_distance_points: 0.1,
            max_distance: 100.0,
            init_num_frames: 20,
            min_number_neighbors: 20,
            max_number_neighbors: 20,
            p2p_max_dist: 0.5,
            p2p_loss_func: P2pLossFunc::Cauchy,
            p2p_loss_sigma: 1.0,
            power_planarity: 2.0,
            min_number_keypoints: 100,
            num_iters_icp: 5,
            max_iterations: 5,
            threshold_orientation_norm: 0.0001,
            threshold_translation_norm: 0.001,
            num_extra_states: 0,
            delay_adding_points: 4,
            qc_diag: [1.0; 6],
            ad_diag: [0.0; 6],
            use_imu: false,
            imu_use_accel: true,
            r_imu_acc: [0.1; 3],
            r_imu_ang: [0.01; 3],
            q_imu: 1e-5,
            p0_imu: 1e-3,
            gravity: -9.8042,
            qg_diag: [1e-6; 6],
            t_mi_init_only: false,
            use_t_mi_gt: false,
            use_pose_meas: false,
            r_pose: [1e-4; 6],
            t_sr: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
            num_threads: 4,
            verbose: false,
            debug_print: false,
            debug_path: ".".to_string(),
        }
    }
}

impl OdometryConfig {
    /// Check every option once; any violation is a fatal configuration
    /// fault.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("voxel_size", self.voxel_size),
            ("init_voxel_size", self.init_voxel_size),
            ("sample_voxel_size", self.sample_voxel_size),
            ("init_sample_voxel_size", self.init_sample_voxel_size),
            ("size_voxel_map", self.size_voxel_map),
            ("max_distance", self.max_distance),
            ("p2p_max_dist", self.p2p_max_dist),
            ("p2p_loss_sigma", self.p2p_loss_sigma),
            ("threshold_orientation_norm", self.threshold_orientation_norm),
            ("threshold_translation_norm", self.threshold_translation_norm),
            ("q_imu", self.q_imu),
            ("p0_imu", self.p0_imu),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(OdometryError::Config(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.min_distance_points < 0.0 {
            return Err(OdometryError::Config(
                "min_distance_points must be non-negative".into(),
            ));
        }
        if self.max_num_points_in_voxel == 0 {
            return Err(OdometryError::Config(
                "max_num_points_in_voxel must be at least 1".into(),
            ));
        }
        if self.num_iters_icp == 0 || self.max_iterations == 0 {
            return Err(OdometryError::Config(
                "iteration counts must be at least 1".into(),
            ));
        }
        if self.num_threads == 0 {
            return Err(OdometryError::Config(
                "num_threads must be at least 1".into(),
            ));
        }
        if self.min_number_neighbors == 0 || self.max_number_neighbors == 0 {
            return Err(OdometryError::Config(
                "neighbor gates must be at least 1".into(),
            ));
        }
        for (i, q) in self.qc_diag.iter().enumerate() {
            if !(q > &0.0) {
                return Err(OdometryError::Config(format!(
                    "qc_diag[{i}] must be positive"
                )));
            }
        }
        for (i, a) in self.ad_diag.iter().enumerate() {
            if a < &0.0 {
                return Err(OdometryError::Config(format!(
                    "ad_diag[{i}] must be non-negative"
                )));
            }
        }
        for (i, r) in self.r_imu_acc.iter().chain(self.r_imu_ang.iter()).enumerate() {
            if !(r > &0.0) {
                return Err(OdometryError::Config(format!(
                    "imu noise diagonal entry {i} must be positive"
                )));
            }
        }
        for (i, r) in self.r_pose.iter().chain(self.qg_diag.iter()).enumerate() {
            if !(r > &0.0) {
                return Err(OdometryError::Config(format!(
                    "noise diagonal entry {i} must be positive"
                )));
            }
        }

        let t_sr = self.sensor_to_robot();
        if so3::orthogonality_defect(&t_sr.rotation) > 1e-6 {
            return Err(OdometryError::Config(
                "t_sr rotation block is not orthonormal".into(),
            ));
        }
        let bottom = self.t_sr[3];
        if bottom != [0.0, 0.0, 0.0, 1.0] {
            return Err(OdometryError::Config(
                "t_sr bottom row must be [0, 0, 0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// The configured extrinsic as a transform.
    pub fn sensor_to_robot(&self) -> SE3 {
        let mut m = Matrix4::zeros();
        for r in 0..4 {
            for c in 0..4 {
                m[(r, c)] = self.t_sr[r][c];
            }
        }
        SE3::from_matrix(&m)
    }

    /// Robust loss instance for the point-to-plane terms.
    pub fn p2p_loss(&self) -> RobustLoss {
        match self.p2p_loss_func {
            P2pLossFunc::L2 => RobustLoss::L2,
            P2pLossFunc::Dcs => RobustLoss::Dcs(self.p2p_loss_sigma),
            P2pLossFunc::Cauchy => RobustLoss::Cauchy(self.p2p_loss_sigma),
            P2pLossFunc::Gm => RobustLoss::GemanMcClure(self.p2p_loss_sigma),
        }
    }

    /// Power-spectral-density diagonal as a vector.
    pub fn qc(&self) -> Vector6<f64> {
        Vector6::from_row_slice(&self.qc_diag)
    }

    /// Singer time-constant diagonal as a vector.
    pub fn alpha(&self) -> Vector6<f64> {
        Vector6::from_row_slice(&self.ad_diag)
    }

    /// Accelerometer noise diagonal as a vector.
    pub fn r_acc(&self) -> Vector3<f64> {
        Vector3::from_row_slice(&self.r_imu_acc)
    }

    /// Gyroscope noise diagonal as a vector.
    pub fn r_ang(&self) -> Vector3<f64> {
        Vector3::from_row_slice(&self.r_imu_ang)
    }

    /// Pose-measurement noise diagonal as a vector.
    pub fn r_pose_diag(&self) -> Vector6<f64> {
        Vector6::from_row_slice(&self.r_pose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(OdometryConfig::default().validate().is_ok());
    }

    #[test]
    fn non_positive_voxel_size_is_rejected() {
        let config = OdometryConfig {
            voxel_size: 0.0,
            ..OdometryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OdometryError::Config(_))
        ));
    }

    #[test]
    fn skewed_extrinsic_is_rejected() {
        let mut config = OdometryConfig::default();
        config.t_sr[0][0] = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loss_selector_carries_sigma() {
        let config = OdometryConfig {
            p2p_loss_func: P2pLossFunc::Gm,
            p2p_loss_sigma: 0.3,
            ..OdometryConfig::default()
        };
        assert_eq!(config.p2p_loss(), RobustLoss::GemanMcClure(0.3));
    }

    #[test]
    fn config_satisfies_serde_bounds() {
        fn assert_serde<T: serde::Serialize + for<'de> serde::Deserialize<'de>>() {}
        assert_serde::<OdometryConfig>();
    }
}
