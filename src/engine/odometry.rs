//! The odometry orchestrator: per-frame state allocation, ICP outer loop,
//! sliding-window solve, and map maintenance.

use std::sync::Arc;

use log::{debug, error, info};
use nalgebra::{Matrix3, Matrix6, SMatrix, Vector3, Vector6};
use rayon::prelude::*;

use crate::core::math::{so3, SE3};
use crate::core::types::{FramePhase, FrameState, ImuData, Point3D, PoseData};
use crate::engine::config::OdometryConfig;
use crate::error::{OdometryError, Result};
use crate::estimation::factors::{
    AccelFactor, GyroFactor, PointPlaneFactor, PoseMeasurementFactor, Se3PriorFactor,
    Se3RelativeFactor, VectorDifferenceFactor, VectorPriorFactor,
};
use crate::estimation::{
    gauss_newton, CostCollector, CostTerm, Covariance, GaussNewtonParams, RobustLoss,
    SlidingWindowFilter, StateVector, VarKey,
};
use crate::map::{Neighborhood, VoxelMap};
use crate::sensors::preprocessing;
use crate::trajectory::{PoseInterpolator, Trajectory};

/// One incoming sensor bundle.
#[derive(Debug, Clone, Default)]
pub struct FrameInput {
    /// Stamp at which the estimate is reported (lies within the point span).
    pub eval_time: f64,
    /// De-skewed points with per-point timestamps.
    pub points: Vec<Point3D>,
    /// Inertial samples covering the scan interval.
    pub imu: Vec<ImuData>,
    /// Optional external pose measurements.
    pub poses: Vec<PoseData>,
}

/// Per-frame registration outcome.
#[derive(Debug, Clone)]
pub struct RegistrationSummary {
    /// False when the frame was aborted (insufficient keypoints); the map and
    /// committed trajectory are untouched in that case.
    pub success: bool,
    /// Downsampled keypoints with their final world coordinates
    /// (diagnostic).
    pub keypoints: Vec<Point3D>,
    /// The frame's retained points in world coordinates.
    pub corrected_points: Vec<Point3D>,
    /// End-of-frame sensor-to-world rotation.
    pub r_ms: Matrix3<f64>,
    /// End-of-frame sensor-to-world translation.
    pub t_ms: Vector3<f64>,
}

impl Default for RegistrationSummary {
    fn default() -> Self {
        Self {
            success: false,
            keypoints: Vec::new(),
            corrected_points: Vec::new(),
            r_ms: Matrix3::identity(),
            t_ms: Vector3::zeros(),
        }
    }
}

/// Persistent record of one trajectory knot's variables.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KnotVar {
    pub time: f64,
    pub pose: VarKey,
    pub velocity: VarKey,
    pub acceleration: VarKey,
    pub bias: VarKey,
    pub t_mi: VarKey,
}

/// Gauss-Newton iteration cap of the end-of-frame window solve.
const WINDOW_SOLVE_ITERATIONS: usize = 20;
/// Hard bound on active variable groups in the window.
const MAX_VARIABLE_GROUPS: usize = 100;
/// Hard bound on live cost terms in the window.
const MAX_COST_TERMS: usize = 100_000;
/// Timestamp comparison slack, seconds.
const TIME_EPSILON: f64 = 1e-9;
/// Neighborhoods with planarity below this carry no usable plane constraint
/// and are rejected outright.
const MIN_PLANARITY: f64 = 0.5;

/// Continuous-time LIDAR-inertial odometry engine.
pub struct Odometry {
    config: OdometryConfig,
    t_sr: SE3,
    t_rs: SE3,
    states: StateVector,
    vars: Vec<KnotVar>,
    frames: Vec<FrameState>,
    map: VoxelMap,
    filter: SlidingWindowFilter,
    /// Index into `vars` of the first knot still awaiting marginalization.
    to_marginalize: usize,
    pool: rayon::ThreadPool,
    /// Externally supplied gravity-alignment rotations, one per frame
    /// (debug mode, `use_t_mi_gt`).
    t_mi_ground_truth: Vec<SE3>,
}

impl Odometry {
    /// Validate the configuration and set up the engine.
    pub fn new(config: OdometryConfig) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build()
            .map_err(|e| OdometryError::Config(format!("thread pool: {e}")))?;
        let t_sr = config.sensor_to_robot();
        Ok(Self {
            t_rs: t_sr.inverse(),
            t_sr,
            config,
            states: StateVector::new(),
            vars: Vec::new(),
            frames: Vec::new(),
            map: VoxelMap::new(),
            filter: SlidingWindowFilter::new(),
            to_marginalize: 0,
            pool,
            t_mi_ground_truth: Vec::new(),
        })
    }

    /// Estimated frames so far.
    pub fn trajectory(&self) -> &[FrameState] {
        &self.frames
    }

    /// The accumulated map.
    pub fn map(&self) -> &VoxelMap {
        &self.map
    }

    /// The sliding-window filter (active window inspection).
    pub fn filter(&self) -> &SlidingWindowFilter {
        &self.filter
    }

    /// Supply per-frame gravity-alignment ground truth for the
    /// `use_t_mi_gt` debug mode.
    pub fn set_t_mi_ground_truth(&mut self, rotations: Vec<SE3>) {
        self.t_mi_ground_truth = rotations;
    }

    /// Rebuild a trajectory over the full knot history (marginalized knots
    /// stay readable).
    pub(crate) fn full_trajectory(&self) -> Result<Trajectory> {
        let mut traj = Trajectory::new(self.config.qc(), self.config.alpha());
        for kv in &self.vars {
            traj.add(kv.time, kv.pose, kv.velocity, kv.acceleration)?;
        }
        Ok(traj)
    }

    pub(crate) fn states(&self) -> &StateVector {
        &self.states
    }

    /// Process one sensor bundle.
    pub fn register_frame(&mut self, input: FrameInput) -> Result<RegistrationSummary> {
        let mut summary = RegistrationSummary::default();
        if input.points.is_empty() {
            return Ok(summary);
        }

        let index = self.frames.len();
        self.frames.push(FrameState::new());
        self.initialize_timestamp(index, &input);
        self.initialize_motion(index);
        let frame_points = self.initialize_frame(index, input.points);

        if index == 0 {
            self.seed_first_frame()?;
            summary.success = true;
        } else {
            let sample_size = if index < self.config.init_num_frames {
                self.config.init_sample_voxel_size
            } else {
                self.config.sample_voxel_size
            };
            let mut keypoints = preprocessing::grid_sampling(&frame_points, sample_size);
            summary.success = self.icp(index, &mut keypoints, &input.imu, &input.poses)?;
            summary.keypoints = keypoints;
            if !summary.success {
                return Ok(summary);
            }
        }

        summary.corrected_points = frame_points.clone();
        self.frames[index].points = frame_points;

        if index == 0 {
            self.update_map(0, 0)?;
        } else if index > self.config.delay_adding_points {
            self.update_map(index, index - self.config.delay_adding_points)?;
        }

        summary.r_ms = self.frames[index].end_r;
        summary.t_ms = self.frames[index].end_t;
        self.frames[index].phase = FramePhase::Committed;
        Ok(summary)
    }

    fn initialize_timestamp(&mut self, index: usize, input: &FrameInput) {
        let mut min_t = f64::MAX;
        let mut max_t = f64::MIN;
        for p in &input.points {
            min_t = min_t.min(p.timestamp);
            max_t = max_t.max(p.timestamp);
        }
        let frame = &mut self.frames[index];
        frame.begin_timestamp = min_t;
        frame.end_timestamp = max_t;
        frame.eval_timestamp = input.eval_time;
    }

    fn initialize_motion(&mut self, index: usize) {
        if index <= 1 {
            // The robot frame starts at the world origin, so the sensor
            // starts at the extrinsic.
            let frame = &mut self.frames[index];
            frame.begin_r = self.t_rs.rotation;
            frame.begin_t = self.t_rs.translation;
            frame.end_r = self.t_rs.rotation;
            frame.end_t = self.t_rs.translation;
        } else {
            // Constant body twist: replay the last relative motion.
            let prev = &self.frames[index - 1];
            let before = &self.frames[index - 2];
            let step_r = prev.end_r * before.end_r.transpose();
            let end_r = step_r * prev.end_r;
            let end_t = prev.end_t + step_r * (prev.end_t - before.end_t);
            let (begin_r, begin_t) = (prev.end_r, prev.end_t);
            let frame = &mut self.frames[index];
            frame.begin_r = begin_r;
            frame.begin_t = begin_t;
            frame.end_r = end_r;
            frame.end_t = end_t;
        }
    }

    /// Downsample, renormalize per-point fractions, and seed world
    /// coordinates from the motion guess.
    fn initialize_frame(&mut self, index: usize, points: Vec<Point3D>) -> Vec<Point3D> {
        let sample_size = if index < self.config.init_num_frames {
            self.config.init_voxel_size
        } else {
            self.config.voxel_size
        };
        let mut frame = points;

        let begin = self.frames[index].begin_timestamp;
        let end = self.frames[index].end_timestamp;
        let span = end - begin;
        for p in &mut frame {
            p.alpha_timestamp = if span > 0.0 {
                ((p.timestamp - begin) / span).clamp(0.0, 1.0)
            } else {
                1.0
            };
        }

        preprocessing::shuffle(&mut frame, 0);
        preprocessing::sub_sample_frame(&mut frame, sample_size);
        preprocessing::shuffle(&mut frame, 1);
        self.frames[index].phase = FramePhase::Downsampled;

        let begin_pose = self.frames[index].begin_pose();
        let end_pose = self.frames[index].end_pose();
        preprocessing::seed_world_points(&mut frame, &begin_pose, &end_pose);
        self.frames[index].phase = FramePhase::Initialized;
        frame
    }

    fn t_mi_locked_for_new_knots(&self) -> bool {
        !self.config.use_imu || self.config.use_t_mi_gt || self.config.t_mi_init_only
    }

    fn push_knot(&mut self, time: f64, pose: SE3, w: Vector6<f64>, dw: Vector6<f64>, bias: Vector6<f64>, t_mi: SE3, t_mi_locked: bool) -> KnotVar {
        let kv = KnotVar {
            time,
            pose: self.states.add_pose(pose),
            velocity: self.states.add_vector(w),
            acceleration: self.states.add_vector(dw),
            bias: self.states.add_vector(bias),
            t_mi: self.states.add_pose(t_mi),
        };
        self.states.set_locked(kv.t_mi, t_mi_locked);
        self.vars.push(kv);
        kv
    }

    /// Seed the two knots of the first scan. The first knot never enters the
    /// filter; the second becomes optimizable from the next frame on.
    fn seed_first_frame(&mut self) -> Result<()> {
        let begin = self.frames[0].begin_timestamp;
        let end = self.frames[0].end_timestamp;
        if end - begin <= TIME_EPSILON {
            return Err(OdometryError::NonMonotonicKnot {
                time: end,
                previous: begin,
            });
        }
        let locked = self.t_mi_locked_for_new_knots();
        self.push_knot(
            begin,
            SE3::identity(),
            Vector6::zeros(),
            Vector6::zeros(),
            Vector6::zeros(),
            SE3::identity(),
            locked,
        );
        self.push_knot(
            end,
            SE3::identity(),
            Vector6::zeros(),
            Vector6::zeros(),
            Vector6::zeros(),
            SE3::identity(),
            locked,
        );
        self.to_marginalize = 1;
        self.frames[0].mid_state_cov = SMatrix::<f64, 18, 18>::identity() * 1e-4;
        Ok(())
    }

    /// Bracketing window knot for a measurement stamp: `t_i <= tau <
    /// t_{i+1}`, with the last interval also claiming its right endpoint.
    fn window_bracket(&self, first: usize, timestamp: f64) -> Result<usize> {
        let last = self.vars.len() - 1;
        for i in first..last {
            if timestamp >= self.vars[i].time && timestamp < self.vars[i + 1].time {
                return Ok(i);
            }
        }
        if (timestamp - self.vars[last].time).abs() < TIME_EPSILON {
            return Ok(last - 1);
        }
        Err(OdometryError::MeasurementOutsideWindow {
            timestamp,
            window_begin: self.vars[first].time,
            window_end: self.vars[last].time,
        })
    }

    /// Enroll this frame's knots in the filter and run the marginalization
    /// that is due. Called once per frame, after the first association has
    /// confirmed the frame is usable.
    fn enroll_and_marginalize(&mut self, index: usize, prev_idx: usize) -> Result<()> {
        let use_imu = self.config.use_imu;
        let enroll_start = if index == 1 { prev_idx } else { prev_idx + 1 };
        for i in enroll_start..self.vars.len() {
            let kv = self.vars[i];
            self.filter
                .add_state_variable(vec![kv.pose, kv.velocity, kv.acceleration]);
            if use_imu {
                self.filter.add_state_variable(vec![kv.bias]);
                if !self.states.is_locked(kv.t_mi) {
                    self.filter.add_state_variable(vec![kv.t_mi]);
                }
            }
        }

        if index > self.config.delay_adding_points {
            let marg_frame = index - self.config.delay_adding_points - 1;
            let marg_time = self.frames[marg_frame].end_timestamp;
            let mut marg_keys: Vec<VarKey> = Vec::new();
            let mut next = self.to_marginalize;
            for i in self.to_marginalize..self.vars.len() {
                if self.vars[i].time <= marg_time + TIME_EPSILON {
                    let kv = self.vars[i];
                    marg_keys.extend([kv.pose, kv.velocity, kv.acceleration]);
                    if use_imu {
                        marg_keys.push(kv.bias);
                        if !self.states.is_locked(kv.t_mi) {
                            marg_keys.push(kv.t_mi);
                        }
                    }
                    next = i + 1;
                } else {
                    break;
                }
            }
            if !marg_keys.is_empty() {
                info!(
                    "marginalizing knots up to t = {marg_time:.6} ({} keys)",
                    marg_keys.len()
                );
                self.filter.marginalize_variables(&marg_keys, &self.states)?;
                self.to_marginalize = next;
                for frame in &mut self.frames {
                    if frame.phase == FramePhase::Committed
                        && frame.end_timestamp <= marg_time + TIME_EPSILON
                    {
                        frame.phase = FramePhase::Marginalized;
                    }
                }
            }
        }
        Ok(())
    }

    /// Refresh the frame's begin/mid/end poses from the window trajectory;
    /// returns the summed translation/rotation change against the previous
    /// estimate.
    fn update_frame_poses(&mut self, index: usize, traj: &Trajectory) -> (f64, f64) {
        let states = &self.states;
        let t_rs = self.t_rs;
        let frame = &mut self.frames[index];

        let begin_t_ms = traj
            .pose_interpolator(frame.begin_timestamp)
            .value(states)
            .inverse()
            .compose(&t_rs);
        let end_t_ms = traj
            .pose_interpolator(frame.end_timestamp)
            .value(states)
            .inverse()
            .compose(&t_rs);
        let mid_t_ms = traj
            .pose_interpolator(frame.eval_timestamp)
            .value(states)
            .inverse()
            .compose(&t_rs);

        let diff_trans = (frame.begin_t - begin_t_ms.translation).norm()
            + (frame.end_t - end_t_ms.translation).norm();
        let diff_rot = so3::angular_distance_deg(&frame.begin_r, &begin_t_ms.rotation)
            + so3::angular_distance_deg(&frame.end_r, &end_t_ms.rotation);

        frame.begin_r = begin_t_ms.rotation;
        frame.begin_t = begin_t_ms.translation;
        frame.end_r = end_t_ms.rotation;
        frame.end_t = end_t_ms.translation;
        frame.mid_pose = mid_t_ms;
        (diff_trans, diff_rot)
    }

    /// The per-frame ICP registration. Returns `Ok(false)` on the transient
    /// insufficient-keypoints abort.
    fn icp(
        &mut self,
        index: usize,
        keypoints: &mut [Point3D],
        imu: &[ImuData],
        poses: &[PoseData],
    ) -> Result<bool> {
        let vars_checkpoint = self.vars.len();
        let prev_idx = self.vars.len() - 1;
        // The window bridges from the newest committed knot. That is the
        // previous frame's end, or an older frame's end when aborted frames
        // left no knots behind.
        let prev = self.vars[prev_idx];
        if prev.time >= self.frames[index].end_timestamp {
            return Err(OdometryError::Inconsistency(
                "committed knot at or beyond the incoming scan end",
            ));
        }

        // Debug mode: drive the gravity alignment from ground truth.
        if self.config.use_imu && self.config.use_t_mi_gt {
            if let Some(gt) = self.t_mi_ground_truth.get(index).copied() {
                self.states.set_pose(prev.t_mi, gt);
            }
            self.states.set_locked(prev.t_mi, true);
        }

        // Window trajectory: previous scan-end knot plus this frame's knots.
        let mut traj = Trajectory::new(self.config.qc(), self.config.alpha());
        traj.add(prev.time, prev.pose, prev.velocity, prev.acceleration)?;

        let curr_time = self.frames[index].end_timestamp;
        let num_states = self.config.num_extra_states + 1;
        let dt_sub = (curr_time - prev.time) / num_states as f64;
        let prev_t_rm = self.states.pose(prev.pose);
        // Initial guess along the chord to the extrapolated end pose.
        let end_guess = self
            .t_rs
            .compose(&self.frames[index].end_pose().inverse());
        let chord = end_guess.compose(&prev_t_rm.inverse()).log();
        let prev_w = self.states.vector(prev.velocity);
        let prev_dw = self.states.vector(prev.acceleration);
        let prev_bias = self.states.vector(prev.bias);
        let prev_t_mi = self.states.pose(prev.t_mi);
        let t_mi_locked = self.t_mi_locked_for_new_knots();
        for i in 1..=num_states {
            let knot_time = if i == num_states {
                curr_time
            } else {
                prev.time + dt_sub * i as f64
            };
            let fraction = i as f64 / num_states as f64;
            let pose_guess = SE3::exp(&(fraction * chord)).compose(&prev_t_rm);
            let t_mi_value = if self.config.use_t_mi_gt {
                SE3::identity()
            } else {
                prev_t_mi
            };
            let kv = self.push_knot(
                knot_time,
                pose_guess,
                prev_w,
                prev_dw,
                prev_bias,
                t_mi_value,
                t_mi_locked,
            );
            traj.add(kv.time, kv.pose, kv.velocity, kv.acceleration)?;
        }

        // One-time priors anchoring the very first optimizable knot.
        let mut frame_terms: Vec<Arc<dyn CostTerm>> = Vec::new();
        if index == 1 {
            traj.add_pose_prior(prev.time, SE3::identity(), Matrix6::identity() * 1e-4)?;
            traj.add_velocity_prior(prev.time, Vector6::zeros(), Matrix6::identity() * 1e-4)?;
            traj.add_acceleration_prior(prev.time, Vector6::zeros(), Matrix6::identity() * 1e-1)?;
            if self.config.use_imu {
                frame_terms.push(Arc::new(VectorPriorFactor::new(
                    prev.bias,
                    Vector6::zeros(),
                    Matrix6::identity() * self.config.p0_imu,
                )?));
                if !self.config.use_t_mi_gt {
                    // Roll and pitch are observable under gravity; yaw is
                    // nearly unobservable and pinned tight.
                    let t_mi_cov = Matrix6::from_diagonal(&Vector6::new(
                        1e-3, 1e-3, 1e-3, 0.1, 0.1, 1e-4,
                    ));
                    frame_terms.push(Arc::new(Se3PriorFactor::new(
                        prev.t_mi,
                        SE3::identity(),
                        t_mi_cov,
                    )?));
                }
            }
        }

        // Inertial, bias-evolution, alignment-evolution, and pose factors.
        let mut meas_aux_terms: Vec<Arc<dyn CostTerm>> = Vec::new();
        if self.config.use_imu {
            for sample in imu {
                let i = self.window_bracket(prev_idx, sample.timestamp)?;
                meas_aux_terms.push(Arc::new(GyroFactor::new(
                    traj.velocity_interpolator(sample.timestamp),
                    self.vars[i].bias,
                    sample.ang_vel,
                    &self.config.r_ang(),
                    RobustLoss::L1,
                )?));
                if self.config.imu_use_accel {
                    meas_aux_terms.push(Arc::new(AccelFactor::new(
                        traj.pose_interpolator(sample.timestamp),
                        traj.acceleration_interpolator(sample.timestamp),
                        self.vars[i].bias,
                        self.vars[i].t_mi,
                        sample.lin_acc,
                        self.config.gravity,
                        &self.config.r_acc(),
                        RobustLoss::L1,
                    )?));
                }
            }
            let bias_cov = Matrix6::identity() * self.config.q_imu;
            for i in prev_idx..self.vars.len() - 1 {
                meas_aux_terms.push(Arc::new(VectorDifferenceFactor::new(
                    self.vars[i].bias,
                    self.vars[i + 1].bias,
                    bias_cov,
                )?));
            }
            if !self.config.t_mi_init_only && !self.config.use_t_mi_gt {
                let qg = Matrix6::from_diagonal(&Vector6::from_row_slice(&self.config.qg_diag));
                for i in prev_idx..self.vars.len() - 1 {
                    meas_aux_terms.push(Arc::new(Se3RelativeFactor::new(
                        self.vars[i].t_mi,
                        self.vars[i + 1].t_mi,
                        qg,
                    )?));
                }
            }
        }
        if self.config.use_pose_meas {
            for meas in poses {
                self.window_bracket(prev_idx, meas.timestamp)?;
                meas_aux_terms.push(Arc::new(PoseMeasurementFactor::new(
                    traj.pose_interpolator(meas.timestamp),
                    meas.pose,
                    &self.config.r_pose_diag(),
                )?));
            }
        }

        // Per-keypoint pose interpolators, fixed for the frame.
        let kp_interps: Vec<PoseInterpolator> = keypoints
            .iter()
            .map(|kp| traj.pose_interpolator(kp.timestamp))
            .collect();

        let nb_voxels_visited = if index < self.config.init_num_frames { 2 } else { 1 };
        let loss = self.config.p2p_loss();
        let mut icp_success = true;
        let mut enrolled = false;
        let mut meas_terms: Vec<Arc<dyn CostTerm>> = Vec::new();

        self.frames[index].phase = FramePhase::IcpIterating;

        for iter in 0..self.config.num_iters_icp {
            transform_keypoints(&self.pool, keypoints, &kp_interps, &self.states, &self.t_rs);

            meas_terms = associate(
                &self.pool,
                &self.map,
                keypoints,
                &kp_interps,
                &self.config,
                nb_voxels_visited,
                loss,
                &self.t_sr,
            )?;
            let number_keypoints_used = meas_terms.len();

            if number_keypoints_used < self.config.min_number_keypoints {
                error!(
                    "not enough keypoints selected: {number_keypoints_used} < {}",
                    self.config.min_number_keypoints
                );
                icp_success = false;
                if !enrolled {
                    // Nothing was enrolled yet: forget this frame's knots so
                    // the committed trajectory stays untouched.
                    self.vars.truncate(vars_checkpoint);
                }
                break;
            }

            if !enrolled {
                self.enroll_and_marginalize(index, prev_idx)?;
                enrolled = true;
            }

            let mut problem = self.filter.snapshot();
            traj.add_prior_cost_terms(&mut problem)?;
            for term in &frame_terms {
                problem.add_cost_term(term.clone());
            }
            for term in &meas_terms {
                problem.add_cost_term(term.clone());
            }
            for term in &meas_aux_terms {
                problem.add_cost_term(term.clone());
            }

            gauss_newton::solve(
                &problem,
                &mut self.states,
                &GaussNewtonParams {
                    max_iterations: self.config.max_iterations,
                    verbose: self.config.verbose,
                },
            )?;

            let (diff_trans, diff_rot) = self.update_frame_poses(index, &traj);
            if index > 1
                && diff_trans < self.config.threshold_translation_norm
                && diff_rot < self.config.threshold_orientation_norm
            {
                if self.config.debug_print {
                    info!("icp converged after {} outer iterations", iter + 1);
                }
                break;
            }
        }

        if !icp_success {
            return Ok(false);
        }

        // Fold this frame's factors into the filter and re-solve the window.
        traj.add_prior_cost_terms(&mut self.filter)?;
        for term in frame_terms {
            self.filter.add_cost_term(term);
        }
        for term in meas_terms {
            self.filter.add_cost_term(term);
        }
        for term in meas_aux_terms {
            self.filter.add_cost_term(term);
        }

        if self.filter.num_variable_groups() > MAX_VARIABLE_GROUPS {
            return Err(OdometryError::WindowOverflow {
                kind: "variable groups",
                limit: MAX_VARIABLE_GROUPS,
            });
        }
        if self.filter.num_cost_terms() > MAX_COST_TERMS {
            return Err(OdometryError::WindowOverflow {
                kind: "cost terms",
                limit: MAX_COST_TERMS,
            });
        }

        let problem = self.filter.problem();
        let report = gauss_newton::solve(
            &problem,
            &mut self.states,
            &GaussNewtonParams {
                max_iterations: WINDOW_SOLVE_ITERATIONS,
                verbose: self.config.verbose,
            },
        )?;

        // Freeze the alignment after initialization when requested.
        if self.config.use_imu && self.config.t_mi_init_only && !self.config.use_t_mi_gt {
            let frozen = self.states.pose(prev.t_mi);
            for kv in self.vars[vars_checkpoint..].to_vec() {
                self.states.set_pose(kv.t_mi, frozen);
            }
        }

        self.update_frame_poses(index, &traj);
        let eval_time = self.frames[index].eval_timestamp;
        self.frames[index].mid_w = traj.velocity_interpolator(eval_time).value(&self.states);
        self.frames[index].mid_dw = traj
            .acceleration_interpolator(eval_time)
            .value(&self.states);
        self.frames[index].mid_t_mi = self.states.pose(prev.t_mi);
        let bias_knot = self.window_bracket(prev_idx, eval_time)?;
        self.frames[index].mid_b = self.states.vector(self.vars[bias_knot].bias);

        let posterior = Covariance::new(&report)?;
        let cov = traj.covariance(&posterior, &self.states, eval_time);
        let mut mid_cov = SMatrix::<f64, 18, 18>::zeros();
        for r in 0..18 {
            for c in 0..18 {
                mid_cov[(r, c)] = cov[(r, c)];
            }
        }
        self.frames[index].mid_state_cov = mid_cov;
        self.frames[index].phase = FramePhase::SwfSolved;

        // Final keypoint placement for the summary.
        transform_keypoints(&self.pool, keypoints, &kp_interps, &self.states, &self.t_rs);

        if self.config.debug_print {
            debug!(
                "frame {index}: end translation {:?}, window groups {}",
                self.frames[index].end_t,
                self.filter.num_variable_groups()
            );
        }
        Ok(true)
    }

    /// De-skew a delayed frame through the optimized trajectory, add its
    /// points to the map, and evict far voxels around the current position.
    fn update_map(&mut self, index: usize, update_frame: usize) -> Result<()> {
        let end_time = self.frames[update_frame].end_timestamp;

        let mut traj = Trajectory::new(self.config.qc(), self.config.alpha());
        let start = self.to_marginalize.saturating_sub(1);
        let mut covered = false;
        for kv in &self.vars[start..] {
            traj.add(kv.time, kv.pose, kv.velocity, kv.acceleration)?;
            if (kv.time - end_time).abs() < TIME_EPSILON {
                covered = true;
                break;
            }
            if kv.time > end_time {
                return Err(OdometryError::Inconsistency(
                    "knot beyond the frame being mapped",
                ));
            }
        }
        if !covered {
            return Err(OdometryError::Inconsistency(
                "frame end knot missing from map-update window",
            ));
        }

        let mut points = std::mem::take(&mut self.frames[update_frame].points);
        {
            let states = &self.states;
            let t_rs = self.t_rs;
            let traj_ref = &traj;
            self.pool.install(|| {
                points.par_iter_mut().for_each(|p| {
                    let t_rm = traj_ref.pose_interpolator(p.timestamp).value(states);
                    p.pt = t_rm.inverse().compose(&t_rs).transform(&p.raw_pt);
                });
            });
        }

        info!(
            "adding {} points to the map from frame {update_frame}",
            points.len()
        );
        self.map.add(
            &points,
            self.config.size_voxel_map,
            self.config.max_num_points_in_voxel,
            self.config.min_distance_points,
        );

        let location = self.frames[index].end_t;
        self.map.remove(&location, self.config.max_distance);
        Ok(())
    }
}

/// Parallel keypoint world transform through per-keypoint interpolators.
fn transform_keypoints(
    pool: &rayon::ThreadPool,
    keypoints: &mut [Point3D],
    interps: &[PoseInterpolator],
    states: &StateVector,
    t_rs: &SE3,
) {
    pool.install(|| {
        keypoints
            .par_iter_mut()
            .zip(interps.par_iter())
            .for_each(|(kp, interp)| {
                let t_ms = interp.value(states).inverse().compose(t_rs);
                kp.pt = t_ms.transform(&kp.raw_pt);
            });
    });
}

/// Parallel association: neighbor search, plane fit, gating, and residual
/// construction. Per-worker outputs are merged by the reduction; a
/// non-finite planarity anywhere aborts the frame as a fatal fault.
#[allow(clippy::too_many_arguments)]
fn associate(
    pool: &rayon::ThreadPool,
    map: &VoxelMap,
    keypoints: &[Point3D],
    interps: &[PoseInterpolator],
    config: &OdometryConfig,
    nb_voxels_visited: i32,
    loss: RobustLoss,
    t_sr: &SE3,
) -> Result<Vec<Arc<dyn CostTerm>>> {
    let candidates: Result<Vec<Option<Arc<dyn CostTerm>>>> = pool.install(|| {
        keypoints
            .par_iter()
            .zip(interps.par_iter())
            .map(|(kp, interp)| -> Result<Option<Arc<dyn CostTerm>>> {
                let neighbors = map.search_neighbors(
                    &kp.pt,
                    nb_voxels_visited,
                    config.size_voxel_map,
                    config.max_number_neighbors,
                );
                if neighbors.len() < config.min_number_neighbors {
                    return Ok(None);
                }
                let neighborhood = Neighborhood::estimate(&neighbors)?;
                if neighborhood.a2d < MIN_PLANARITY {
                    return Ok(None);
                }
                let weight = neighborhood.a2d.powf(config.power_planarity);

                let dist_to_plane = (kp.pt - neighbors[0]).dot(&neighborhood.normal).abs();
                if dist_to_plane >= config.p2p_max_dist {
                    return Ok(None);
                }

                let factor = PointPlaneFactor::new(
                    interp.clone(),
                    &kp.raw_pt,
                    neighbors[0],
                    &neighborhood.normal,
                    weight,
                    t_sr,
                    loss,
                )?;
                Ok(Some(Arc::new(factor) as Arc<dyn CostTerm>))
            })
            .collect()
    });
    Ok(candidates?.into_iter().flatten().collect())
}
