//! Continuous-time trajectory: a Gaussian-process motion prior over
//! `SE(3) x R^6 x R^6` sampled at knots, with closed-form interpolation
//! anywhere in between.
//!
//! Knot variables live in the shared state arena; the trajectory only stores
//! keys and times, so interpolators remain valid while solvers update the
//! arena in place.

mod gp;
mod interp;
mod prior;

pub use interp::{AccelerationInterpolator, PoseInterpolator, VelocityInterpolator};

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix6, Vector6};

use crate::core::math::SE3;
use crate::error::{OdometryError, Result};
use crate::estimation::factors::{Se3PriorFactor, VectorPriorFactor};
use crate::estimation::problem::CostCollector;
use crate::estimation::state::{StateVector, VarKey};
use crate::estimation::Covariance;
use interp::Span;

/// One trajectory knot: a time plus the arena keys of its state variables.
#[derive(Debug, Clone, Copy)]
pub struct Knot {
    /// Knot time, seconds.
    pub time: f64,
    /// World-to-robot pose variable.
    pub pose: VarKey,
    /// Body-centric velocity variable.
    pub velocity: VarKey,
    /// Body-centric acceleration variable.
    pub acceleration: VarKey,
}

/// Matching tolerance when a prior names a knot by time.
const KNOT_TIME_TOLERANCE: f64 = 1e-9;

/// Continuous-time trajectory over a window of knots.
pub struct Trajectory {
    qc: Vector6<f64>,
    alpha: Vector6<f64>,
    knots: Vec<Knot>,
    pose_priors: Vec<(usize, SE3, Matrix6<f64>)>,
    velocity_priors: Vec<(usize, Vector6<f64>, Matrix6<f64>)>,
    acceleration_priors: Vec<(usize, Vector6<f64>, Matrix6<f64>)>,
}

impl Trajectory {
    /// Prior with power spectral density `qc` and Singer time constants
    /// `alpha` (zero entries fall back to the constant-acceleration model).
    pub fn new(qc: Vector6<f64>, alpha: Vector6<f64>) -> Self {
        Self {
            qc,
            alpha,
            knots: Vec::new(),
            pose_priors: Vec::new(),
            velocity_priors: Vec::new(),
            acceleration_priors: Vec::new(),
        }
    }

    /// Register a knot. Times must be strictly increasing.
    pub fn add(
        &mut self,
        time: f64,
        pose: VarKey,
        velocity: VarKey,
        acceleration: VarKey,
    ) -> Result<()> {
        if let Some(last) = self.knots.last() {
            if time <= last.time {
                return Err(OdometryError::NonMonotonicKnot {
                    time,
                    previous: last.time,
                });
            }
        }
        self.knots.push(Knot {
            time,
            pose,
            velocity,
            acceleration,
        });
        Ok(())
    }

    /// Registered knots in time order.
    pub fn knots(&self) -> &[Knot] {
        &self.knots
    }

    /// Locate a query time. Queries outside the span clamp to the boundary
    /// knot.
    fn span_at(&self, time: f64) -> Span {
        assert!(!self.knots.is_empty(), "trajectory has no knots");
        let first = &self.knots[0];
        let last = &self.knots[self.knots.len() - 1];
        if time <= first.time {
            return Span::AtKnot(*first);
        }
        if time >= last.time {
            return Span::AtKnot(*last);
        }
        // Binary search for the bracketing pair.
        let idx = self
            .knots
            .partition_point(|k| k.time <= time)
            .saturating_sub(1);
        let k1 = self.knots[idx];
        let k2 = self.knots[idx + 1];
        if (time - k1.time).abs() < KNOT_TIME_TOLERANCE {
            return Span::AtKnot(k1);
        }
        let weights = gp::interp_weights(time - k1.time, k2.time - k1.time, &self.alpha, &self.qc);
        Span::Between { k1, k2, weights }
    }

    /// Lazy pose interpolator at `time`.
    pub fn pose_interpolator(&self, time: f64) -> PoseInterpolator {
        PoseInterpolator {
            span: self.span_at(time),
        }
    }

    /// Lazy velocity interpolator at `time`.
    pub fn velocity_interpolator(&self, time: f64) -> VelocityInterpolator {
        VelocityInterpolator {
            span: self.span_at(time),
        }
    }

    /// Lazy acceleration interpolator at `time`.
    pub fn acceleration_interpolator(&self, time: f64) -> AccelerationInterpolator {
        AccelerationInterpolator {
            span: self.span_at(time),
        }
    }

    fn knot_index_at(&self, time: f64) -> Result<usize> {
        self.knots
            .iter()
            .position(|k| (k.time - time).abs() < KNOT_TIME_TOLERANCE)
            .ok_or(OdometryError::MeasurementOutsideWindow {
                timestamp: time,
                window_begin: self.knots.first().map_or(0.0, |k| k.time),
                window_end: self.knots.last().map_or(0.0, |k| k.time),
            })
    }

    /// Pin the pose of the knot at `time`.
    pub fn add_pose_prior(&mut self, time: f64, value: SE3, covariance: Matrix6<f64>) -> Result<()> {
        let idx = self.knot_index_at(time)?;
        self.pose_priors.push((idx, value, covariance));
        Ok(())
    }

    /// Pin the velocity of the knot at `time`.
    pub fn add_velocity_prior(
        &mut self,
        time: f64,
        value: Vector6<f64>,
        covariance: Matrix6<f64>,
    ) -> Result<()> {
        let idx = self.knot_index_at(time)?;
        self.velocity_priors.push((idx, value, covariance));
        Ok(())
    }

    /// Pin the acceleration of the knot at `time`.
    pub fn add_acceleration_prior(
        &mut self,
        time: f64,
        value: Vector6<f64>,
        covariance: Matrix6<f64>,
    ) -> Result<()> {
        let idx = self.knot_index_at(time)?;
        self.acceleration_priors.push((idx, value, covariance));
        Ok(())
    }

    /// Emit the between-knot motion-prior factors plus all registered unary
    /// priors into `collector`.
    pub fn add_prior_cost_terms(&self, collector: &mut dyn CostCollector) -> Result<()> {
        for pair in self.knots.windows(2) {
            let dt = pair[1].time - pair[0].time;
            let factor = prior::GpPriorFactor::new(
                pair[0],
                pair[1],
                gp::transition_blocks(dt, &self.alpha),
                gp::noise_matrix(dt, &self.alpha, &self.qc),
            )?;
            collector.add_cost_term(Arc::new(factor));
        }
        for (idx, value, cov) in &self.pose_priors {
            collector.add_cost_term(Arc::new(Se3PriorFactor::new(
                self.knots[*idx].pose,
                *value,
                *cov,
            )?));
        }
        for (idx, value, cov) in &self.velocity_priors {
            collector.add_cost_term(Arc::new(VectorPriorFactor::new(
                self.knots[*idx].velocity,
                *value,
                *cov,
            )?));
        }
        for (idx, value, cov) in &self.acceleration_priors {
            collector.add_cost_term(Arc::new(VectorPriorFactor::new(
                self.knots[*idx].acceleration,
                *value,
                *cov,
            )?));
        }
        Ok(())
    }

    /// Marginal 18x18 covariance of `(pose, velocity, acceleration)` at
    /// `time`, projected from the solver's posterior over the bracketing knot
    /// variables.
    pub fn covariance(
        &self,
        posterior: &Covariance,
        states: &StateVector,
        time: f64,
    ) -> DMatrix<f64> {
        match self.span_at(time) {
            Span::AtKnot(k) => posterior.joint(&[k.pose, k.velocity, k.acceleration]),
            Span::Between { k1, k2, weights } => {
                let eval = interp::eval_between(states, &k1, &k2, &weights);
                let joint = posterior.joint(&eval.keys);
                let mut projection = DMatrix::<f64>::zeros(18, 36);
                for v in 0..6 {
                    for (row_block, jac) in [
                        (0, &eval.pose_jac[v]),
                        (6, &eval.velocity_jac[v]),
                        (12, &eval.acceleration_jac[v]),
                    ] {
                        projection
                            .view_mut((row_block, 6 * v), (6, 6))
                            .copy_from(&DMatrix::from_column_slice(6, 6, jac.as_slice()));
                    }
                }
                &projection * joint * projection.transpose()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn straight_line_trajectory(states: &mut StateVector) -> Trajectory {
        let mut traj = Trajectory::new(Vector6::repeat(1.0), Vector6::zeros());
        let w = Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        for i in 0..3 {
            let t = i as f64;
            let pose = states.add_pose(SE3::exp(&(t * w)));
            let vel = states.add_vector(w);
            let acc = states.add_vector(Vector6::zeros());
            traj.add(t, pose, vel, acc).unwrap();
        }
        traj
    }

    #[test]
    fn knot_times_must_increase() {
        let mut states = StateVector::new();
        let mut traj = Trajectory::new(Vector6::repeat(1.0), Vector6::zeros());
        let pose = states.add_pose(SE3::identity());
        let vel = states.add_vector(Vector6::zeros());
        let acc = states.add_vector(Vector6::zeros());
        traj.add(1.0, pose, vel, acc).unwrap();
        assert!(matches!(
            traj.add(1.0, pose, vel, acc),
            Err(OdometryError::NonMonotonicKnot { .. })
        ));
    }

    #[test]
    fn interpolation_at_knot_times_is_exact() {
        let mut states = StateVector::new();
        let traj = straight_line_trajectory(&mut states);
        for (i, knot) in traj.knots().iter().enumerate() {
            let interp = traj.pose_interpolator(i as f64);
            let value = interp.value(&states);
            let expected = states.pose(knot.pose);
            assert_relative_eq!(value.rotation, expected.rotation, epsilon = 1e-12);
            assert_relative_eq!(value.translation, expected.translation, epsilon = 1e-12);
        }
    }

    #[test]
    fn queries_outside_the_span_clamp_to_boundary_knots() {
        let mut states = StateVector::new();
        let traj = straight_line_trajectory(&mut states);
        let before = traj.pose_interpolator(-5.0).value(&states);
        let after = traj.pose_interpolator(17.0).value(&states);
        assert_relative_eq!(
            before.translation,
            states.pose(traj.knots()[0].pose).translation,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            after.translation,
            states.pose(traj.knots()[2].pose).translation,
            epsilon = 1e-12
        );
    }

    #[test]
    fn midpoint_of_constant_velocity_is_the_chord_midpoint() {
        let mut states = StateVector::new();
        let traj = straight_line_trajectory(&mut states);
        let mid = traj.pose_interpolator(0.5).value(&states);
        assert_relative_eq!(mid.translation.x, 0.5, epsilon = 1e-9);
        let vel = traj.velocity_interpolator(0.5).value(&states);
        assert_relative_eq!(vel[0], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn priors_require_an_existing_knot() {
        let mut states = StateVector::new();
        let mut traj = straight_line_trajectory(&mut states);
        assert!(traj
            .add_pose_prior(0.5, SE3::identity(), Matrix6::identity())
            .is_err());
        assert!(traj
            .add_pose_prior(1.0, SE3::identity(), Matrix6::identity())
            .is_ok());
    }
}
