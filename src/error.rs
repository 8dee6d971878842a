//! Fatal fault kinds for the odometry engine.
//!
//! Transient per-frame conditions (too few keypoints, a stalled inner solve)
//! are *not* errors: they surface through
//! [`RegistrationSummary::success`](crate::engine::RegistrationSummary) and
//! the engine continues from the last committed state. Everything in
//! [`OdometryError`] is terminal and stops the engine.

use thiserror::Error;

/// Terminal faults raised by the odometry engine.
#[derive(Debug, Error)]
pub enum OdometryError {
    /// Malformed configuration detected before any frame is processed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Trajectory knot times must be strictly increasing.
    #[error("knot time {time} not after previous knot time {previous}")]
    NonMonotonicKnot { time: f64, previous: f64 },

    /// An inertial or pose measurement fell outside the bracketing knots of
    /// the current window.
    #[error("measurement stamp {timestamp} outside knot window [{window_begin}, {window_end})")]
    MeasurementOutsideWindow {
        timestamp: f64,
        window_begin: f64,
        window_end: f64,
    },

    /// The local point scatter produced a non-finite planarity coefficient.
    #[error("degenerate neighborhood: non-finite planarity")]
    DegenerateNeighborhood,

    /// The sliding window grew past its correctness/latency budget.
    #[error("sliding window exceeded {limit} {kind}")]
    WindowOverflow { kind: &'static str, limit: usize },

    /// Cholesky factorization of the normal equations failed.
    #[error("normal equations not positive definite during {context}")]
    SolverFailure { context: &'static str },

    /// Internal bookkeeping invariant violated.
    #[error("trajectory bookkeeping error: {0}")]
    Inconsistency(&'static str),

    /// Trajectory dump I/O failure.
    #[error("trajectory dump failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, OdometryError>;
