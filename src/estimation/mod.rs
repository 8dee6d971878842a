//! Factor-graph estimation layer: state arena, robust losses, Gauss-Newton,
//! and the sliding-window filter.

pub mod covariance;
pub mod factors;
pub mod gauss_newton;
pub mod loss;
pub mod problem;
pub mod sliding_window;
pub mod state;

pub use covariance::Covariance;
pub use gauss_newton::{GaussNewtonParams, SolveReport};
pub use loss::RobustLoss;
pub use problem::{CostCollector, CostTerm, LinearizedTerm, NoiseModel, Problem};
pub use sliding_window::SlidingWindowFilter;
pub use state::{StateVector, VarKey, VarValue};
