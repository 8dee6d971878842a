//! Output infrastructure.

pub mod trajectory_writer;

pub use trajectory_writer::write_trajectory;
