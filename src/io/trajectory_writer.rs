//! Shutdown trajectory dump.
//!
//! One ASCII line per 10 ms sample over the full estimated span:
//! `0.0 <nanoseconds> <16 row-major elements of T_rm> <6 velocity components>`.

use std::io::Write;

use log::info;

use crate::engine::Odometry;
use crate::error::Result;

/// Sample period of the dump, seconds.
const DUMP_PERIOD: f64 = 0.01;

/// Write the trajectory sampled at 100 Hz over
/// `[first frame begin, last frame end]`.
pub fn write_trajectory<W: Write>(odometry: &Odometry, writer: &mut W) -> Result<()> {
    let frames = odometry.trajectory();
    if frames.is_empty() {
        return Ok(());
    }
    let begin = frames[0].begin_timestamp;
    let end = frames[frames.len() - 1].end_timestamp;

    let trajectory = odometry.full_trajectory()?;
    let states = odometry.states();

    info!("dumping trajectory over [{begin:.6}, {end:.6}]");
    let mut time = begin;
    while time <= end {
        let t_rm = trajectory.pose_interpolator(time).value(states).matrix();
        let velocity = trajectory.velocity_interpolator(time).value(states);

        let nanosecs = (time * 1e9).round() as i64;
        let mut line = format!("0.0 {nanosecs}");
        for r in 0..4 {
            for c in 0..4 {
                line.push_str(&format!(" {:.12}", t_rm[(r, c)]));
            }
        }
        for i in 0..6 {
            line.push_str(&format!(" {:.12}", velocity[i]));
        }
        writeln!(writer, "{line}")?;
        time += DUMP_PERIOD;
    }
    Ok(())
}
