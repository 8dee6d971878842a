//! Closed-form transition and process-noise matrices of the motion prior.
//!
//! The prior on the local 18-dimensional state `(xi, velocity, acceleration)`
//! is a first-order Markov ("Singer") process on acceleration with diagonal
//! time-constant vector `alpha`. Because both the power spectral density
//! `q_c` and `alpha` are diagonal, the 18x18 transition and noise matrices
//! decompose into independent per-axis 3x3 problems; the `alpha -> 0` limit
//! of every entry is the white-noise-on-jerk (constant-acceleration) model,
//! which is used directly below a small threshold so a single code path
//! serves both priors.

use nalgebra::{DMatrix, Matrix3, Vector6};

/// Axis time constants below this magnitude use the constant-acceleration
/// limit forms.
const WNOJ_THRESHOLD: f64 = 1e-8;

/// Per-axis 3x3 transition matrix over an interval `dt`.
pub(crate) fn axis_transition(dt: f64, alpha: f64) -> Matrix3<f64> {
    if alpha.abs() < WNOJ_THRESHOLD {
        return Matrix3::new(
            1.0,
            dt,
            0.5 * dt * dt,
            0.0,
            1.0,
            dt,
            0.0,
            0.0,
            1.0,
        );
    }
    let x = alpha * dt;
    let e = (-x).exp();
    Matrix3::new(
        1.0,
        dt,
        (x - 1.0 + e) / (alpha * alpha),
        0.0,
        1.0,
        (1.0 - e) / alpha,
        0.0,
        0.0,
        e,
    )
}

/// Per-axis 3x3 process-noise covariance over an interval `dt`.
pub(crate) fn axis_noise(dt: f64, alpha: f64, qc: f64) -> Matrix3<f64> {
    if alpha.abs() < WNOJ_THRESHOLD {
        let dt2 = dt * dt;
        let dt3 = dt2 * dt;
        let dt4 = dt3 * dt;
        let dt5 = dt4 * dt;
        return qc
            * Matrix3::new(
                dt5 / 20.0,
                dt4 / 8.0,
                dt3 / 6.0,
                dt4 / 8.0,
                dt3 / 3.0,
                dt2 / 2.0,
                dt3 / 6.0,
                dt2 / 2.0,
                dt,
            );
    }
    let a = alpha;
    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a3 * a;
    let a5 = a4 * a;
    let x = a * dt;
    let e = (-x).exp();
    let e2 = (-2.0 * x).exp();

    let q11 = (1.0 - e2 + 2.0 * x + (2.0 / 3.0) * x * x * x - 2.0 * x * x - 4.0 * x * e)
        / (2.0 * a5);
    let q12 = (e2 + 1.0 - 2.0 * e + 2.0 * x * e - 2.0 * x + x * x) / (2.0 * a4);
    let q13 = (1.0 - e2 - 2.0 * x * e) / (2.0 * a3);
    let q22 = (4.0 * e - 3.0 - e2 + 2.0 * x) / (2.0 * a3);
    let q23 = (e2 + 1.0 - 2.0 * e) / (2.0 * a2);
    let q33 = (1.0 - e2) / (2.0 * a);

    qc * Matrix3::new(q11, q12, q13, q12, q22, q23, q13, q23, q33)
}

/// Diagonal 6x6 blocks of an 18x18 prior matrix, one scalar per axis.
pub(crate) type DiagBlocks = [[Vector6<f64>; 3]; 3];

/// Transition blocks `Phi(dt)` over all six axes.
pub(crate) fn transition_blocks(dt: f64, alpha: &Vector6<f64>) -> DiagBlocks {
    let mut blocks: DiagBlocks = [[Vector6::zeros(); 3]; 3];
    for axis in 0..6 {
        let phi = axis_transition(dt, alpha[axis]);
        for r in 0..3 {
            for c in 0..3 {
                blocks[r][c][axis] = phi[(r, c)];
            }
        }
    }
    blocks
}

/// Dense 18x18 process-noise covariance `Q(dt)`.
pub(crate) fn noise_matrix(dt: f64, alpha: &Vector6<f64>, qc: &Vector6<f64>) -> DMatrix<f64> {
    let mut q = DMatrix::<f64>::zeros(18, 18);
    for axis in 0..6 {
        let q_axis = axis_noise(dt, alpha[axis], qc[axis]);
        for r in 0..3 {
            for c in 0..3 {
                q[(6 * r + axis, 6 * c + axis)] = q_axis[(r, c)];
            }
        }
    }
    q
}

/// Interpolation weights `Lambda(tau)` and `Psi(tau)` between two knots.
#[derive(Debug, Clone)]
pub(crate) struct InterpWeights {
    pub lambda: DiagBlocks,
    pub psi: DiagBlocks,
}

/// Closed-form interpolation weights for a query `dt_tau` into an interval of
/// length `dt_total`:
/// `Psi = Q(dt_tau) Phi(dt_total - dt_tau)^T Q(dt_total)^-1` and
/// `Lambda = Phi(dt_tau) - Psi Phi(dt_total)`.
pub(crate) fn interp_weights(
    dt_tau: f64,
    dt_total: f64,
    alpha: &Vector6<f64>,
    qc: &Vector6<f64>,
) -> InterpWeights {
    let mut lambda: DiagBlocks = [[Vector6::zeros(); 3]; 3];
    let mut psi: DiagBlocks = [[Vector6::zeros(); 3]; 3];
    for axis in 0..6 {
        let a = alpha[axis];
        let phi_tau = axis_transition(dt_tau, a);
        let phi_rest = axis_transition(dt_total - dt_tau, a);
        let phi_total = axis_transition(dt_total, a);
        let q_tau = axis_noise(dt_tau, a, qc[axis]);
        let q_total = axis_noise(dt_total, a, qc[axis]);
        // Q(dt_total) is positive definite for dt_total > 0 and qc > 0;
        // configuration validation enforces both.
        let q_total_inv = q_total
            .try_inverse()
            .unwrap_or_else(Matrix3::identity);
        let psi_axis = q_tau * phi_rest.transpose() * q_total_inv;
        let lambda_axis = phi_tau - psi_axis * phi_total;
        for r in 0..3 {
            for c in 0..3 {
                lambda[r][c][axis] = lambda_axis[(r, c)];
                psi[r][c][axis] = psi_axis[(r, c)];
            }
        }
    }
    InterpWeights { lambda, psi }
}
