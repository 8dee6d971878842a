//! Robust loss functions for iteratively reweighted least squares.
//!
//! Each variant exposes a single IRLS weight as a function of the squared
//! whitened residual; the solver scales residual and Jacobian by the square
//! root of that weight.

use serde::{Deserialize, Serialize};

/// Tagged robust loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RobustLoss {
    /// Plain least squares.
    L2,
    /// Absolute-value loss; weight `1 / |e|`, saturating below a small
    /// residual so the reweighting stays bounded at convergence.
    L1,
    /// Dynamic covariance scaling with parameter `k`;
    /// weight `min(1, (2k / (k + e^2))^2)`.
    Dcs(f64),
    /// Cauchy loss with scale `k`; weight `1 / (1 + (e/k)^2)`.
    Cauchy(f64),
    /// Geman-McClure loss with scale `k`; weight `(k^2 / (k^2 + e^2))^2`.
    GemanMcClure(f64),
}

impl RobustLoss {
    /// IRLS weight for a squared whitened residual.
    pub fn weight(&self, sq_error: f64) -> f64 {
        match *self {
            RobustLoss::L2 => 1.0,
            RobustLoss::L1 => {
                let e = sq_error.sqrt().max(1e-3);
                1.0 / e
            }
            RobustLoss::Dcs(k) => {
                let s = 2.0 * k / (k + sq_error);
                (s * s).min(1.0)
            }
            RobustLoss::Cauchy(k) => 1.0 / (1.0 + sq_error / (k * k)),
            RobustLoss::GemanMcClure(k) => {
                let k2 = k * k;
                let s = k2 / (k2 + sq_error);
                s * s
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn l2_weight_is_constant() {
        assert_eq!(RobustLoss::L2.weight(0.0), 1.0);
        assert_eq!(RobustLoss::L2.weight(100.0), 1.0);
    }

    #[test]
    fn cauchy_halves_at_scale() {
        let loss = RobustLoss::Cauchy(0.5);
        assert_relative_eq!(loss.weight(0.25), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn dcs_clamps_inliers_to_unity() {
        let loss = RobustLoss::Dcs(1.0);
        assert_eq!(loss.weight(0.5), 1.0);
        assert!(loss.weight(10.0) < 1.0);
    }

    #[test]
    fn weights_are_non_increasing() {
        for loss in [
            RobustLoss::L1,
            RobustLoss::Dcs(1.0),
            RobustLoss::Cauchy(1.0),
            RobustLoss::GemanMcClure(1.0),
        ] {
            let mut last = f64::INFINITY;
            for e2 in [1e-6, 0.01, 0.1, 1.0, 10.0, 100.0] {
                let w = loss.weight(e2);
                assert!(w <= last + 1e-12, "{loss:?} increased at {e2}");
                last = w;
            }
        }
    }
}
