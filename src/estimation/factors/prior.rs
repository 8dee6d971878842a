//! Unary priors and random-walk factors on poses and 6-vectors.

use nalgebra::{DMatrix, DVector, Matrix6, Vector6};

use crate::core::math::se3;
use crate::core::math::SE3;
use crate::error::Result;
use crate::estimation::loss::RobustLoss;
use crate::estimation::problem::{CostTerm, LinearizedTerm, NoiseModel};
use crate::estimation::state::{StateVector, VarKey};

fn dmat6(m: &Matrix6<f64>) -> DMatrix<f64> {
    DMatrix::from_column_slice(6, 6, m.as_slice())
}

fn dvec6(v: &Vector6<f64>) -> DVector<f64> {
    DVector::from_column_slice(v.as_slice())
}

/// Pins a pose variable to a fixed target.
pub struct Se3PriorFactor {
    key: VarKey,
    target: SE3,
    noise: NoiseModel,
}

impl Se3PriorFactor {
    /// Prior with the given 6x6 covariance.
    pub fn new(key: VarKey, target: SE3, covariance: Matrix6<f64>) -> Result<Self> {
        Ok(Self {
            key,
            target,
            noise: NoiseModel::from_covariance(dmat6(&covariance))?,
        })
    }
}

impl CostTerm for Se3PriorFactor {
    fn keys(&self) -> Vec<VarKey> {
        vec![self.key]
    }

    fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
        let error = states.pose(self.key).compose(&self.target.inverse()).log();
        let jac = se3::left_jacobian_inv(&error);
        Ok(LinearizedTerm::assemble(
            vec![self.key],
            vec![dmat6(&jac)],
            dvec6(&error),
            &self.noise,
            RobustLoss::L2,
        ))
    }
}

/// Pins a vector variable to a fixed target.
pub struct VectorPriorFactor {
    key: VarKey,
    target: Vector6<f64>,
    noise: NoiseModel,
}

impl VectorPriorFactor {
    /// Prior with the given 6x6 covariance.
    pub fn new(key: VarKey, target: Vector6<f64>, covariance: Matrix6<f64>) -> Result<Self> {
        Ok(Self {
            key,
            target,
            noise: NoiseModel::from_covariance(dmat6(&covariance))?,
        })
    }
}

impl CostTerm for VectorPriorFactor {
    fn keys(&self) -> Vec<VarKey> {
        vec![self.key]
    }

    fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
        let error = states.vector(self.key) - self.target;
        Ok(LinearizedTerm::assemble(
            vec![self.key],
            vec![DMatrix::identity(6, 6)],
            dvec6(&error),
            &self.noise,
            RobustLoss::L2,
        ))
    }
}

/// Random-walk factor `from - to = 0` between two vector variables (the IMU
/// bias evolution model).
pub struct VectorDifferenceFactor {
    from: VarKey,
    to: VarKey,
    noise: NoiseModel,
}

impl VectorDifferenceFactor {
    /// Random walk with the given 6x6 covariance.
    pub fn new(from: VarKey, to: VarKey, covariance: Matrix6<f64>) -> Result<Self> {
        Ok(Self {
            from,
            to,
            noise: NoiseModel::from_covariance(dmat6(&covariance))?,
        })
    }
}

impl CostTerm for VectorDifferenceFactor {
    fn keys(&self) -> Vec<VarKey> {
        vec![self.from, self.to]
    }

    fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
        let error = states.vector(self.from) - states.vector(self.to);
        Ok(LinearizedTerm::assemble(
            vec![self.from, self.to],
            vec![DMatrix::identity(6, 6), -DMatrix::identity(6, 6)],
            dvec6(&error),
            &self.noise,
            RobustLoss::L2,
        ))
    }
}

/// Random-walk factor `log(T_to * T_from^-1) = 0` between two pose variables
/// (the gravity-alignment evolution model).
pub struct Se3RelativeFactor {
    from: VarKey,
    to: VarKey,
    noise: NoiseModel,
}

impl Se3RelativeFactor {
    /// Random walk with the given 6x6 covariance.
    pub fn new(from: VarKey, to: VarKey, covariance: Matrix6<f64>) -> Result<Self> {
        Ok(Self {
            from,
            to,
            noise: NoiseModel::from_covariance(dmat6(&covariance))?,
        })
    }
}

impl CostTerm for Se3RelativeFactor {
    fn keys(&self) -> Vec<VarKey> {
        vec![self.from, self.to]
    }

    fn linearize(&self, states: &StateVector) -> Result<LinearizedTerm> {
        let relative = states
            .pose(self.to)
            .compose(&states.pose(self.from).inverse());
        let error = relative.log();
        let jl_inv = se3::left_jacobian_inv(&error);
        let jac_to = jl_inv;
        let jac_from = -jl_inv * relative.adjoint();
        Ok(LinearizedTerm::assemble(
            vec![self.from, self.to],
            vec![dmat6(&jac_from), dmat6(&jac_to)],
            dvec6(&error),
            &self.noise,
            RobustLoss::L2,
        ))
    }
}
