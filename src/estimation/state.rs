//! Arena of state variables shared by all factors.
//!
//! Factors never hold references into the arena; they store [`VarKey`]s and
//! look values up at linearization time. Keys are append-only, so interpolators
//! and factors built inside parallel sections stay valid for the whole solve.

use nalgebra::Vector6;

use crate::core::math::SE3;

/// Index of a variable in the arena.
pub type VarKey = usize;

/// Value stored for one variable. Every variable perturbs in 6 dimensions.
#[derive(Debug, Clone, Copy)]
pub enum VarValue {
    /// An SE(3) pose, perturbed on the left: `T <- exp(delta) * T`.
    Pose(SE3),
    /// A plain 6-vector, perturbed additively.
    Vector(Vector6<f64>),
}

#[derive(Debug, Clone)]
struct VarEntry {
    value: VarValue,
    locked: bool,
}

/// Append-only variable arena.
#[derive(Debug, Default, Clone)]
pub struct StateVector {
    vars: Vec<VarEntry>,
}

impl StateVector {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pose variable.
    pub fn add_pose(&mut self, value: SE3) -> VarKey {
        self.vars.push(VarEntry {
            value: VarValue::Pose(value),
            locked: false,
        });
        self.vars.len() - 1
    }

    /// Register a 6-vector variable.
    pub fn add_vector(&mut self, value: Vector6<f64>) -> VarKey {
        self.vars.push(VarEntry {
            value: VarValue::Vector(value),
            locked: false,
        });
        self.vars.len() - 1
    }

    /// Number of registered variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// True when no variables are registered.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Raw value of a variable.
    pub fn value(&self, key: VarKey) -> VarValue {
        self.vars[key].value
    }

    /// Pose value of a pose variable.
    ///
    /// Panics if `key` names a vector variable; key kinds are fixed at
    /// registration and mixing them up is a programming error.
    pub fn pose(&self, key: VarKey) -> SE3 {
        match self.vars[key].value {
            VarValue::Pose(t) => t,
            VarValue::Vector(_) => panic!("variable {key} is not a pose"),
        }
    }

    /// Vector value of a vector variable.
    pub fn vector(&self, key: VarKey) -> Vector6<f64> {
        match self.vars[key].value {
            VarValue::Vector(v) => v,
            VarValue::Pose(_) => panic!("variable {key} is not a vector"),
        }
    }

    /// Overwrite a pose variable.
    pub fn set_pose(&mut self, key: VarKey, value: SE3) {
        match &mut self.vars[key].value {
            VarValue::Pose(t) => *t = value,
            VarValue::Vector(_) => panic!("variable {key} is not a pose"),
        }
    }

    /// Overwrite a vector variable.
    pub fn set_vector(&mut self, key: VarKey, value: Vector6<f64>) {
        match &mut self.vars[key].value {
            VarValue::Vector(v) => *v = value,
            VarValue::Pose(_) => panic!("variable {key} is not a vector"),
        }
    }

    /// Lock or unlock a variable. Locked variables are held constant by every
    /// solver.
    pub fn set_locked(&mut self, key: VarKey, locked: bool) {
        self.vars[key].locked = locked;
    }

    /// Whether a variable is locked.
    pub fn is_locked(&self, key: VarKey) -> bool {
        self.vars[key].locked
    }

    /// Apply a 6-dof solver step to a variable.
    pub fn apply_step(&mut self, key: VarKey, step: &Vector6<f64>) {
        match &mut self.vars[key].value {
            VarValue::Pose(t) => *t = SE3::exp(step).compose(t),
            VarValue::Vector(v) => *v += step,
        }
    }

    /// Local difference `value ⊖ reference` used by the marginal prior.
    pub fn local_diff(&self, key: VarKey, reference: &VarValue) -> Vector6<f64> {
        match (self.vars[key].value, reference) {
            (VarValue::Pose(t), VarValue::Pose(r)) => t.compose(&r.inverse()).log(),
            (VarValue::Vector(v), VarValue::Vector(r)) => v - r,
            _ => panic!("variable {key} kind changed since linearization"),
        }
    }
}
