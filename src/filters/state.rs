use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::types::{StateMat, StateVec, IDX_A, IDX_THETA, IDX_V, IDX_W, IDX_X, IDX_Y};

/// Planar kinematic state
///
/// State Vector (6D):
/// [0-1]: Position (x, y) in the world frame (meters)
/// [2]:   Speed magnitude v (m/s), never negative
/// [3]:   Acceleration magnitude a (m/s²), never negative
/// [4]:   Heading theta, world frame, wrapped to [-π, π)
/// [5]:   Yaw rate w (rad/s)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanarState {
    pub x: f64,
    pub y: f64,
    pub v: f64,
    pub a: f64,
    pub theta: f64,
    pub w: f64,
}

impl PlanarState {
    pub fn from_vector(vector: &StateVec) -> Self {
        Self {
            x: vector[IDX_X],
            y: vector[IDX_Y],
            v: vector[IDX_V],
            a: vector[IDX_A],
            theta: vector[IDX_THETA],
            w: vector[IDX_W],
        }
    }

    pub fn to_vector(&self) -> StateVec {
        StateVec::new(self.x, self.y, self.v, self.a, self.theta, self.w)
    }

    pub fn heading_deg(&self) -> f64 {
        self.theta.to_degrees()
    }
}

impl From<[f64; 6]> for PlanarState {
    fn from(values: [f64; 6]) -> Self {
        Self::from_vector(&StateVec::from(values))
    }
}

/// Wrap an angle to [-π, π).
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    // rem_euclid may round up to exactly 2π
    if wrapped >= PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}

/// Enforce the state invariants: non-negative magnitudes, wrapped heading.
pub fn normalize_state(state: &mut StateVec) {
    state[IDX_V] = state[IDX_V].max(0.0);
    state[IDX_A] = state[IDX_A].max(0.0);
    state[IDX_THETA] = wrap_angle(state[IDX_THETA]);
}

/// Force symmetry: P = (P + Pᵀ) / 2
pub fn symmetrize(covariance: &StateMat) -> StateMat {
    (covariance + covariance.transpose()) * 0.5
}
