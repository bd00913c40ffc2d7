use nalgebra::Vector4;
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};
use crate::filters::state::{normalize_state, symmetrize};
use crate::types::{
    InnovationCov, KalmanGain, MeasurementNoise, ObservationMat, ObservationVec, StateMat,
    StateVec, IDX_A, IDX_W, IDX_X, IDX_Y,
};

/// Smallest accepted ratio between the extreme Cholesky pivots (squared).
/// Below this S is treated as singular.
const MIN_PIVOT_RATIO: f64 = 1e-12;

/// One correction input: planar fix plus the inertial reading preceding it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub x: f64,
    pub y: f64,
    /// Planar acceleration magnitude [m/s²]
    pub accel_magnitude: f64,
    /// Yaw rate [rad/s]
    pub yaw_rate: f64,
}

impl Observation {
    pub fn to_vector(&self) -> ObservationVec {
        ObservationVec::new(self.x, self.y, self.accel_magnitude, self.yaw_rate)
    }
}

/// Result of a successful update
#[derive(Clone, Debug)]
pub struct Correction {
    pub state: StateVec,
    pub covariance: StateMat,
    /// z − H·x̂ before the update
    pub innovation: ObservationVec,
}

impl Correction {
    /// Horizontal distance between fix and prediction [m]
    pub fn position_residual(&self) -> f64 {
        self.innovation[0].hypot(self.innovation[1])
    }
}

#[derive(Clone, Debug)]
pub struct MeasurementCorrector {
    noise: MeasurementNoise,
}

impl MeasurementCorrector {
    pub fn new(noise: MeasurementNoise) -> Self {
        Self { noise }
    }

    /// Diagonal R from the four measurement variances.
    pub fn from_variances(gnss_x: f64, gnss_y: f64, accel_meas: f64, gyro_meas: f64) -> Self {
        Self::new(MeasurementNoise::from_diagonal(&Vector4::new(
            gnss_x, gnss_y, accel_meas, gyro_meas,
        )))
    }

    pub fn noise(&self) -> &MeasurementNoise {
        &self.noise
    }

    pub fn correct(
        &self,
        state: &StateVec,
        covariance: &StateMat,
        observation: &Observation,
    ) -> FusionResult<Correction> {
        correct(state, covariance, &observation.to_vector(), &self.noise)
    }
}

/// H picks [x, y, a, w] out of the state.
pub fn observation_matrix() -> ObservationMat {
    let mut h = ObservationMat::zeros();
    h[(0, IDX_X)] = 1.0;
    h[(1, IDX_Y)] = 1.0;
    h[(2, IDX_A)] = 1.0;
    h[(3, IDX_W)] = 1.0;
    h
}

/// Invert the innovation covariance, refusing near-singular matrices.
fn invert_innovation(s: &InnovationCov) -> FusionResult<InnovationCov> {
    if s.iter().any(|v| !v.is_finite()) {
        return Err(FusionError::SingularInnovation);
    }
    if s.diagonal().iter().any(|&d| d <= 0.0) {
        return Err(FusionError::SingularInnovation);
    }

    let chol = (*s).cholesky().ok_or(FusionError::SingularInnovation)?;

    let pivots = chol.l_dirty().diagonal();
    let max = pivots.max();
    let min = pivots.min();
    if !(max > 0.0) || (min / max).powi(2) < MIN_PIVOT_RATIO {
        return Err(FusionError::SingularInnovation);
    }

    Ok(chol.inverse())
}

/// Standard EKF update with a linear observation.
///
/// On `SingularInnovation` nothing is modified and the caller keeps the
/// predicted state.
pub fn correct(
    state: &StateVec,
    covariance: &StateMat,
    z: &ObservationVec,
    r: &MeasurementNoise,
) -> FusionResult<Correction> {
    let h = observation_matrix();

    let innovation = z - h * state;
    let s = h * covariance * h.transpose() + r;
    let s_inv = invert_innovation(&s)?;

    let k: KalmanGain = covariance * h.transpose() * s_inv;

    let mut state_upd = state + k * innovation;
    normalize_state(&mut state_upd);

    let i_kh = StateMat::identity() - k * h;
    let covariance_upd = symmetrize(&(i_kh * covariance));

    Ok(Correction {
        state: state_upd,
        covariance: covariance_upd,
        innovation,
    })
}
