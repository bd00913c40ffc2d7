//! Constant-acceleration / constant-yaw-rate prediction step
//!
//! Over an interval T the heading turns by w·T, the speed grows by a·T and
//! the position advances along the heading held at the start of the interval:
//!
//!   theta' = theta + w·T
//!   v'     = max(0, v + a·T)
//!   x'     = x + v·cos(theta)·T
//!   y'     = y + v·sin(theta)·T
//!   a'     = a,  w' = w
//!
//! Covariance is carried through the analytic Jacobian: P' = F·P·Fᵀ + Q.

use crate::error::{FusionError, FusionResult};
use crate::filters::state::{normalize_state, symmetrize};
use crate::types::{
    NoiseCov, NoiseShaping, StateMat, StateVec, IDX_A, IDX_THETA, IDX_V, IDX_W, IDX_X, IDX_Y,
};

#[derive(Clone, Debug)]
pub struct StatePredictor {
    /// Process noise matrix [6x6], built once from the sensor variances
    process_noise: StateMat,
}

impl StatePredictor {
    /// `accel_variance` [m²/s⁴] lands on `a`, `gyro_variance` [rad²/s²] on `w`.
    pub fn new(accel_variance: f64, gyro_variance: f64) -> Self {
        Self {
            process_noise: Self::build_process_noise(accel_variance, gyro_variance),
        }
    }

    /// Q = S·diag(σa², σw²)·Sᵀ
    ///
    /// No other state gets direct noise; their uncertainty only grows through
    /// the Jacobian.
    fn build_process_noise(accel_variance: f64, gyro_variance: f64) -> StateMat {
        let mut shaping = NoiseShaping::zeros();
        shaping[(IDX_A, 0)] = 1.0;
        shaping[(IDX_W, 1)] = 1.0;

        let sensor_noise = NoiseCov::from_diagonal(&nalgebra::Vector2::new(
            accel_variance,
            gyro_variance,
        ));
        shaping * sensor_noise * shaping.transpose()
    }

    pub fn process_noise(&self) -> &StateMat {
        &self.process_noise
    }

    /// Propagate the state vector alone (no wrap, no covariance).
    pub fn transition(state: &StateVec, dt: f64) -> StateVec {
        let v = state[IDX_V];
        let a = state[IDX_A];
        let theta = state[IDX_THETA];
        let w = state[IDX_W];

        let mut next = *state;
        next[IDX_X] = state[IDX_X] + v * theta.cos() * dt;
        next[IDX_Y] = state[IDX_Y] + v * theta.sin() * dt;
        next[IDX_V] = (v + a * dt).max(0.0);
        next[IDX_THETA] = theta + w * dt;
        next
    }

    /// Jacobian of [`StatePredictor::transition`] at the pre-update state.
    pub fn jacobian(state: &StateVec, dt: f64) -> StateMat {
        let v = state[IDX_V];
        let theta = state[IDX_THETA];
        let (sin_t, cos_t) = theta.sin_cos();

        let mut f = StateMat::identity();

        f[(IDX_X, IDX_V)] = cos_t * dt;
        f[(IDX_X, IDX_THETA)] = -v * dt * sin_t;

        f[(IDX_Y, IDX_V)] = sin_t * dt;
        f[(IDX_Y, IDX_THETA)] = v * dt * cos_t;

        f[(IDX_V, IDX_A)] = dt;

        f[(IDX_THETA, IDX_W)] = dt;

        f
    }

    /// Advance (state, covariance) by `dt` seconds.
    ///
    /// Fails with `InvalidInterval` when `dt <= 0`.
    pub fn predict(
        &self,
        state: &StateVec,
        covariance: &StateMat,
        dt: f64,
    ) -> FusionResult<(StateVec, StateMat)> {
        if !(dt > 0.0) || !dt.is_finite() {
            return Err(FusionError::InvalidInterval(dt));
        }

        let f = Self::jacobian(state, dt);

        let mut state_pred = Self::transition(state, dt);
        normalize_state(&mut state_pred);

        let covariance_pred = symmetrize(&(f * covariance * f.transpose() + self.process_noise));

        Ok((state_pred, covariance_pred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    fn predictor() -> StatePredictor {
        StatePredictor::new(0.25, 0.01)
    }

    #[test]
    fn test_process_noise_shape() {
        let q = *predictor().process_noise();
        for i in 0..6 {
            for j in 0..6 {
                let expected = match (i, j) {
                    (IDX_A, IDX_A) => 0.25,
                    (IDX_W, IDX_W) => 0.01,
                    _ => 0.0,
                };
                assert_eq!(q[(i, j)], expected, "Q[{i},{j}]");
            }
        }
    }

    #[test]
    fn test_straight_line_constant_velocity() {
        let p = predictor();
        for &(v, theta) in &[(1.0, 0.0), (3.5, 0.7), (2.0, -2.5), (0.4, PI / 2.0)] {
            for &dt in &[0.005, 0.1, 1.0, 7.5] {
                let state = StateVec::new(10.0, -4.0, v, 0.0, theta, 0.0);
                let (next, _) = p.predict(&state, &StateMat::identity(), dt).unwrap();

                assert_abs_diff_eq!(next[IDX_X], 10.0 + v * dt * theta.cos(), epsilon = 1e-9);
                assert_abs_diff_eq!(next[IDX_Y], -4.0 + v * dt * theta.sin(), epsilon = 1e-9);
                assert_abs_diff_eq!(next[IDX_V], v, epsilon = 1e-12);
                assert_abs_diff_eq!(next[IDX_THETA], theta, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_acceleration_and_turn_rate_integrate() {
        let state = StateVec::new(0.0, 0.0, 2.0, 0.5, 0.0, 0.1);
        let (next, _) = predictor()
            .predict(&state, &StateMat::identity(), 0.2)
            .unwrap();
        assert_abs_diff_eq!(next[IDX_V], 2.1, epsilon = 1e-12);
        assert_abs_diff_eq!(next[IDX_THETA], 0.02, epsilon = 1e-12);
        assert_abs_diff_eq!(next[IDX_A], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(next[IDX_W], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_heading_wrapped_after_predict() {
        let state = StateVec::new(0.0, 0.0, 1.0, 0.0, 3.1, 2.0);
        let (next, _) = predictor()
            .predict(&state, &StateMat::identity(), 0.5)
            .unwrap();
        assert!((-PI..PI).contains(&next[IDX_THETA]));
        assert_abs_diff_eq!(next[IDX_THETA], 4.1 - 2.0 * PI, epsilon = 1e-9);
    }

    #[test]
    fn test_non_positive_interval_rejected() {
        let p = predictor();
        let state = StateVec::zeros();
        for dt in [0.0, -0.01, f64::NAN] {
            let err = p.predict(&state, &StateMat::identity(), dt).unwrap_err();
            assert!(matches!(err, FusionError::InvalidInterval(_)));
        }
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let eps = 1e-6;
        let dt = 0.05;
        for state in [
            StateVec::new(1.0, 2.0, 3.0, 0.4, 0.3, 0.2),
            StateVec::new(-5.0, 0.5, 12.0, 1.2, -2.2, -0.6),
            StateVec::new(0.0, 0.0, 0.5, 0.0, 1.4, 0.0),
        ] {
            let analytic = StatePredictor::jacobian(&state, dt);
            let base = StatePredictor::transition(&state, dt);

            let mut numeric = StateMat::zeros();
            for j in 0..6 {
                let mut perturbed = state;
                perturbed[j] += eps;
                let column = (StatePredictor::transition(&perturbed, dt) - base) / eps;
                numeric.column_mut(j).copy_from(&column);
            }

            for i in 0..6 {
                for j in 0..6 {
                    assert_abs_diff_eq!(analytic[(i, j)], numeric[(i, j)], epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_covariance_stays_symmetric_and_grows() {
        let p = predictor();
        let mut state = StateVec::new(0.0, 0.0, 1.0, 0.0, 0.0, 0.0);
        let mut cov = StateMat::identity() * 0.1;
        let mut last_trace = cov.trace();

        for _ in 0..50 {
            let (s, c) = p.predict(&state, &cov, 0.1).unwrap();
            assert_eq!(c, c.transpose());
            assert!(c.trace() > last_trace);
            // PSD: all eigenvalues non-negative
            let eig = c.symmetric_eigen();
            assert!(eig.eigenvalues.iter().all(|&l| l > -1e-9));
            last_trace = c.trace();
            state = s;
            cov = c;
        }
    }
}
