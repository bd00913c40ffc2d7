//! Linear algebra type system for the planar estimator
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the predictor and corrector.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 6; // [x, y, v, a, theta, w]

// ===== Measurement Dimensions =====
pub const MEASURE_DIM: usize = 4; // [x, y, |a|, w]

// ===== Process Noise Dimensions =====
pub const NOISE_DIM: usize = 2; // accelerometer, gyroscope

// ===== State Indices =====
pub const IDX_X: usize = 0;
pub const IDX_Y: usize = 1;
pub const IDX_V: usize = 2;
pub const IDX_A: usize = 3;
pub const IDX_THETA: usize = 4;
pub const IDX_W: usize = 5;

// ===== State Types =====
pub type StateVec = SVector<f64, STATE_DIM>;
pub type StateMat = SMatrix<f64, STATE_DIM, STATE_DIM>;

// ===== Measurement Types =====
pub type ObservationVec = SVector<f64, MEASURE_DIM>;
pub type MeasurementNoise = SMatrix<f64, MEASURE_DIM, MEASURE_DIM>;
pub type InnovationCov = SMatrix<f64, MEASURE_DIM, MEASURE_DIM>;

// Observation model and Kalman gain
pub type ObservationMat = SMatrix<f64, MEASURE_DIM, STATE_DIM>; // 4×6
pub type KalmanGain = SMatrix<f64, STATE_DIM, MEASURE_DIM>; // 6×4

// ===== Process Noise Types =====
pub type NoiseShaping = SMatrix<f64, STATE_DIM, NOISE_DIM>; // 6×2
pub type NoiseCov = SMatrix<f64, NOISE_DIM, NOISE_DIM>;
