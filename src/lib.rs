//! Planar GNSS/IMU state estimation.
//!
//! An extended Kalman filter over `[x, y, v, a, theta, w]` fed by two
//! asynchronous producers: inertial samples on the local clock and UTC-stamped
//! position fixes. See [`sensor_fusion::FusionEngine`] for the entry point.

pub mod buffer;
pub mod clock;
pub mod error;
pub mod feed;
pub mod filters;
pub mod geodesy;
pub mod live_status;
pub mod sensor_fusion;
pub mod sensors;
pub mod types;

pub use error::{FusionError, FusionResult};
pub use sensor_fusion::{
    EngineStatus, EngineSummary, FusionConfig, FusionEngine, FusionEvent, FusionSnapshot,
    ShutdownHandle, StateHandle,
};
