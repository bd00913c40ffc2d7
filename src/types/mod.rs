pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Anything that can be placed on the estimator's local timeline.
pub trait Timestamped {
    /// Local time of day in seconds since local midnight.
    fn timestamp(&self) -> f64;
}

/// Combined accelerometer + gyroscope reading from the inertial source.
///
/// `t_local` is seconds since local midnight on the estimator's clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InertialSample {
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub t_local: f64,
}

impl InertialSample {
    /// Reading carrying only the components the planar filter consumes.
    pub fn planar(acc_x: f64, acc_y: f64, gyro_z: f64, t_local: f64) -> Self {
        Self {
            acc_x,
            acc_y,
            acc_z: 0.0,
            gyro_x: 0.0,
            gyro_y: 0.0,
            gyro_z,
            t_local,
        }
    }

    /// Magnitude of the horizontal acceleration [m/s²]
    pub fn planar_accel_magnitude(&self) -> f64 {
        (self.acc_x * self.acc_x + self.acc_y * self.acc_y).sqrt()
    }

    /// Angular rate about the vertical axis [rad/s]
    pub fn yaw_rate(&self) -> f64 {
        self.gyro_z
    }
}

impl Timestamped for InertialSample {
    fn timestamp(&self) -> f64 {
        self.t_local
    }
}

/// UTC time of day as reported by the navigation receiver.
///
/// The hour is signed so that out-of-range values coming off the wire can be
/// represented and rejected by the clock aligner instead of wrapping silently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtcTimeOfDay {
    pub hour: i32,
    pub minute: u32,
    pub second: u32,
    #[serde(default)]
    pub microsecond: u32,
}

impl UtcTimeOfDay {
    pub fn new(hour: i32, minute: u32, second: u32, microsecond: u32) -> Self {
        Self {
            hour,
            minute,
            second,
            microsecond,
        }
    }
}

impl fmt::Display for UtcTimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}.{:06}Z",
            self.hour, self.minute, self.second, self.microsecond
        )
    }
}

/// Raw fix from the position source (degrees, UTC stamp, receiver validity flag).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GnssFix {
    pub longitude: f64,
    pub latitude: f64,
    pub utc: UtcTimeOfDay,
    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl GnssFix {
    /// Zero longitude or latitude is the receiver's "no fix" sentinel.
    pub fn is_usable(&self) -> bool {
        self.valid
            && self.longitude != 0.0
            && self.latitude != 0.0
            && self.longitude.is_finite()
            && self.latitude.is_finite()
    }
}

/// A fix after planar projection and clock alignment, as stored in the buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// East offset from the projection origin [m]
    pub x: f64,
    /// North offset from the projection origin [m]
    pub y: f64,
    /// Local time of day [s]
    pub t_local: f64,
}

impl Timestamped for PositionSample {
    fn timestamp(&self) -> f64 {
        self.t_local
    }
}

/// The two producer classes feeding the estimator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Inertial,
    Position,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Inertial => write!(f, "inertial"),
            SourceKind::Position => write!(f, "position"),
        }
    }
}
