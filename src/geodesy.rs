//! Geodetic helpers used around the estimator (not by it)
//!
//! The position source projects fixes into a local planar frame before they
//! reach the filter, and the simulator walks body-frame displacements into the
//! world frame.

use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

const EARTH_RADIUS: f64 = 6_371_000.0; // meters

/// Equirectangular projection about a fixed origin.
///
/// Accurate to well under a metre over the few kilometres a single session
/// covers; x points East, y points North.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalProjection {
    origin_lat: f64,
    origin_lon: f64,
}

impl LocalProjection {
    pub fn new(origin_lat: f64, origin_lon: f64) -> Self {
        Self {
            origin_lat,
            origin_lon,
        }
    }

    /// Origin as (lat, lon) in degrees
    pub fn origin(&self) -> (f64, f64) {
        (self.origin_lat, self.origin_lon)
    }

    /// Convert lat/lon (degrees) to local meters relative to origin
    pub fn to_local(&self, lat: f64, lon: f64) -> (f64, f64) {
        let d_lat = (lat - self.origin_lat).to_radians();
        let d_lon = (lon - self.origin_lon).to_radians();
        let x = EARTH_RADIUS * d_lon * self.origin_lat.to_radians().cos();
        let y = EARTH_RADIUS * d_lat;
        (x, y)
    }

    /// Inverse of [`LocalProjection::to_local`], returns (lat, lon) in degrees
    pub fn to_geodetic(&self, x: f64, y: f64) -> (f64, f64) {
        let lat = self.origin_lat + (y / EARTH_RADIUS).to_degrees();
        let lon = self.origin_lon
            + (x / (EARTH_RADIUS * self.origin_lat.to_radians().cos())).to_degrees();
        (lat, lon)
    }
}

/// Great-circle distance between two fixes [m]
pub fn haversine_distance(lat_a: f64, lon_a: f64, lat_b: f64, lon_b: f64) -> f64 {
    Point::new(lon_a, lat_a).haversine_distance(&Point::new(lon_b, lat_b))
}

/// Move a world position by a displacement expressed in the body frame.
///
/// `theta` is the yaw of the body's forward (y) axis measured from the world
/// x axis, so a purely forward step `(0, d)` moves the body `d` metres along
/// `theta`.
pub fn body_to_world(
    x_body: f64,
    y_body: f64,
    x_world_prev: f64,
    y_world_prev: f64,
    theta: f64,
) -> (f64, f64) {
    let r = (x_body * x_body + y_body * y_body).sqrt();
    let phi = theta + x_body.atan2(y_body);
    (x_world_prev + r * phi.cos(), y_world_prev + r * phi.sin())
}
