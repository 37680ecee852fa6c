//! Start-position interpolation.
//!
//! A trip that begins very close to where the vehicle's previous trip ended is
//! treated as a continuation with a sensor gap, and the previous end point
//! becomes the estimate for the new start.

use serde::{Deserialize, Serialize};

/// Distance under which a prior end point may stand in for a new start point.
pub const INTERPOLATION_THRESHOLD_MILES: f64 = 0.25;

/// Mean earth radius in miles.
const EARTH_RADIUS_MILES: f64 = 3958.0;

/// A WGS-84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

impl Point {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Great-circle distance between two points, in miles.
pub fn haversine_miles(a: &Point, b: &Point) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_MILES * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Whether `prior_end` is close enough to `candidate_start` to be recorded as
/// the start estimate. Absent inputs never qualify.
pub fn should_estimate(prior_end: Option<&Point>, candidate_start: Option<&Point>) -> bool {
    match (prior_end, candidate_start) {
        (Some(prior), Some(candidate)) => {
            haversine_miles(prior, candidate) < INTERPOLATION_THRESHOLD_MILES
        }
        _ => false,
    }
}
