//! Geofence admission gate.
use crate::error::{AttendanceError, DeviceKind};
use crate::model::{Coordinate, WorkSite};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Why a one-shot location acquisition did not produce a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationFailure {
    PermissionDenied,
    TimedOut,
    Unavailable,
}

/// Great-circle distance in meters between two points (haversine).
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Distance of an admitted position from the site center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admitted {
    pub position: Coordinate,
    pub distance_m: f64,
}

/// Admit `position` iff it lies within the site's radius.
pub fn admit(site: &WorkSite, position: Coordinate) -> Result<Admitted, AttendanceError> {
    let distance_m = haversine_distance(site.center(), position);
    if distance_m <= site.radius_meters {
        Ok(Admitted {
            position,
            distance_m,
        })
    } else {
        Err(AttendanceError::GeofenceViolation {
            distance_m: distance_m.round() as u64,
            radius_m: site.radius_meters,
        })
    }
}

/// Full gate: site assignment first, then the acquisition outcome, then
/// the distance check. Every failure is hard-blocking.
pub fn check(
    site: Option<&WorkSite>,
    fix: Result<Coordinate, LocationFailure>,
) -> Result<Admitted, AttendanceError> {
    let site = site.ok_or(AttendanceError::NoSiteAssigned)?;
    let position = fix.map_err(|failure| match failure {
        LocationFailure::PermissionDenied => AttendanceError::PermissionDenied(DeviceKind::Location),
        LocationFailure::TimedOut | LocationFailure::Unavailable => {
            AttendanceError::LocationUnavailable
        }
    })?;
    if !position.is_valid() {
        return Err(AttendanceError::LocationUnavailable);
    }
    admit(site, position)
}
