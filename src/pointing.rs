// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;
use serde::Serialize;

use crate::astro_util::{angular_separation, SkyCoordinate};
use crate::units::{wrap_degrees_180, AngularValue, Unit};
use crate::wcs_info::CalibrationRecord;

/// How far a solved position lies from where the mount was pointed. The
/// deltas are nominal minus solved, each in arcseconds, so a positive
/// delta means the telescope is pointed at a lower coordinate than
/// commanded.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PointingError {
    pub delta_ra: AngularValue,
    pub delta_dec: AngularValue,
    // Great-circle distance between the two positions.
    pub separation: AngularValue,
}

impl PointingError {
    pub fn between(nominal: &SkyCoordinate, solved: &SkyCoordinate) -> Self {
        // SkyCoordinate holds degrees.
        let d_ra = wrap_degrees_180(nominal.ra().value - solved.ra().value);
        let d_dec = nominal.dec().value - solved.dec().value;
        let separation = angular_separation(nominal, solved).value;
        PointingError{
            delta_ra: AngularValue::new(d_ra * 3600.0, Unit::Arcsecond),
            delta_dec: AngularValue::new(d_dec * 3600.0, Unit::Arcsecond),
            separation: AngularValue::new(separation * 3600.0, Unit::Arcsecond),
        }
    }

    /// Pointing error of a solved image relative to `nominal`. Fails if the
    /// image's calibration has no center.
    pub fn from_record(nominal: &SkyCoordinate, solved: &CalibrationRecord)
                       -> Result<Self, CanonicalError> {
        Ok(PointingError::between(nominal, &solved.require_center()?))
    }

    /// Pointing error from offsets alone. Without the positions the
    /// separation is the flat-sky approximation sqrt(dRA^2 + dDec^2), which
    /// is close to the great-circle distance only for small offsets near
    /// the equator.
    pub fn from_arcseconds(delta_ra: f64, delta_dec: f64) -> Self {
        PointingError{
            delta_ra: AngularValue::arcseconds(delta_ra),
            delta_dec: AngularValue::arcseconds(delta_dec),
            separation: AngularValue::arcseconds(delta_ra.hypot(delta_dec)),
        }
    }
}
