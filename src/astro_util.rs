// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use astro::angle::limit_to_two_PI;
use astro::time::{CalType, Date, julian_day, mn_sidr};
use canonical_error::CanonicalError;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;

use crate::error::configuration_error;
use crate::units::{AngularValue, Unit};

/// Length of the sidereal day, in solar hours.
pub const SIDEREAL_DAY_HOURS: f64 = 23.9344699;

/// Apparent motion of the sky, in arcseconds per second of time.
pub const SIDEREAL_RATE: f64 = 360.0 * 3600.0 / (SIDEREAL_DAY_HOURS * 3600.0);

/// A point on the celestial sphere. Right ascension is kept in [0, 360)
/// degrees and declination in [-90, 90] degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SkyCoordinate {
    ra: AngularValue,
    dec: AngularValue,
}

impl SkyCoordinate {
    pub fn new(ra: AngularValue, dec: AngularValue)
               -> Result<Self, CanonicalError> {
        let ra_deg = ra.in_degrees()?;
        let dec_deg = dec.in_degrees()?;
        if !ra_deg.is_finite() || !dec_deg.is_finite() {
            return Err(configuration_error(
                format!("non-finite coordinate ra={} dec={}", ra, dec).as_str()));
        }
        if !(-90.0..=90.0).contains(&dec_deg) {
            return Err(configuration_error(
                format!("declination {} outside [-90, 90]", dec_deg).as_str()));
        }
        // rem_euclid rounds tiny negatives up to exactly 360.
        let ra_deg = match ra_deg.rem_euclid(360.0) {
            r if r >= 360.0 => 0.0,
            r => r,
        };
        Ok(SkyCoordinate{
            ra: AngularValue::degrees(ra_deg),
            dec: AngularValue::degrees(dec_deg),
        })
    }

    pub fn from_degrees(ra: f64, dec: f64) -> Result<Self, CanonicalError> {
        SkyCoordinate::new(AngularValue::degrees(ra), AngularValue::degrees(dec))
    }

    pub fn ra(&self) -> AngularValue {
        self.ra
    }

    pub fn dec(&self) -> AngularValue {
        self.dec
    }
}

/// Convert ra/dec (radians) to x/y/z on unit sphere.
pub fn to_unit_vector(ra: f64, dec: f64) -> [f64; 3] {
    [
        (ra.cos() * dec.cos()), // x
        (ra.sin() * dec.cos()), // y
        dec.sin(),
    ] // z
}

/// Returns the great-circle separation, in radians, between the given
/// celestial coordinates (in radians). Vincenty formula.
pub fn great_circle_distance(p0_ra: f64, p0_dec: f64,
                             p1_ra: f64, p1_dec: f64) -> f64 {
    let d_ra = p1_ra - p0_ra;
    let (sin_d_ra, cos_d_ra) = d_ra.sin_cos();
    let (sin_dec0, cos_dec0) = p0_dec.sin_cos();
    let (sin_dec1, cos_dec1) = p1_dec.sin_cos();

    let num1 = cos_dec1 * sin_d_ra;
    let num2 = cos_dec0 * sin_dec1 - sin_dec0 * cos_dec1 * cos_d_ra;
    let den = sin_dec0 * sin_dec1 + cos_dec0 * cos_dec1 * cos_d_ra;
    (num1 * num1 + num2 * num2).sqrt().atan2(den)
}

/// Angular separation between two sky coordinates, in degrees.
pub fn angular_separation(p0: &SkyCoordinate, p1: &SkyCoordinate)
                          -> AngularValue {
    // SkyCoordinate always holds degrees.
    let sep = great_circle_distance(p0.ra.value.to_radians(),
                                    p0.dec.value.to_radians(),
                                    p1.ra.value.to_radians(),
                                    p1.dec.value.to_radians());
    AngularValue::new(sep.to_degrees(), Unit::Degree)
}

/// Returns the hour angle of `ra` (degrees) for an observer at `longitude`
/// (degrees, east positive) at `time`. Result is in hours, -12..12; negative
/// is east of the meridian.
pub fn hour_angle(ra: f64, longitude: f64, time: &DateTime<Utc>) -> f64 {
    let gmst = greenwich_mean_sidereal_time(time);
    let mut ha = limit_to_two_PI(gmst + longitude.to_radians() - ra.to_radians());
    if ha >= std::f64::consts::PI {
        ha -= 2.0 * std::f64::consts::PI;
    }
    ha.to_degrees() / 15.0
}

/// Normalizes an hour angle in hours into -12..12.
pub fn normalize_hour_angle(hours: f64) -> f64 {
    (hours + 12.0).rem_euclid(24.0) - 12.0
}

// Radians, 0..2pi.
fn greenwich_mean_sidereal_time(time: &DateTime<Utc>) -> f64 {
    let date = Date{
        year: time.date_naive().year() as i16,
        month: time.date_naive().month() as u8,
        decimal_day: time.date_naive().day() as f64,
        cal_type: CalType::Gregorian,
    };
    let jd = julian_day(&date);

    let utc_hours = time.time().num_seconds_from_midnight() as f64 / 3600.0;
    let gmst_hours =
        mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;

    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}
