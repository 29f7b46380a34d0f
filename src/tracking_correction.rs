// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use canonical_error::CanonicalError;
use serde::Serialize;

use crate::astro_util::{normalize_hour_angle, SIDEREAL_RATE};
use crate::error::configuration_error;
use crate::pointing::PointingError;
use crate::units::AngularValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Dec,
    Ra,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::North => "north",
            Direction::South => "south",
            Direction::East => "east",
            Direction::West => "west",
        })
    }
}

/// Which side of the meridian the target is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MeridianSide {
    East,
    West,
}

impl MeridianSide {
    /// Hour angle in hours; it is first normalized into [-12, 12). An hour
    /// angle of exactly zero counts as west.
    pub fn from_hour_angle(hours: f64) -> Self {
        if normalize_hour_angle(hours) >= 0.0 {
            MeridianSide::West
        } else {
            MeridianSide::East
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Sign {
    Negative,
    // Zero is grouped with the positives.
    NonNegative,
}

impl Sign {
    fn of(value: f64) -> Self {
        if value < 0.0 { Sign::Negative } else { Sign::NonNegative }
    }
}

// Correction direction for each (meridian side, offset sign). The mount's
// flip geometry happens to give the same rows on both sides, but the side
// stays part of the key.
fn dec_direction(side: MeridianSide, sign: Sign) -> Direction {
    match (side, sign) {
        (MeridianSide::West, Sign::NonNegative) => Direction::South,
        (MeridianSide::West, Sign::Negative) => Direction::North,
        (MeridianSide::East, Sign::NonNegative) => Direction::South,
        (MeridianSide::East, Sign::Negative) => Direction::North,
    }
}

fn ra_direction(side: MeridianSide, sign: Sign) -> Direction {
    match (side, sign) {
        (MeridianSide::West, Sign::NonNegative) => Direction::West,
        (MeridianSide::West, Sign::Negative) => Direction::East,
        (MeridianSide::East, Sign::NonNegative) => Direction::West,
        (MeridianSide::East, Sign::Negative) => Direction::East,
    }
}

/// Correction for one mount axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AxisCorrection {
    pub axis: Axis,

    // Size of the offset to remove, arcseconds, never negative.
    pub offset: AngularValue,

    // Length of the guide pulse that removes the offset at the configured
    // guide rate, milliseconds.
    pub pulse_ms: f64,

    pub direction: Direction,
}

impl AxisCorrection {
    /// True if there is nothing to correct on this axis.
    pub fn is_noop(&self) -> bool {
        self.offset.value == 0.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CorrectionCommand {
    pub dec: AxisCorrection,
    pub ra: AxisCorrection,
    pub meridian_side: MeridianSide,
    pub guide_rate: f64,
}

/// Milliseconds of guiding at `guide_rate` (fraction of sidereal) needed to
/// move `arcsec` arcseconds.
pub fn pulse_duration_ms(arcsec: f64, guide_rate: f64) -> f64 {
    arcsec / (SIDEREAL_RATE * guide_rate) * 1000.0
}

/// Translates a pointing error into per-axis guide corrections for a target
/// at `hour_angle` hours (negative east of the meridian). Fails only for
/// non-finite inputs or a guide rate that is not positive.
pub fn get_tracking_correction(error: &PointingError,
                               hour_angle: f64,
                               guide_rate: f64)
                               -> Result<CorrectionCommand, CanonicalError> {
    if !hour_angle.is_finite() {
        return Err(configuration_error(
            format!("hour angle {} is not finite", hour_angle).as_str()));
    }
    if !(guide_rate.is_finite() && guide_rate > 0.0) {
        return Err(configuration_error(
            format!("guide rate {} must be positive", guide_rate).as_str()));
    }
    let delta_dec = error.delta_dec.in_arcseconds()?;
    let delta_ra = error.delta_ra.in_arcseconds()?;
    if !delta_dec.is_finite() || !delta_ra.is_finite() {
        return Err(configuration_error(
            format!("pointing error {:?} is not finite", error).as_str()));
    }

    let side = MeridianSide::from_hour_angle(hour_angle);
    let axis_correction = |axis: Axis, delta: f64,
                           direction: fn(MeridianSide, Sign) -> Direction| AxisCorrection{
        axis,
        offset: AngularValue::arcseconds(delta.abs()),
        pulse_ms: pulse_duration_ms(delta.abs(), guide_rate),
        direction: direction(side, Sign::of(delta)),
    };
    Ok(CorrectionCommand{
        dec: axis_correction(Axis::Dec, delta_dec, dec_direction),
        ra: axis_correction(Axis::Ra, delta_ra, ra_direction),
        meridian_side: side,
        guide_rate,
    })
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_relative_eq;

    use super::*;
    use crate::error::ErrorKind;

    const DELTA_RA: f64 = 13.0881456;
    const DELTA_DEC: f64 = 1.4009;

    fn correct(ha: f64, d_ra: f64, d_dec: f64) -> CorrectionCommand {
        get_tracking_correction(&PointingError::from_arcseconds(d_ra, d_dec),
                                ha, 0.9).unwrap()
    }

    fn check(ha: f64, d_ra: f64, d_dec: f64,
             dec_direction: Direction, ra_direction: Direction) {
        let c = correct(ha, d_ra, d_dec);
        assert_eq!(c.dec.axis, Axis::Dec);
        assert_eq!(c.ra.axis, Axis::Ra);
        assert_eq!(c.dec.direction, dec_direction, "dec at ha {}", ha);
        assert_eq!(c.ra.direction, ra_direction, "ra at ha {}", ha);
        assert_relative_eq!(c.dec.pulse_ms, 103.49, max_relative = 0.01);
        assert_relative_eq!(c.ra.pulse_ms, 966.84, max_relative = 0.01);
        assert_relative_eq!(c.dec.offset.value, DELTA_DEC, max_relative = 1e-12);
        assert_relative_eq!(c.ra.offset.value, DELTA_RA, max_relative = 1e-12);
    }

    #[test]
    fn test_west_of_meridian() {
        check(2.0, -DELTA_RA, DELTA_DEC, Direction::South, Direction::East);
        check(2.0, -DELTA_RA, -DELTA_DEC, Direction::North, Direction::East);
        check(2.0, DELTA_RA, DELTA_DEC, Direction::South, Direction::West);
    }

    #[test]
    fn test_past_twelve_hours() {
        check(14.0, -DELTA_RA, DELTA_DEC, Direction::South, Direction::East);
        check(14.0, DELTA_RA, DELTA_DEC, Direction::South, Direction::West);
        assert_eq!(correct(14.0, DELTA_RA, DELTA_DEC).meridian_side,
                   MeridianSide::East);
    }

    #[test]
    fn test_east_of_meridian() {
        check(-3.0, -DELTA_RA, -DELTA_DEC, Direction::North, Direction::East);
        check(-3.0, DELTA_RA, DELTA_DEC, Direction::South, Direction::West);
    }

    #[test]
    fn test_dec_direction_independent_of_hour_angle() {
        for ha in [-11.5, -6.0, -0.1, 0.0, 0.1, 6.0, 11.9, 14.0, 23.0] {
            assert_eq!(correct(ha, 5.0, -2.0).dec.direction, Direction::North);
            assert_eq!(correct(ha, 5.0, 2.0).dec.direction, Direction::South);
        }
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(MeridianSide::from_hour_angle(0.0), MeridianSide::West);
        assert_eq!(MeridianSide::from_hour_angle(-0.0), MeridianSide::West);
        assert_eq!(MeridianSide::from_hour_angle(-1e-9), MeridianSide::East);

        let c = correct(0.0, 0.0, 0.0);
        assert!(c.ra.is_noop());
        assert!(c.dec.is_noop());
        assert_eq!(c.ra.pulse_ms, 0.0);
        assert_eq!(c.ra.direction, Direction::West);
        assert_eq!(c.dec.direction, Direction::South);
    }

    #[test]
    fn test_direction_tables_agree_across_sides() {
        for sign in [Sign::Negative, Sign::NonNegative] {
            assert_eq!(dec_direction(MeridianSide::East, sign),
                       dec_direction(MeridianSide::West, sign));
            assert_eq!(ra_direction(MeridianSide::East, sign),
                       ra_direction(MeridianSide::West, sign));
        }
        assert_eq!(dec_direction(MeridianSide::East, Sign::of(-1.0)), Direction::North);
        assert_eq!(ra_direction(MeridianSide::West, Sign::of(0.0)), Direction::West);
    }

    #[test]
    fn test_pulse_scales_with_guide_rate() {
        let e = PointingError::from_arcseconds(10.0, 0.0);
        let half = get_tracking_correction(&e, 1.0, 0.5).unwrap();
        let full = get_tracking_correction(&e, 1.0, 1.0).unwrap();
        assert_relative_eq!(half.ra.pulse_ms, 2.0 * full.ra.pulse_ms,
                            max_relative = 1e-12);
        assert_relative_eq!(full.ra.pulse_ms, 10.0 / SIDEREAL_RATE * 1000.0,
                            max_relative = 1e-12);
    }

    #[test]
    fn test_invalid_inputs() {
        let e = PointingError::from_arcseconds(1.0, 1.0);
        for (ha, rate) in [(f64::NAN, 0.9), (f64::INFINITY, 0.9), (1.0, 0.0),
                           (1.0, -0.5)] {
            let err = get_tracking_correction(&e, ha, rate).unwrap_err();
            assert_eq!(ErrorKind::of(&err), ErrorKind::Configuration);
        }
    }
}
