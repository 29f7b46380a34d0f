// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use canonical_error::CanonicalError;
use serde::Serialize;

use crate::error::configuration_error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Dimension {
    Angle,
    Pixel,
    PixelScale,
    Area,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Unit {
    Degree,
    Arcminute,
    Arcsecond,
    // Hour angle units: one hour is 15 degrees.
    Hour,
    Minute,
    Second,
    Pixel,
    DegreePerPixel,
    ArcsecPerPixel,
    SquareDegree,
}

impl Unit {
    pub fn dimension(&self) -> Dimension {
        match self {
            Unit::Degree | Unit::Arcminute | Unit::Arcsecond |
            Unit::Hour | Unit::Minute | Unit::Second => Dimension::Angle,
            Unit::Pixel => Dimension::Pixel,
            Unit::DegreePerPixel | Unit::ArcsecPerPixel => Dimension::PixelScale,
            Unit::SquareDegree => Dimension::Area,
        }
    }

    // Size of one of this unit, in the base unit of its dimension (degrees,
    // pixels, degrees/pixel, square degrees).
    fn scale(&self) -> f64 {
        match self {
            Unit::Degree => 1.0,
            Unit::Arcminute => 1.0 / 60.0,
            Unit::Arcsecond => 1.0 / 3600.0,
            Unit::Hour => 15.0,
            Unit::Minute => 15.0 / 60.0,
            Unit::Second => 15.0 / 3600.0,
            Unit::Pixel => 1.0,
            Unit::DegreePerPixel => 1.0,
            Unit::ArcsecPerPixel => 1.0 / 3600.0,
            Unit::SquareDegree => 1.0,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Degree => "deg",
            Unit::Arcminute => "arcmin",
            Unit::Arcsecond => "arcsec",
            Unit::Hour => "hourangle",
            Unit::Minute => "min",
            Unit::Second => "s",
            Unit::Pixel => "pix",
            Unit::DegreePerPixel => "deg / pix",
            Unit::ArcsecPerPixel => "arcsec / pix",
            Unit::SquareDegree => "deg2",
        }
    }
}

/// A magnitude tagged with the unit it is expressed in. Values only combine
/// after conversion to a common unit; operations never change the unit of
/// the left operand.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AngularValue {
    pub value: f64,
    pub unit: Unit,
}

impl AngularValue {
    pub fn new(value: f64, unit: Unit) -> Self {
        AngularValue{value, unit}
    }

    pub fn degrees(value: f64) -> Self {
        AngularValue::new(value, Unit::Degree)
    }

    pub fn arcseconds(value: f64) -> Self {
        AngularValue::new(value, Unit::Arcsecond)
    }

    /// Returns this value re-expressed in `unit`. Fails if `unit` measures a
    /// different dimension.
    pub fn to(&self, unit: Unit) -> Result<AngularValue, CanonicalError> {
        if self.unit.dimension() != unit.dimension() {
            return Err(configuration_error(
                format!("cannot convert {} to {}", self, unit.symbol()).as_str()));
        }
        Ok(AngularValue::new(self.value * self.unit.scale() / unit.scale(), unit))
    }

    // Convenience accessors for angle values. Non-angle values yield an error.
    pub fn in_degrees(&self) -> Result<f64, CanonicalError> {
        Ok(self.to(Unit::Degree)?.value)
    }
    pub fn in_arcseconds(&self) -> Result<f64, CanonicalError> {
        Ok(self.to(Unit::Arcsecond)?.value)
    }

    pub fn checked_add(&self, other: &AngularValue)
                       -> Result<AngularValue, CanonicalError> {
        let other = other.to(self.unit)?;
        Ok(AngularValue::new(self.value + other.value, self.unit))
    }

    pub fn checked_sub(&self, other: &AngularValue)
                       -> Result<AngularValue, CanonicalError> {
        let other = other.to(self.unit)?;
        Ok(AngularValue::new(self.value - other.value, self.unit))
    }

    pub fn abs(&self) -> AngularValue {
        AngularValue::new(self.value.abs(), self.unit)
    }

    pub fn is_sign_negative(&self) -> bool {
        self.value < 0.0
    }
}

impl fmt::Display for AngularValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit.symbol())
    }
}

/// Wraps an angle in degrees into [-180, 180).
pub fn wrap_degrees_180(degrees: f64) -> f64 {
    (degrees + 180.0).rem_euclid(360.0) - 180.0
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_conversions() {
        let one_degree = AngularValue::degrees(1.0);
        assert_abs_diff_eq!(one_degree.in_arcseconds().unwrap(), 3600.0,
                            epsilon = 1e-9);
        let hours = AngularValue::new(2.0, Unit::Hour);
        assert_abs_diff_eq!(hours.in_degrees().unwrap(), 30.0, epsilon = 1e-9);
        let scale = AngularValue::new(10.0, Unit::ArcsecPerPixel);
        assert_abs_diff_eq!(scale.to(Unit::DegreePerPixel).unwrap().value,
                            10.0 / 3600.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dimension_mismatch() {
        let pixels = AngularValue::new(5.0, Unit::Pixel);
        let err = pixels.to(Unit::Degree).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Configuration);
        assert!(AngularValue::degrees(1.0).checked_add(&pixels).is_err());
    }

    #[test]
    fn test_arithmetic_keeps_left_unit() {
        let a = AngularValue::arcseconds(30.0);
        let b = AngularValue::degrees(0.01);
        let sum = a.checked_add(&b).unwrap();
        assert_eq!(sum.unit, Unit::Arcsecond);
        assert_abs_diff_eq!(sum.value, 66.0, epsilon = 1e-9);
        let diff = b.checked_sub(&a).unwrap();
        assert_eq!(diff.unit, Unit::Degree);
        assert_abs_diff_eq!(diff.value, 0.01 - 30.0 / 3600.0, epsilon = 1e-12);
        assert_eq!(AngularValue::degrees(-2.0).abs().value, 2.0);
    }

    #[test]
    fn test_wrap() {
        assert_abs_diff_eq!(wrap_degrees_180(359.0), -1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(wrap_degrees_180(-359.0), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(wrap_degrees_180(10.0), 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(wrap_degrees_180(180.0), -180.0, epsilon = 1e-9);
    }
}
