// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use canonical_error::CanonicalError;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::astro_util::SkyCoordinate;
use crate::error::{configuration_error, precondition_error, solve_error};
use crate::tool_subprocess::run_tool;
use crate::toolchain::Toolchain;
use crate::unit_parser::{parse_unit_tagged, TaggedValue};
use crate::units::AngularValue;

/// Astrometric calibration of one solved image, as reported by wcsinfo.
#[derive(Clone, Debug, Serialize)]
pub struct CalibrationRecord {
    pub wcs_file: PathBuf,

    // Sky position of the image center.
    pub center: Option<SkyCoordinate>,

    // Arcsec per pixel.
    pub pixel_scale: Option<AngularValue>,

    pub orientation: Option<AngularValue>,
    pub field_width: Option<AngularValue>,
    pub field_height: Option<AngularValue>,
    pub image_width: Option<AngularValue>,
    pub image_height: Option<AngularValue>,

    // Exposure time, when known from the image's metadata.
    pub observed_at: Option<DateTime<Utc>>,

    // Every key wcsinfo reported.
    pub values: BTreeMap<String, TaggedValue>,
}

impl CalibrationRecord {
    pub fn from_values(wcs_file: &Path, values: BTreeMap<String, TaggedValue>)
                       -> Self {
        let quantity = |key: &str| values.get(key).and_then(TaggedValue::quantity);
        let center = match (quantity("ra_center"), quantity("dec_center")) {
            (Some(ra), Some(dec)) => match SkyCoordinate::new(ra, dec) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!("Ignoring center of {:?}: {}", wcs_file, e.message);
                    None
                }
            },
            _ => None,
        };
        CalibrationRecord{
            wcs_file: wcs_file.to_path_buf(),
            center,
            pixel_scale: quantity("pixscale"),
            orientation: quantity("orientation"),
            field_width: quantity("fieldw"),
            field_height: quantity("fieldh"),
            image_width: quantity("imagew"),
            image_height: quantity("imageh"),
            observed_at: None,
            values,
        }
    }

    pub fn with_observed_at(mut self, observed_at: Option<DateTime<Utc>>) -> Self {
        self.observed_at = observed_at;
        self
    }

    pub fn require_center(&self) -> Result<SkyCoordinate, CanonicalError> {
        self.center.ok_or_else(|| configuration_error(
            format!("No center coordinate for {:?}", self.wcs_file).as_str()))
    }

    pub fn require_pixel_scale(&self) -> Result<AngularValue, CanonicalError> {
        self.pixel_scale.ok_or_else(|| configuration_error(
            format!("No pixel scale for {:?}", self.wcs_file).as_str()))
    }

    pub fn require_observed_at(&self) -> Result<DateTime<Utc>, CanonicalError> {
        self.observed_at.ok_or_else(|| configuration_error(
            format!("No observation time for {:?}", self.wcs_file).as_str()))
    }
}

/// Runs wcsinfo on a solved image and parses its report. A wcsinfo that
/// cannot be run, or that prints nothing usable, is a solve failure.
pub fn get_wcsinfo(toolchain: &Toolchain, wcs_file: &Path)
                   -> Result<CalibrationRecord, CanonicalError> {
    if !wcs_file.exists() {
        return Err(precondition_error(
            format!("No WCS file {:?}", wcs_file).as_str()));
    }
    let program = toolchain.locate_wcsinfo();
    let output = run_tool(&program, [wcs_file], toolchain.wcsinfo_timeout)
        .map_err(|e| solve_error(
            format!("wcsinfo failed for {:?}: {}", wcs_file, e.message).as_str()))?;
    if output.timed_out {
        warn!("wcsinfo timed out on {:?}; using partial output", wcs_file);
    }
    let values = parse_unit_tagged(&output.stdout_text());
    debug!("wcsinfo reported {} values for {:?}", values.len(), wcs_file);
    if values.is_empty() {
        return Err(solve_error(
            format!("wcsinfo reported nothing for {:?}", wcs_file).as_str()));
    }
    Ok(CalibrationRecord::from_values(wcs_file, values))
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::fs;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::error::ErrorKind;
    use crate::test_util::fake_wcsinfo;
    use crate::units::Unit;

    const REPORT: &str = "\
crpix0 2593.5
crpix1 1729.5
pixscale 10.2778
orientation 179.689
parity neg
ra_center 303.206943
dec_center 46.7543
fieldw 14.8
fieldh 9.87
imagew 5184
imageh 3456
";

    fn setup(report: &str) -> (tempfile::TempDir, Toolchain, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let wcsinfo = fake_wcsinfo(dir.path(), report);
        let image = dir.path().join("field.fits");
        fs::write(&image, "wcs").unwrap();
        let toolchain = Toolchain{wcsinfo: Some(wcsinfo), ..Default::default()};
        (dir, toolchain, image)
    }

    #[test]
    fn test_get_wcsinfo() {
        let (_dir, toolchain, image) = setup(REPORT);
        let record = get_wcsinfo(&toolchain, &image).unwrap();
        let center = record.require_center().unwrap();
        assert_abs_diff_eq!(center.ra().value, 303.206943, epsilon = 1e-9);
        assert_abs_diff_eq!(center.dec().value, 46.7543, epsilon = 1e-9);
        let scale = record.require_pixel_scale().unwrap();
        assert_eq!(scale.unit, Unit::ArcsecPerPixel);
        assert_abs_diff_eq!(scale.value, 10.2778, epsilon = 1e-9);
        assert_eq!(record.image_height.unwrap().unit, Unit::Pixel);
        assert_eq!(record.values["parity"], TaggedValue::Text("neg".to_string()));
        assert!(record.observed_at.is_none());
        assert!(record.require_observed_at().is_err());
    }

    #[test]
    fn test_missing_file_is_precondition() {
        let (dir, toolchain, _image) = setup(REPORT);
        let err = get_wcsinfo(&toolchain, &dir.path().join("nope.fits")).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Precondition);
    }

    #[test]
    fn test_unrunnable_tool_is_solve_error() {
        let (dir, _toolchain, image) = setup(REPORT);
        let toolchain = Toolchain{
            wcsinfo: Some(dir.path().join("missing-wcsinfo")), ..Default::default()};
        let err = get_wcsinfo(&toolchain, &image).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Solve);
    }

    #[test]
    fn test_record_without_center() {
        let (_dir, toolchain, image) = setup("pixscale 2.5\nparity pos\n");
        let record = get_wcsinfo(&toolchain, &image).unwrap();
        assert!(record.center.is_none());
        let err = record.require_center().unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Configuration);
    }

    #[test]
    fn test_invalid_center_is_dropped() {
        let (_dir, toolchain, image) = setup("ra_center 10\ndec_center 95\n");
        let record = get_wcsinfo(&toolchain, &image).unwrap();
        assert!(record.center.is_none());
        assert_eq!(record.values.len(), 2);
    }
}
