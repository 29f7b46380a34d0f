// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use canonical_error::CanonicalError;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::error::{configuration_error, precondition_error, timeout_error};
use crate::exif::{date_time_original, read_exif, tag_text, ExifTags};
use crate::fits::{write_fits, FitsHeader, FitsValue};
use crate::pgm::read_pgm;
use crate::tool_subprocess::run_tool;
use crate::toolchain::Toolchain;

/// Observation details recorded in the FITS header of a converted image.
/// Every field is optional; absent ones are written as empty strings.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ObservationHeaders {
    pub image_id: Option<String>,
    pub sequence_id: Option<String>,
    pub field_name: Option<String>,
    // Degrees.
    pub ra_mnt: Option<f64>,
    pub ha_mnt: Option<f64>,
    pub dec_mnt: Option<f64>,
    pub equinox: Option<f64>,
    pub airmass: Option<f64>,
    pub filter: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    // Meters.
    pub elevation: Option<f64>,
    pub moon_separation: Option<f64>,
    pub moon_fraction: Option<f64>,
    pub creator: Option<String>,
    pub camera_uid: Option<String>,
    pub observer: Option<String>,
    pub origin: Option<String>,
    // Added verbatim, keys upper-cased and cut to 8 characters.
    pub extra: Vec<(String, String)>,
}

fn text(value: &Option<String>) -> FitsValue {
    FitsValue::Text(value.clone().unwrap_or_default())
}

fn number(value: Option<f64>) -> FitsValue {
    match value {
        Some(v) => FitsValue::Float(v),
        None => FitsValue::Text(String::new()),
    }
}

/// Builds the header of a converted raw image from its EXIF tags and the
/// observation details.
pub fn build_fits_header(exif: &ExifTags, headers: &ObservationHeaders) -> FitsHeader {
    let mut header = FitsHeader::new();
    let from_raw = Some("From CR2");
    let tag = |key: &str| FitsValue::Text(tag_text(exif, key));

    header.set("FILTER", FitsValue::Text("RGGB".to_string()), None);
    header.set("ISO", tag("ISO"), None);
    header.set("EXPTIME", tag("ExposureTime"), Some("Seconds"));
    header.set("CAMTEMP", tag("CameraTemperature"), Some("Celsius - From CR2"));
    for (keyword, exif_key) in [
        ("CIRCCONF", "CircleOfConfusion"),
        ("COLORTMP", "ColorTempMeasured"),
        ("FILENAME", "FileName"),
        ("INTSN", "InternalSerialNumber"),
        ("CAMSN", "SerialNumber"),
        ("MEASEV", "MeasuredEV"),
        ("MEASEV2", "MeasuredEV2"),
        ("MEASRGGB", "MeasuredRGGB"),
        ("WHTLVLN", "NormalWhiteLevel"),
        ("WHTLVLS", "SpecularWhiteLevel"),
        ("REDBAL", "RedBalance"),
        ("BLUEBAL", "BlueBalance"),
        ("WBRGGB", "WB_RGGBLevelAsShot"),
    ] {
        header.set(keyword, tag(exif_key), from_raw);
    }
    let date_obs = date_time_original(exif)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default();
    header.set("DATE-OBS", FitsValue::Text(date_obs), None);

    let degrees = Some("Degrees");
    header.set("IMAGEID", text(&headers.image_id), None);
    header.set("SEQID", text(&headers.sequence_id), None);
    header.set("FIELD", text(&headers.field_name), None);
    header.set("RA-MNT", number(headers.ra_mnt), degrees);
    header.set("HA-MNT", number(headers.ha_mnt), degrees);
    header.set("DEC-MNT", number(headers.dec_mnt), degrees);
    header.set("EQUINOX", number(headers.equinox), None);
    header.set("AIRMASS", number(headers.airmass), Some("Sec(z)"));
    if headers.filter.is_some() {
        header.set("FILTER", text(&headers.filter), None);
    }
    header.set("LAT-OBS", number(headers.latitude), degrees);
    header.set("LONG-OBS", number(headers.longitude), degrees);
    header.set("ELEV-OBS", number(headers.elevation), Some("Meters"));
    header.set("MOONSEP", number(headers.moon_separation), degrees);
    header.set("MOONFRAC", number(headers.moon_fraction), None);
    header.set("CREATOR", text(&headers.creator), Some("Software version"));
    header.set("INSTRUME", text(&headers.camera_uid), Some("Camera ID"));
    header.set("OBSERVER", text(&headers.observer), Some("Unit ID"));
    header.set("ORIGIN", text(&headers.origin), None);
    for (key, value) in &headers.extra {
        header.set(key, FitsValue::Text(value.clone()), None);
    }
    header
}

/// Runs dcraw to write the raw sensor data of `raw` as a 16-bit PGM beside
/// it, returning the PGM's path. An existing PGM is reused unless
/// `overwrite` is set.
pub fn cr2_to_pgm(toolchain: &Toolchain, raw: &Path, overwrite: bool)
                  -> Result<PathBuf, CanonicalError> {
    if !raw.exists() {
        return Err(precondition_error(format!("No raw image {:?}", raw).as_str()));
    }
    let pgm = raw.with_extension("pgm");
    if pgm.exists() && !overwrite {
        debug!("Reusing {:?}", pgm);
        return Ok(pgm);
    }
    let dcraw = toolchain.locate_dcraw();
    let args = [OsStr::new("-t"), OsStr::new("0"), OsStr::new("-D"),
                OsStr::new("-4"), raw.as_os_str()];
    let output = run_tool(&dcraw, args, toolchain.tool_timeout)?;
    if output.timed_out {
        return Err(timeout_error(format!("dcraw timed out on {:?}", raw).as_str()));
    }
    if !output.status.is_some_and(|s| s.success()) || !pgm.exists() {
        return Err(configuration_error(
            format!("dcraw failed on {:?}: {}", raw, output.text()).as_str()));
    }
    Ok(pgm)
}

/// Converts a raw camera image to FITS: sensor data via dcraw, header from
/// EXIF plus `headers`. Returns the FITS path, `<raw stem>.fits` unless
/// `fits_path` is given. An existing FITS file is kept unless `overwrite`.
pub fn cr2_to_fits(toolchain: &Toolchain,
                   raw: &Path,
                   fits_path: Option<&Path>,
                   headers: &ObservationHeaders,
                   overwrite: bool,
                   remove_raw: bool) -> Result<PathBuf, CanonicalError> {
    let fits_path = fits_path.map(Path::to_path_buf)
        .unwrap_or_else(|| raw.with_extension("fits"));
    if fits_path.exists() && !overwrite {
        info!("{:?} exists, not converting {:?}", fits_path, raw);
        return Ok(fits_path);
    }
    let pgm_path = cr2_to_pgm(toolchain, raw, overwrite)?;
    let pgm = read_pgm(&pgm_path, true)?;
    let exif = read_exif(toolchain, raw)?;
    let header = build_fits_header(&exif, headers);
    write_fits(&fits_path, &pgm.raster, &header)?;
    info!("Converted {:?} to {:?}", raw, fits_path);
    if remove_raw {
        if let Err(e) = fs::remove_file(raw) {
            warn!("Could not remove {:?}: {:?}", raw, e);
        }
    }
    Ok(fits_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::exif::parse_exif_json;
    use crate::fits::read_header;
    use crate::test_util::write_script;

    const EXIF: &str = r#"[{"ISO": 100, "ExposureTime": "1/30",
        "SerialNumber": "0123", "DateTimeOriginal": "2017:03:01 06:00:00"}]"#;

    fn observation() -> ObservationHeaders {
        ObservationHeaders{
            image_id: Some("PAN001_14d3bd_20170301T060000".to_string()),
            ra_mnt: Some(303.25),
            dec_mnt: Some(46.5),
            ha_mnt: Some(15.0),
            longitude: Some(-155.58),
            observer: Some("PAN001".to_string()),
            extra: vec![("exposure_start".to_string(), "x".to_string())],
            ..Default::default()
        }
    }

    #[test]
    fn test_build_header() {
        let header = build_fits_header(&parse_exif_json(EXIF).unwrap(), &observation());
        assert_eq!(header.get_str("FILTER"), Some("RGGB"));
        assert_eq!(header.get_str("ISO"), Some("100"));
        assert_eq!(header.get_str("CAMSN"), Some("0123"));
        assert_eq!(header.get_str("MEASEV"), Some(""));
        assert_eq!(header.get_str("DATE-OBS"), Some("2017-03-01T06:00:00"));
        assert_eq!(header.get_f64("RA-MNT"), Some(303.25));
        assert_eq!(header.get_f64("AIRMASS"), None);
        assert_eq!(header.get_str("OBSERVER"), Some("PAN001"));
        assert_eq!(header.get_str("EXPOSURE"), Some("x"));
    }

    #[test]
    fn test_headers_from_json() {
        let headers: ObservationHeaders = serde_json::from_str(
            r#"{"ra_mnt": 10.5, "field_name": "Wasp 33",
                "extra": [["ORIGIN2", "lab"]]}"#).unwrap();
        assert_eq!(headers.ra_mnt, Some(10.5));
        assert_eq!(headers.field_name.as_deref(), Some("Wasp 33"));
        assert_eq!(headers.extra.len(), 1);
        assert!(headers.dec_mnt.is_none());
    }

    #[test]
    fn test_cr2_to_fits() {
        let dir = tempfile::TempDir::new().unwrap();
        // Fake dcraw writes a 2x2 16-bit PGM beside its last argument.
        let dcraw = write_script(dir.path(), "dcraw",
            "for last; do :; done\n\
             printf 'P5\\n2 2\\n4095\\n\\000\\001\\000\\002\\000\\003\\000\\004' \
             > \"${last%.*}.pgm\"");
        let exiftool = write_script(dir.path(), "exiftool",
                                    &format!("cat <<'EOF'\n{}\nEOF", EXIF));
        let toolchain = Toolchain{dcraw, exiftool, ..Default::default()};
        let raw = dir.path().join("pec_001.cr2");
        fs::write(&raw, "raw").unwrap();

        let fits = cr2_to_fits(&toolchain, &raw, None, &observation(), false, true)
            .unwrap();
        assert_eq!(fits, dir.path().join("pec_001.fits"));
        assert!(!raw.exists());
        assert!(!dir.path().join("pec_001.pgm").exists());
        let header = read_header(&fits).unwrap();
        assert_eq!(header.get_f64("NAXIS1"), Some(2.0));
        assert_eq!(header.get_f64("DEC-MNT"), Some(46.5));
        assert_eq!(header.get_str("DATE-OBS"), Some("2017-03-01T06:00:00"));

        // Existing output is kept.
        let again = cr2_to_fits(&toolchain, &raw, None, &observation(), false, false)
            .unwrap();
        assert_eq!(again, fits);
    }

    #[test]
    fn test_dcraw_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let dcraw = write_script(dir.path(), "dcraw", "echo 'bad raw' 1>&2; exit 1");
        let toolchain = Toolchain{dcraw, ..Default::default()};
        let raw = dir.path().join("pec_001.cr2");
        fs::write(&raw, "raw").unwrap();
        let err = cr2_to_pgm(&toolchain, &raw, false).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Configuration);
        assert!(err.message.contains("bad raw"));

        let err = cr2_to_pgm(&toolchain, &dir.path().join("x.cr2"), false).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Precondition);
    }
}
