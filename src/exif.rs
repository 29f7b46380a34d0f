// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::ffi::OsStr;
use std::path::Path;

use canonical_error::CanonicalError;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::debug;
use serde_json::{Map, Value};

use crate::error::{configuration_error, precondition_error, timeout_error};
use crate::tool_subprocess::run_tool;
use crate::toolchain::Toolchain;

pub type ExifTags = Map<String, Value>;

/// Metadata of `path` as reported by `exiftool -j`.
pub fn read_exif(toolchain: &Toolchain, path: &Path) -> Result<ExifTags, CanonicalError> {
    if !path.exists() {
        return Err(precondition_error(
            format!("No image {:?}", path).as_str()));
    }
    let exiftool = toolchain.locate_exiftool();
    let args = [OsStr::new("-j"), path.as_os_str()];
    let output = run_tool(&exiftool, args, toolchain.tool_timeout)?;
    if output.timed_out {
        return Err(timeout_error(
            format!("exiftool timed out on {:?}", path).as_str()));
    }
    if !output.status.is_some_and(|s| s.success()) {
        return Err(configuration_error(
            format!("exiftool failed on {:?}: {}", path, output.text()).as_str()));
    }
    parse_exif_json(&output.stdout_text())
}

/// exiftool prints a JSON array holding one object per file.
pub fn parse_exif_json(text: &str) -> Result<ExifTags, CanonicalError> {
    let value: Value = serde_json::from_str(text).map_err(|e| configuration_error(
        format!("exiftool output is not JSON: {:?}", e).as_str()))?;
    match value {
        Value::Array(items) => match items.into_iter().next() {
            Some(Value::Object(tags)) => {
                debug!("Read {} EXIF tags", tags.len());
                Ok(tags)
            },
            _ => Err(configuration_error("exiftool reported no tags")),
        },
        _ => Err(configuration_error("exiftool output is not a JSON array")),
    }
}

/// Tag value as header text; numbers are printed, missing tags are empty.
pub fn tag_text(tags: &ExifTags, key: &str) -> String {
    match tags.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// DateTimeOriginal ("2017:03:01 06:00:00") as UTC. Cameras do not record a
/// zone, so the clock is assumed to be set to UTC.
pub fn date_time_original(tags: &ExifTags) -> Option<DateTime<Utc>> {
    let text = tag_text(tags, "DateTimeOriginal");
    let naive = NaiveDateTime::parse_from_str(text.trim(), "%Y:%m:%d %H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::error::ErrorKind;
    use crate::test_util::write_script;

    const EXIFTOOL_OUTPUT: &str = r#"[{
  "SourceFile": "pec_001.cr2",
  "ISO": 100,
  "ExposureTime": "1/30",
  "CameraTemperature": "21 C",
  "SerialNumber": "012345678901",
  "DateTimeOriginal": "2017:03:01 06:00:00"
}]"#;

    #[test]
    fn test_parse() {
        let tags = parse_exif_json(EXIFTOOL_OUTPUT).unwrap();
        assert_eq!(tag_text(&tags, "ISO"), "100");
        assert_eq!(tag_text(&tags, "ExposureTime"), "1/30");
        assert_eq!(tag_text(&tags, "MeasuredEV"), "");
        assert_eq!(date_time_original(&tags).unwrap().to_rfc3339(),
                   "2017-03-01T06:00:00+00:00");
    }

    #[test]
    fn test_parse_errors() {
        for text in ["not json", "{}", "[]", "[1]"] {
            let err = parse_exif_json(text).unwrap_err();
            assert_eq!(ErrorKind::of(&err), ErrorKind::Configuration);
        }
    }

    #[test]
    fn test_read_exif() {
        let dir = tempfile::TempDir::new().unwrap();
        let body = format!("[ \"$1\" = -j ] || exit 2\ncat <<'EOF'\n{}\nEOF",
                           EXIFTOOL_OUTPUT);
        let exiftool = write_script(dir.path(), "exiftool", &body);
        let image = dir.path().join("pec_001.cr2");
        fs::write(&image, "raw").unwrap();
        let toolchain = Toolchain{exiftool, ..Default::default()};
        let tags = read_exif(&toolchain, &image).unwrap();
        assert_eq!(tag_text(&tags, "SerialNumber"), "012345678901");

        let err = read_exif(&toolchain, &dir.path().join("absent.cr2")).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Precondition);
    }
}
