// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Just enough FITS to read the header of a captured or solved image and to
// write a 16-bit monochrome image with a header. Files are sequences of
// 2880-byte blocks; the header is 80-character records up to END.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use canonical_error::{CanonicalError, internal_error};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use image::{ImageBuffer, Luma};

use crate::error::{configuration_error, precondition_error};

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;

// Keywords the writer produces itself from the image geometry.
const STRUCTURAL: [&str; 8] =
    ["SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "BZERO", "BSCALE", "END"];

pub type Raster = ImageBuffer<Luma<u16>, Vec<u16>>;

#[derive(Clone, Debug, PartialEq)]
pub enum FitsValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Logical(bool),
}

impl FitsValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FitsValue::Text(s) => Some(s),
            _ => None,
        }
    }

    // Numeric value. Text that parses as a number also counts, since some
    // writers quote their numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FitsValue::Integer(i) => Some(*i as f64),
            FitsValue::Float(f) => Some(*f),
            FitsValue::Text(s) => s.trim().parse::<f64>().ok(),
            FitsValue::Logical(_) => None,
        }
    }

    fn format(&self) -> String {
        match self {
            FitsValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            FitsValue::Integer(i) => i.to_string(),
            FitsValue::Float(f) => format!("{:.10E}", f),
            FitsValue::Logical(b) => if *b { "T" } else { "F" }.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FitsCard {
    pub keyword: String,
    pub value: FitsValue,
    pub comment: Option<String>,
}

/// Header keywords in file order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FitsHeader {
    cards: Vec<FitsCard>,
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces `keyword`. Keywords are upper-cased and cut to 8
    /// characters.
    pub fn set(&mut self, keyword: &str, value: FitsValue, comment: Option<&str>) {
        let keyword: String = keyword.to_uppercase().chars().take(8).collect();
        let card = FitsCard{
            keyword: keyword.clone(),
            value,
            comment: comment.map(str::to_string),
        };
        match self.cards.iter_mut().find(|c| c.keyword == keyword) {
            Some(existing) => *existing = card,
            None => self.cards.push(card),
        }
    }

    pub fn get(&self, keyword: &str) -> Option<&FitsValue> {
        let keyword = keyword.to_uppercase();
        self.cards.iter().find(|c| c.keyword == keyword).map(|c| &c.value)
    }

    pub fn get_str(&self, keyword: &str) -> Option<&str> {
        self.get(keyword).and_then(FitsValue::as_str)
    }

    /// Numeric value of `keyword`; None if absent, blank or not numeric.
    pub fn get_f64(&self, keyword: &str) -> Option<f64> {
        self.get(keyword).and_then(FitsValue::as_f64)
    }

    /// Parses an ISO-8601 timestamp such as DATE-OBS. A timestamp without
    /// an offset is taken as UTC.
    pub fn get_time(&self, keyword: &str) -> Option<DateTime<Utc>> {
        let text = self.get_str(keyword)?.trim();
        if text.is_empty() {
            return None;
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(text) {
            return Some(t.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|t| Utc.from_utc_datetime(&t))
    }

    pub fn cards(&self) -> &[FitsCard] {
        &self.cards
    }
}

/// Reads the primary header of the FITS file at `path`.
pub fn read_header(path: &Path) -> Result<FitsHeader, CanonicalError> {
    let file = File::open(path).map_err(|e| precondition_error(
        format!("Cannot open {:?}: {:?}", path, e).as_str()))?;
    let mut reader = BufReader::new(file);
    let mut header = FitsHeader::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        reader.read_exact(&mut block).map_err(|e| configuration_error(
            format!("{:?} is not a FITS file (no END card): {:?}", path, e).as_str()))?;
        for record in block.chunks_exact(CARD_SIZE) {
            let record = String::from_utf8_lossy(record);
            let keyword = record.get(..8).unwrap_or("").trim_end();
            if keyword == "END" {
                return Ok(header);
            }
            if keyword.is_empty() || record.get(8..10) != Some("= ") {
                continue;  // Blank, COMMENT, HISTORY.
            }
            let (value, comment) = parse_value(record.get(10..).unwrap_or(""));
            header.cards.push(FitsCard{keyword: keyword.to_string(), value, comment});
        }
        if header.cards.is_empty() && !block.starts_with(b"SIMPLE  ") {
            return Err(configuration_error(
                format!("{:?} is not a FITS file", path).as_str()));
        }
    }
}

fn parse_value(field: &str) -> (FitsValue, Option<String>) {
    let field = field.trim_start();
    if let Some(quoted) = field.strip_prefix('\'') {
        // '' inside a string is an escaped quote.
        let mut text = String::new();
        let mut chars = quoted.chars().peekable();
        let mut rest = String::new();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    text.push('\'');
                    continue;
                }
                rest = chars.collect();
                break;
            }
            text.push(c);
        }
        let comment = rest.split_once('/').map(|(_, c)| c.trim().to_string());
        return (FitsValue::Text(text.trim_end().to_string()), comment);
    }
    let (value, comment) = match field.split_once('/') {
        Some((v, c)) => (v.trim(), Some(c.trim().to_string())),
        None => (field.trim(), None),
    };
    let value = match value {
        "T" => FitsValue::Logical(true),
        "F" => FitsValue::Logical(false),
        v => match v.parse::<i64>() {
            Ok(i) => FitsValue::Integer(i),
            Err(_) => match v.replace(['D', 'd'], "E").parse::<f64>() {
                Ok(f) => FitsValue::Float(f),
                Err(_) => FitsValue::Text(v.to_string()),
            },
        },
    };
    (value, comment)
}

fn card(keyword: &str, value: &FitsValue, comment: Option<&str>) -> [u8; CARD_SIZE] {
    let mut record = [b' '; CARD_SIZE];
    let keyword = keyword.as_bytes();
    let keyword_len = keyword.len().min(8);
    record[..keyword_len].copy_from_slice(&keyword[..keyword_len]);
    record[8] = b'=';

    let mut text = value.format();
    // Strings start in column 11, everything else ends in column 30.
    if !matches!(value, FitsValue::Text(_)) && text.len() < 20 {
        text = format!("{:>20}", text);
    }
    if let Some(comment) = comment {
        text = format!("{} / {}", text, comment);
    }
    let bytes = text.as_bytes();
    let len = bytes.len().min(CARD_SIZE - 10);
    record[10..10 + len].copy_from_slice(&bytes[..len]);
    record
}

fn end_card() -> [u8; CARD_SIZE] {
    let mut record = [b' '; CARD_SIZE];
    record[..3].copy_from_slice(b"END");
    record
}

/// Writes `raster` as unsigned 16-bit data (BITPIX 16, BZERO 32768), first
/// row first, followed by the cards of `header`.
pub fn write_fits(path: &Path, raster: &Raster, header: &FitsHeader)
                  -> Result<(), CanonicalError> {
    let io_error = |e: std::io::Error| internal_error(
        format!("Error writing {:?}: {:?}", path, e).as_str());
    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);

    let mut cards = vec![
        card("SIMPLE", &FitsValue::Logical(true), Some("conforms to FITS standard")),
        card("BITPIX", &FitsValue::Integer(16), Some("array data type")),
        card("NAXIS", &FitsValue::Integer(2), Some("number of array dimensions")),
        card("NAXIS1", &FitsValue::Integer(raster.width() as i64), None),
        card("NAXIS2", &FitsValue::Integer(raster.height() as i64), None),
        card("BZERO", &FitsValue::Integer(32768), None),
        card("BSCALE", &FitsValue::Integer(1), None),
    ];
    for c in header.cards() {
        if !STRUCTURAL.contains(&c.keyword.as_str()) {
            cards.push(card(&c.keyword, &c.value, c.comment.as_deref()));
        }
    }
    cards.push(end_card());
    for c in &cards {
        writer.write_all(c).map_err(io_error)?;
    }
    let header_size = cards.len() * CARD_SIZE;
    let padding = (BLOCK_SIZE - header_size % BLOCK_SIZE) % BLOCK_SIZE;
    writer.write_all(&vec![b' '; padding]).map_err(io_error)?;

    let mut data = Vec::with_capacity(raster.as_raw().len() * 2);
    for value in raster.as_raw() {
        let signed = (*value as i32 - 32768) as i16;
        data.extend_from_slice(&signed.to_be_bytes());
    }
    let padding = (BLOCK_SIZE - data.len() % BLOCK_SIZE) % BLOCK_SIZE;
    data.resize(data.len() + padding, 0);
    writer.write_all(&data).map_err(io_error)?;
    writer.flush().map_err(io_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::error::ErrorKind;

    fn sample_header() -> FitsHeader {
        let mut header = FitsHeader::new();
        header.set("ra-mnt", FitsValue::Float(303.25), Some("degrees"));
        header.set("DEC-MNT", FitsValue::Float(-46.5), None);
        header.set("OBSERVER", FitsValue::Text("O'Brien".to_string()), None);
        header.set("DATE-OBS", FitsValue::Text("2017-03-01T06:00:00".to_string()), None);
        header.set("ISO", FitsValue::Integer(100), None);
        header.set("FIELD", FitsValue::Text(String::new()), None);
        header.set("camera_serial", FitsValue::Text("12345".to_string()), None);
        header
    }

    #[test]
    fn test_write_then_read_header() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.fits");
        let raster = Raster::from_fn(7, 3, |x, y| Luma([(x * 1000 + y) as u16]));
        write_fits(&path, &raster, &sample_header()).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() % BLOCK_SIZE, 0);
        assert!(bytes.starts_with(b"SIMPLE  =                    T"));

        let header = read_header(&path).unwrap();
        assert_eq!(header.get("BITPIX"), Some(&FitsValue::Integer(16)));
        assert_eq!(header.get_f64("NAXIS1"), Some(7.0));
        assert_eq!(header.get_f64("RA-MNT"), Some(303.25));
        assert_eq!(header.get_f64("dec-mnt"), Some(-46.5));
        assert_eq!(header.get_str("OBSERVER"), Some("O'Brien"));
        assert_eq!(header.get_str("FIELD"), Some(""));
        assert_eq!(header.get_f64("FIELD"), None);
        assert_eq!(header.get_f64("ISO"), Some(100.0));
        // Truncated to 8 characters.
        assert_eq!(header.get_str("CAMERA_S"), Some("12345"));
        assert_eq!(header.get_time("DATE-OBS"),
                   Some(Utc.with_ymd_and_hms(2017, 3, 1, 6, 0, 0).unwrap()));

        // Data follows the first header block, big-endian with BZERO offset.
        let first = i16::from_be_bytes([bytes[BLOCK_SIZE], bytes[BLOCK_SIZE + 1]]);
        assert_eq!(first as i32 + 32768, 0);
        let second = i16::from_be_bytes([bytes[BLOCK_SIZE + 2], bytes[BLOCK_SIZE + 3]]);
        assert_eq!(second as i32 + 32768, 1000);
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("                 1.5E3 / note"),
                   (FitsValue::Float(1500.0), Some("note".to_string())));
        assert_eq!(parse_value("  -2.5D-1"), (FitsValue::Float(-0.25), None));
        assert_eq!(parse_value("'a/b     ' / slash inside"),
                   (FitsValue::Text("a/b".to_string()),
                    Some("slash inside".to_string())));
        assert_eq!(parse_value("                    F").0, FitsValue::Logical(false));
    }

    #[test]
    fn test_time_with_offset() {
        let mut header = FitsHeader::new();
        header.set("DATE-OBS", FitsValue::Text("2017-03-01T08:00:00+02:00".to_string()),
                   None);
        assert_eq!(header.get_time("DATE-OBS"),
                   Some(Utc.with_ymd_and_hms(2017, 3, 1, 6, 0, 0).unwrap()));
    }

    #[test]
    fn test_not_fits() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("b.fits");
        fs::write(&path, "not a fits file").unwrap();
        let err = read_header(&path).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Configuration);

        let err = read_header(&dir.path().join("absent.fits")).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Precondition);
    }
}
