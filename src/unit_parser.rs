// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::units::{AngularValue, Unit};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaggedValue {
    // Numeric value of a key with a known unit.
    Quantity(AngularValue),
    // Numeric value of a key with no known unit.
    Number(f64),
    // Non-numeric value of a key with no known unit.
    Text(String),
}

impl TaggedValue {
    pub fn quantity(&self) -> Option<AngularValue> {
        match self {
            TaggedValue::Quantity(q) => Some(*q),
            _ => None,
        }
    }

    pub fn number(&self) -> Option<f64> {
        match self {
            TaggedValue::Quantity(q) => Some(q.value),
            TaggedValue::Number(n) => Some(*n),
            TaggedValue::Text(_) => None,
        }
    }
}

/// Physical unit of the keys emitted by astrometry.net's `wcsinfo`.
pub fn unit_for_key(key: &str) -> Option<Unit> {
    let unit = match key {
        "crpix0" | "crpix1" | "imagew" | "imageh" => Unit::Pixel,
        "crval0" | "crval1" => Unit::Degree,
        "cd11" | "cd12" | "cd21" | "cd22" => Unit::DegreePerPixel,
        "pixscale" => Unit::ArcsecPerPixel,
        "orientation" | "orientation_center" => Unit::Degree,
        "ra_center" | "dec_center" => Unit::Degree,
        "ra_center_h" => Unit::Hour,
        "ra_center_m" => Unit::Minute,
        "ra_center_s" => Unit::Second,
        "dec_center_d" => Unit::Degree,
        "dec_center_m" => Unit::Arcminute,
        "dec_center_s" => Unit::Arcsecond,
        "fieldarea" => Unit::SquareDegree,
        "fieldw" | "fieldh" => Unit::Degree,
        "decmin" | "decmax" | "ramin" | "ramax" => Unit::Degree,
        "ra_min_merc" | "ra_max_merc" | "dec_min_merc" | "dec_max_merc" |
        "merc_diff" => Unit::Degree,
        _ => return None,
    };
    Some(unit)
}

/// Parses line-oriented `key value` text. Lines that do not split into
/// exactly two tokens, or whose key has a unit but whose value is not
/// numeric, are dropped; everything else is kept.
pub fn parse_unit_tagged(text: &str) -> BTreeMap<String, TaggedValue> {
    let mut values = BTreeMap::new();
    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() != 2 {
            debug!("Skipping line with {} tokens: {:?}", tokens.len(), line);
            continue;
        }
        let (key, raw) = (tokens[0], tokens[1]);
        let number = raw.parse::<f64>().ok();
        let value = match (unit_for_key(key), number) {
            (Some(unit), Some(n)) => TaggedValue::Quantity(AngularValue::new(n, unit)),
            (Some(_), None) => {
                debug!("Skipping non-numeric value for {}: {:?}", key, raw);
                continue;
            },
            (None, Some(n)) => TaggedValue::Number(n),
            (None, None) => TaggedValue::Text(raw.to_string()),
        };
        values.insert(key.to_string(), value);
    }
    values
}
