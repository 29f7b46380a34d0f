// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod astro_util;
pub mod convert;
pub mod drift;
pub mod error;
pub mod exif;
pub mod fits;
pub mod pgm;
pub mod pipeline;
pub mod pointing;
pub mod solve_field;
pub mod tool_subprocess;
pub mod toolchain;
pub mod tracking_correction;
pub mod unit_parser;
pub mod units;
pub mod wcs_info;

#[cfg(test)]
mod test_util;
