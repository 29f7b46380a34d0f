// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::Path;

use canonical_error::CanonicalError;
use image::imageops::flip_vertical_in_place;
use log::{debug, warn};

use crate::error::{configuration_error, precondition_error};
use crate::fits::Raster;

/// A binary (P5) greyscale image as written by dcraw.
#[derive(Clone, Debug)]
pub struct PgmImage {
    pub max_value: u16,
    // Bottom row of the file first, matching FITS row order.
    pub raster: Raster,
}

// Returns the next whitespace-delimited header token and the offset just
// past it. '#' comments run to end of line.
fn next_token(buffer: &[u8], mut pos: usize) -> Option<(&[u8], usize)> {
    loop {
        while pos < buffer.len() && buffer[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos < buffer.len() && buffer[pos] == b'#' {
            while pos < buffer.len() && buffer[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }
        break;
    }
    let start = pos;
    while pos < buffer.len() && !buffer[pos].is_ascii_whitespace() {
        pos += 1;
    }
    if start == pos { None } else { Some((&buffer[start..pos], pos)) }
}

fn header_number(buffer: &[u8], pos: usize, what: &str)
                 -> Result<(u32, usize), CanonicalError> {
    let (token, pos) = next_token(buffer, pos).ok_or_else(
        || configuration_error(format!("PGM header has no {}", what).as_str()))?;
    let value = std::str::from_utf8(token).ok()
        .and_then(|t| t.parse::<u32>().ok())
        .ok_or_else(|| configuration_error(
            format!("PGM {} is not a number: {:?}",
                    what, String::from_utf8_lossy(token)).as_str()))?;
    Ok((value, pos))
}

/// Decodes a P5 image. Samples are one byte when the maximum value is below
/// 256 and two big-endian bytes otherwise.
pub fn parse_pgm(buffer: &[u8]) -> Result<PgmImage, CanonicalError> {
    let (magic, pos) = next_token(buffer, 0)
        .ok_or_else(|| configuration_error("empty PGM data"))?;
    if magic != b"P5" {
        return Err(configuration_error(
            format!("not a binary PGM (magic {:?})",
                    String::from_utf8_lossy(magic)).as_str()));
    }
    let (width, pos) = header_number(buffer, pos, "width")?;
    let (height, pos) = header_number(buffer, pos, "height")?;
    let (max_value, pos) = header_number(buffer, pos, "maximum value")?;
    if width == 0 || height == 0 || max_value == 0 || max_value > 65535 {
        return Err(configuration_error(
            format!("bad PGM geometry {}x{} max {}", width, height, max_value).as_str()));
    }
    // Exactly one whitespace byte separates the header from the samples.
    let data = &buffer[(pos + 1).min(buffer.len())..];
    let bytes_per_sample = if max_value < 256 { 1 } else { 2 };
    let count = width as usize * height as usize;
    if data.len() < count * bytes_per_sample {
        return Err(configuration_error(
            format!("PGM data truncated: {} bytes for {}x{}",
                    data.len(), width, height).as_str()));
    }
    let samples: Vec<u16> = if bytes_per_sample == 1 {
        data[..count].iter().map(|b| *b as u16).collect()
    } else {
        data[..count * 2].chunks_exact(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .collect()
    };
    let mut raster = Raster::from_raw(width, height, samples)
        .ok_or_else(|| configuration_error("PGM sample count mismatch"))?;
    flip_vertical_in_place(&mut raster);
    Ok(PgmImage{max_value: max_value as u16, raster})
}

/// Reads the PGM file at `path`, optionally deleting it afterwards.
pub fn read_pgm(path: &Path, remove_after: bool) -> Result<PgmImage, CanonicalError> {
    let buffer = fs::read(path).map_err(|e| precondition_error(
        format!("Cannot read {:?}: {:?}", path, e).as_str()))?;
    let image = parse_pgm(&buffer)?;
    debug!("Read {}x{} PGM from {:?}",
           image.raster.width(), image.raster.height(), path);
    if remove_after {
        if let Err(e) = fs::remove_file(path) {
            warn!("Could not remove {:?}: {:?}", path, e);
        }
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::error::ErrorKind;

    // Pixel value at column x, counting rows from the top of the file.
    fn file_pixel(image: &PgmImage, x: u32, file_row: u32) -> u16 {
        let Luma([v]) = *image.raster.get_pixel(x, image.raster.height() - 1 - file_row);
        v
    }

    // Rows listed top of file first.
    fn encode(rows: &[Vec<u16>], max_value: u16) -> Vec<u8> {
        let mut out = format!("P5\n{} {}\n{}\n", rows[0].len(), rows.len(), max_value)
            .into_bytes();
        for row in rows {
            for v in row {
                if max_value < 256 {
                    out.push(*v as u8);
                } else {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        out
    }

    #[test]
    fn test_sixteen_bit() {
        let rows = vec![vec![1, 2, 3, 4, 5], vec![10, 20, 30, 40, 50],
                        vec![4000, 4001, 4002, 4003, 4095]];
        let image = parse_pgm(&encode(&rows, 4095)).unwrap();
        assert_eq!(image.raster.dimensions(), (5, 3));
        assert_eq!(image.max_value, 4095);
        // Flipped: last file row is first.
        assert_eq!(image.raster.get_pixel(0, 0), &Luma([4000]));
        assert_eq!(image.raster.get_pixel(4, 2), &Luma([5]));
        assert_eq!(file_pixel(&image, 1, 1), 20);
        assert!(image.raster.pixels().all(|p| p.0[0] <= image.max_value));
    }

    #[test]
    fn test_nineteen_byte_header() {
        let header = b"P5\n5202 3464\n65535\n";
        assert_eq!(header.len(), 19);
        let mut data = header.to_vec();
        data.resize(19 + 5202 * 3464 * 2, 0);
        let image = parse_pgm(&data).unwrap();
        assert_eq!(image.raster.dimensions(), (5202, 3464));
    }

    #[test]
    fn test_eight_bit_with_comment() {
        let mut data = b"P5\n# from dcraw\n2 2\n255\n".to_vec();
        data.extend_from_slice(&[1, 2, 3, 4]);
        let image = parse_pgm(&data).unwrap();
        assert_eq!(file_pixel(&image, 0, 0), 1);
        assert_eq!(file_pixel(&image, 1, 1), 4);
    }

    #[test]
    fn test_malformed() {
        for data in [&b"P6\n2 2\n255\n1234"[..], &b"P5\n2 x\n255\n1234"[..],
                     &b"P5\n2 2\n255\n12"[..], &b""[..]] {
            let err = parse_pgm(data).unwrap_err();
            assert_eq!(ErrorKind::of(&err), ErrorKind::Configuration);
        }
    }

    #[test]
    fn test_read_and_remove() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.pgm");
        fs::write(&path, encode(&[vec![7, 8], vec![9, 10]], 1023)).unwrap();
        let image = read_pgm(&path, true).unwrap();
        assert_eq!(file_pixel(&image, 0, 0), 7);
        assert!(!path.exists());
        let err = read_pgm(&path, false).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Precondition);
    }
}
