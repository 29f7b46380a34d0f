// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::thread;

use canonical_error::CanonicalError;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::astro_util::{hour_angle, normalize_hour_angle, SkyCoordinate};
use crate::convert::{cr2_to_fits, ObservationHeaders};
use crate::drift::{solve_offset, DriftTracker, RateAdjustment};
use crate::error::{configuration_error, PipelineError, Stage, StageContext};
use crate::fits::{read_header, FitsHeader};
use crate::pointing::PointingError;
use crate::solve_field::{get_solve_field, SearchHint, SolveOutcome, SolveRequest};
use crate::toolchain::Toolchain;
use crate::tracking_correction::{get_tracking_correction, CorrectionCommand};
use crate::wcs_info::{get_wcsinfo, CalibrationRecord};

/// What the capturing software recorded about an exposure.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ImageMetadata {
    // Where the mount was commanded to point (RA-MNT, DEC-MNT).
    pub nominal: Option<SkyCoordinate>,

    // Mount hour angle (HA-MNT), hours in [-12, 12).
    pub hour_angle: Option<f64>,

    // DATE-OBS.
    pub observed_at: Option<DateTime<Utc>>,

    // Observatory longitude (LONG-OBS), degrees east.
    pub longitude: Option<f64>,
}

impl ImageMetadata {
    pub fn from_header(header: &FitsHeader) -> Result<Self, CanonicalError> {
        let nominal = match (header.get_f64("RA-MNT"), header.get_f64("DEC-MNT")) {
            (Some(ra), Some(dec)) => Some(SkyCoordinate::from_degrees(ra, dec)?),
            _ => None,
        };
        Ok(ImageMetadata{
            nominal,
            hour_angle: header.get_f64("HA-MNT")
                .filter(|ha| ha.is_finite())
                .map(|ha| normalize_hour_angle(ha / 15.0)),
            observed_at: header.get_time("DATE-OBS"),
            longitude: header.get_f64("LONG-OBS"),
        })
    }

    /// Solver hint centered on the commanded position, if there is one.
    pub fn search_hint(&self, radius: f64) -> SearchHint {
        match &self.nominal {
            Some(c) => SearchHint{
                ra: Some(c.ra().value),
                dec: Some(c.dec().value),
                radius: Some(radius),
            },
            None => SearchHint::default(),
        }
    }

    /// Hour angle of a target at `ra` (degrees): the recorded mount hour
    /// angle when present, otherwise computed from the observatory longitude
    /// and exposure time.
    pub fn hour_angle_of(&self, ra: f64) -> Option<f64> {
        if self.hour_angle.is_some() {
            return self.hour_angle;
        }
        match (self.longitude, &self.observed_at) {
            (Some(longitude), Some(time)) => Some(hour_angle(ra, longitude, time)),
            _ => None,
        }
    }
}

/// Result of taking one exposure through the whole correction pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct PointingReport {
    pub image: PathBuf,
    pub solve: SolveOutcome,
    pub calibration: CalibrationRecord,
    pub nominal: SkyCoordinate,
    pub pointing_error: PointingError,
    pub hour_angle: f64,
    pub correction: CorrectionCommand,
}

#[derive(Clone, Debug, Serialize)]
pub struct DriftReport {
    pub first: CalibrationRecord,
    pub second: CalibrationRecord,
    pub adjustment: RateAdjustment,
}

/// Drift fitted over a run of exposures of one field.
#[derive(Clone, Debug, Serialize)]
pub struct DriftSeriesReport {
    // Exposures that contributed to the fit.
    pub used: usize,
    // Exposures left out as off the trend.
    pub rejected: Vec<PathBuf>,
    // Arcsec per second.
    pub drift_rate: Option<f64>,
    pub rate_adjustment: Option<f64>,
    pub rate_interval_bound: Option<f64>,
}

/// Runs the stages in order for one image or image pair. Stateless apart
/// from its toolchain, so it can be shared between threads working on
/// different images.
pub struct PointingPipeline {
    toolchain: Toolchain,
}

impl PointingPipeline {
    pub fn new(toolchain: Toolchain) -> Self {
        PointingPipeline{toolchain}
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// Converts a raw exposure to FITS so that it can enter the pipeline.
    pub fn convert(&self, raw: &Path, fits_path: Option<&Path>,
                   headers: &ObservationHeaders, overwrite: bool, remove_raw: bool)
                   -> Result<PathBuf, PipelineError> {
        cr2_to_fits(&self.toolchain, raw, fits_path, headers, overwrite, remove_raw)
            .stage(Stage::Convert, raw)
    }

    pub fn read_metadata(&self, image: &Path) -> Result<ImageMetadata, PipelineError> {
        let header = read_header(image).stage(Stage::Metadata, image)?;
        ImageMetadata::from_header(&header).stage(Stage::Metadata, image)
    }

    /// Plate-solves `image` and reads back its calibration. The solved
    /// image, not the input, is what wcsinfo reads.
    pub fn solve(&self, image: &Path, metadata: &ImageMetadata)
                 -> Result<(SolveOutcome, CalibrationRecord), PipelineError> {
        let request = SolveRequest::new(image, &self.toolchain)
            .with_hint(metadata.search_hint(self.toolchain.search_radius));
        let outcome = get_solve_field(&self.toolchain, request)
            .stage(Stage::Solve, image)?;
        let calibration = get_wcsinfo(&self.toolchain, &outcome.solved_file)
            .stage(Stage::WcsInfo, image)?
            .with_observed_at(metadata.observed_at);
        Ok((outcome, calibration))
    }

    /// Solves `image` and derives the guide correction that would move the
    /// mount onto its commanded position. `hour_angle` (hours) overrides the
    /// one recorded with the image.
    pub fn pointing_report(&self, image: &Path, hour_angle: Option<f64>)
                           -> Result<PointingReport, PipelineError> {
        let metadata = self.read_metadata(image)?;
        let nominal = metadata.nominal.ok_or_else(|| configuration_error(
            "image has no RA-MNT/DEC-MNT")).stage(Stage::Metadata, image)?;
        let (solve, calibration) = self.solve(image, &metadata)?;
        let pointing_error = PointingError::from_record(&nominal, &calibration)
            .stage(Stage::PointingError, image)?;

        let solved_ra = calibration.center.map(|c| c.ra().value)
            .unwrap_or(nominal.ra().value);
        let hour_angle = hour_angle.or_else(|| metadata.hour_angle_of(solved_ra))
            .ok_or_else(|| configuration_error(
                "no hour angle: need HA-MNT, or LONG-OBS and DATE-OBS"))
            .stage(Stage::Correction, image)?;
        let correction = get_tracking_correction(&pointing_error, hour_angle,
                                                 self.toolchain.guide_rate)
            .stage(Stage::Correction, image)?;
        info!("{:?}: off by {:.1}\"; {} {:.0} ms, {} {:.0} ms",
              image, pointing_error.separation.value,
              correction.ra.direction, correction.ra.pulse_ms,
              correction.dec.direction, correction.dec.pulse_ms);
        Ok(PointingReport{
            image: image.to_path_buf(),
            solve,
            calibration,
            nominal,
            pointing_error,
            hour_angle,
            correction,
        })
    }

    /// pointing_report() for several images at once, one thread per image.
    /// Results are in the order of `images`.
    pub fn pointing_reports(&self, images: &[PathBuf], hour_angle: Option<f64>)
                            -> Vec<Result<PointingReport, PipelineError>> {
        thread::scope(|scope| {
            let workers: Vec<_> = images.iter()
                .map(|image| scope.spawn(move || self.pointing_report(image, hour_angle)))
                .collect();
            workers.into_iter().zip(images)
                .map(|(worker, image)| match worker.join() {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::new(
                        Stage::Solve, image,
                        canonical_error::internal_error("pipeline worker panicked"))),
                })
                .collect()
        })
    }

    /// Solves two exposures of the same field and measures how far the
    /// mount's RA tracking drifted between them.
    pub fn drift(&self, first: &Path, second: &Path) -> Result<DriftReport, PipelineError> {
        let first_metadata = self.read_metadata(first)?;
        let second_metadata = self.read_metadata(second)?;
        let (_, first_calibration) = self.solve(first, &first_metadata)?;
        let (_, second_calibration) = self.solve(second, &second_metadata)?;
        let adjustment = solve_offset(&first_calibration, &second_calibration)
            .stage(Stage::Drift, second)?;
        info!("Tracking rate adjustment {:.6} from {:?} and {:?}",
              adjustment.rate_adjustment, first, second);
        Ok(DriftReport{
            first: first_calibration,
            second: second_calibration,
            adjustment,
        })
    }

    /// Solves a time-ordered run of exposures of one field and fits a
    /// constant RA drift to them. Once the trend is established, exposures
    /// more than `sigma` times its noise away from it are left out.
    pub fn drift_series(&self, images: &[PathBuf], sigma: f64)
                        -> Result<DriftSeriesReport, PipelineError> {
        let mut tracker = DriftTracker::new(images.len());
        let mut rejected = Vec::new();
        for image in images {
            let metadata = self.read_metadata(image)?;
            let (_, calibration) = self.solve(image, &metadata)?;
            if !tracker.fits_trend(&calibration, sigma).stage(Stage::Drift, image)? {
                warn!("{:?} is off the drift trend; leaving it out", image);
                rejected.push(image.clone());
                continue;
            }
            tracker.add(&calibration).stage(Stage::Drift, image)?;
        }
        if let Some(adjustment) = tracker.rate_adjustment() {
            info!("Tracking rate adjustment {:.6} from {} exposures",
                  adjustment, tracker.count());
        }
        Ok(DriftSeriesReport{
            used: tracker.count(),
            rejected,
            drift_rate: tracker.drift_rate(),
            rate_adjustment: tracker.rate_adjustment(),
            rate_interval_bound: tracker.rate_interval_bound(),
        })
    }
}
