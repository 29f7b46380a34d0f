// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;

use canonical_error::CanonicalError;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::astro_util::SIDEREAL_RATE;
use crate::error::configuration_error;
use crate::units::{wrap_degrees_180, AngularValue, Unit};
use crate::wcs_info::CalibrationRecord;

// Plate solutions are not more precise than this, arcseconds.
const NOISE_FLOOR: f64 = 0.1;

/// Tracking-rate analysis of two solved exposures of the same field.
#[derive(Clone, Debug, Serialize)]
pub struct RateAdjustment {
    pub pixel_scale: AngularValue,

    // Seconds from the first exposure to the second.
    pub delta_t: f64,

    // Motion of the field center from the first exposure to the second,
    // arcseconds.
    pub delta_ra: AngularValue,
    pub delta_dec: AngularValue,

    // Arcsec per second.
    pub sidereal_rate: f64,

    // RA the mount should have tracked over delta_t, arcseconds.
    pub ra_correct: AngularValue,

    // RA the mount actually tracked over delta_t, arcseconds.
    pub ra_actual: AngularValue,

    // Arcsec per second.
    pub rate_actual: f64,

    // Factor to apply to the current tracking rate.
    pub rate_adjustment: f64,
}

/// Compares the solved centers of two exposures, taken `delta_t` apart, and
/// derives the factor by which the mount's RA tracking rate is off.
pub fn solve_offset(first: &CalibrationRecord, second: &CalibrationRecord)
                    -> Result<RateAdjustment, CanonicalError> {
    let first_center = first.require_center()?;
    let second_center = second.require_center()?;
    let pixel_scale = first.require_pixel_scale()?;
    second.require_pixel_scale()?;
    let delta_t = seconds_between(&first.require_observed_at()?,
                                  &second.require_observed_at()?);
    if !(delta_t > 0.0) {
        return Err(configuration_error(
            format!("second exposure is {} s after the first; must be later",
                    delta_t).as_str()));
    }

    // SkyCoordinate holds degrees.
    let delta_ra = wrap_degrees_180(second_center.ra().value -
                                    first_center.ra().value) * 3600.0;
    let delta_dec =
        (second_center.dec().value - first_center.dec().value) * 3600.0;

    let ra_correct = SIDEREAL_RATE * delta_t;
    let ra_actual = ra_correct + delta_ra;
    let rate_actual = ra_actual / delta_t;
    if rate_actual == 0.0 {
        return Err(configuration_error(
            "measured tracking rate is zero; no adjustment possible"));
    }
    let rate_adjustment = SIDEREAL_RATE / rate_actual;
    debug!("Drift {:.2}\" over {:.1}s; rate adjustment {:.6}",
           delta_ra, delta_t, rate_adjustment);

    Ok(RateAdjustment{
        pixel_scale,
        delta_t,
        delta_ra: AngularValue::new(delta_ra, Unit::Arcsecond),
        delta_dec: AngularValue::new(delta_dec, Unit::Arcsecond),
        sidereal_rate: SIDEREAL_RATE,
        ra_correct: AngularValue::new(ra_correct, Unit::Arcsecond),
        ra_actual: AngularValue::new(ra_actual, Unit::Arcsecond),
        rate_actual,
        rate_adjustment,
    })
}

fn seconds_between(t0: &DateTime<Utc>, t1: &DateTime<Utc>) -> f64 {
    (*t1 - *t0).num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or_else(|| (*t1 - *t0).num_seconds() as f64)
}

struct DataPoint {
    // Seconds since the first exposure.
    x: f64,
    // RA of the field center relative to the first exposure, arcseconds.
    y: f64,
}

// Models RA drift over a run of exposures of one field, assuming a constant
// drift rate. The rate is a least squares fit over the most recent exposures,
// and an estimate of its uncertainty is derived from the scatter of the
// exposures about the fit.
pub struct DriftTracker {
    capacity: usize,

    // Time and RA of the first exposure to be add()ed.
    first: Option<(DateTime<Utc>, f64)>,

    // Time of most recent exposure to be add()ed.
    last: Option<DateTime<Utc>>,

    // Oldest first.
    samples: VecDeque<DataPoint>,

    // Drift in arcsec per second.
    slope: f64,

    intercept: f64,

    // RMS deviation of the samples from the fitted trend, arcseconds.
    noise: f64,
}

impl DriftTracker {
    // `capacity` governs how many exposures are kept for the fit.
    pub fn new(capacity: usize) -> Self {
        DriftTracker{
            capacity: capacity.max(2),
            first: None,
            last: None,
            samples: VecDeque::with_capacity(capacity),
            slope: 0.0,
            intercept: 0.0,
            noise: 0.0,
        }
    }

    /// Adds a solved exposure. Exposures must be added in time order; one
    /// that is not later than its predecessor is dropped.
    pub fn add(&mut self, record: &CalibrationRecord) -> Result<(), CanonicalError> {
        let center = record.require_center()?;
        let time = record.require_observed_at()?;
        let ra = center.ra().value;
        if let Some(last) = self.last {
            if time <= last {
                warn!("Exposure time regressed from {:?} to {:?}; ignoring {:?}",
                      last, time, record.wcs_file);
                return Ok(());
            }
        }
        let (first_time, first_ra) = *self.first.get_or_insert((time, ra));
        self.last = Some(time);
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(DataPoint{
            x: seconds_between(&first_time, &time),
            y: wrap_degrees_180(ra - first_ra) * 3600.0,
        });
        self.fit();
        Ok(())
    }

    fn fit(&mut self) {
        let count = self.samples.len();
        if count < 2 {
            return;
        }
        let n = count as f64;
        let x_mean = self.samples.iter().map(|s| s.x).sum::<f64>() / n;
        let y_mean = self.samples.iter().map(|s| s.y).sum::<f64>() / n;
        let mut num = 0.0;
        let mut den = 0.0;
        for sample in &self.samples {
            num += (sample.x - x_mean) * (sample.y - y_mean);
            den += (sample.x - x_mean) * (sample.x - x_mean);
        }
        self.slope = num / den;
        self.intercept = y_mean - self.slope * x_mean;

        let mut y_variance = 0.0;
        for sample in &self.samples {
            let residual = sample.y - self.estimate(sample.x);
            y_variance += residual * residual;
        }
        self.noise = (y_variance / n).sqrt();
    }

    fn estimate(&self, x: f64) -> f64 {
        self.intercept + x * self.slope
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    // Determines if the given exposure is on-trend, within `sigma` multiple
    // of the model's noise (but at least NOISE_FLOOR). If count() is less
    // than 3, returns true.
    pub fn fits_trend(&self, record: &CalibrationRecord, sigma: f64)
                      -> Result<bool, CanonicalError> {
        let (first_time, first_ra) = match self.first {
            Some(f) if self.count() >= 3 => f,
            _ => return Ok(true),
        };
        let center = record.require_center()?;
        let time = record.require_observed_at()?;
        let x = seconds_between(&first_time, &time);
        let y = wrap_degrees_180(center.ra().value - first_ra) * 3600.0;
        Ok((y - self.estimate(x)).abs() <= sigma * self.noise.max(NOISE_FLOOR))
    }

    /// Estimated RA drift, arcsec per second. None until two exposures have
    /// been added.
    pub fn drift_rate(&self) -> Option<f64> {
        if self.count() < 2 { None } else { Some(self.slope) }
    }

    /// Factor to apply to the tracking rate to cancel the estimated drift.
    pub fn rate_adjustment(&self) -> Option<f64> {
        let rate_actual = SIDEREAL_RATE + self.drift_rate()?;
        if rate_actual == 0.0 { None } else { Some(SIDEREAL_RATE / rate_actual) }
    }

    // Estimate of the +/- range of drift_rate() within which the true drift
    // is likely to be. None until three exposures have been added.
    pub fn rate_interval_bound(&self) -> Option<f64> {
        if self.count() < 3 {
            return None;
        }
        let span = self.samples.back()?.x - self.samples.front()?.x;
        Some(self.noise / span)
    }

    pub fn clear(&mut self) {
        *self = DriftTracker::new(self.capacity);
    }
}
