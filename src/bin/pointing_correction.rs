// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use canonical_error::CanonicalError;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::Serialize;
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use cedar_guide::convert::ObservationHeaders;
use cedar_guide::error::configuration_error;
use cedar_guide::pipeline::PointingPipeline;
use cedar_guide::pointing::PointingError;
use cedar_guide::solve_field::{get_solve_field, SearchHint, SolveRequest};
use cedar_guide::tool_subprocess::kill_active_tools;
use cedar_guide::toolchain::Toolchain;
use cedar_guide::tracking_correction::get_tracking_correction;
use cedar_guide::wcs_info::get_wcsinfo;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Plate solver executable. Defaults to solve-field on PATH, then
    /// $PANDIR/astrometry/bin/solve-field.
    #[arg(long)]
    solver: Option<PathBuf>,

    /// WCS info executable, located like the solver when absent.
    #[arg(long)]
    wcsinfo: Option<PathBuf>,

    #[arg(long, default_value = "exiftool")]
    exiftool: PathBuf,

    #[arg(long, default_value = "dcraw")]
    dcraw: PathBuf,

    /// Observatory software root. Overrides $PANDIR.
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Scratch directory for the solver. Overrides $PANTEMP.
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Plate solve time limit, seconds.
    #[arg(long, value_parser = parse_duration, default_value = "30")]
    timeout: Duration,

    /// Guide rate as a fraction of sidereal.
    #[arg(long, default_value = "0.9")]
    guide_rate: f64,

    /// Directory for a daily-rotated log file. Logs go only to stderr when
    /// absent.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long, default_value = "pointing_correction.log")]
    log_file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plate-solve one image.
    Solve {
        image: PathBuf,
        /// Search hint, degrees.
        #[arg(long, requires = "dec")]
        ra: Option<f64>,
        #[arg(long, requires = "ra")]
        dec: Option<f64>,
        #[arg(long)]
        radius: Option<f64>,
        /// Keep the original image instead of replacing it with the solved one.
        #[arg(long)]
        no_replace: bool,
        /// Keep the solver's intermediate files.
        #[arg(long)]
        keep_extras: bool,
    },
    /// Report the calibration of a solved image.
    Wcsinfo {
        image: PathBuf,
    },
    /// Solve images and compute the guide correction for each.
    Pointing {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Hour angle of the mount, hours. Overrides the images' headers.
        #[arg(long, allow_hyphen_values = true)]
        hour_angle: Option<f64>,
    },
    /// Compute the guide correction for a known pointing error.
    Correction {
        /// Hours.
        #[arg(long, allow_hyphen_values = true)]
        hour_angle: f64,
        /// Nominal minus solved, arcseconds.
        #[arg(long, allow_hyphen_values = true)]
        delta_ra: f64,
        #[arg(long, allow_hyphen_values = true)]
        delta_dec: f64,
    },
    /// Measure RA tracking drift over exposures of one field, in time order.
    /// Two exposures are compared directly; more are fitted to a trend.
    Drift {
        #[arg(num_args = 2.., required = true)]
        images: Vec<PathBuf>,
        /// Trend rejection threshold, multiples of the fit's noise.
        #[arg(long, default_value = "3.0")]
        sigma: f64,
    },
    /// Convert a raw camera image to FITS.
    Convert {
        cr2: PathBuf,
        /// Output path; defaults to the raw image with a .fits extension.
        #[arg(long)]
        fits: Option<PathBuf>,
        /// JSON file of observation details for the header.
        #[arg(long)]
        headers: Option<PathBuf>,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        remove_cr2: bool,
    },
}

fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseFloatError> {
    let seconds: f64 = arg.parse()?;
    Ok(Duration::from_secs_f64(seconds.max(0.0)))
}

fn toolchain_from_args(args: &Args) -> Toolchain {
    let mut toolchain = Toolchain::from_env();
    toolchain.solver = args.solver.clone();
    toolchain.wcsinfo = args.wcsinfo.clone();
    toolchain.exiftool = args.exiftool.clone();
    toolchain.dcraw = args.dcraw.clone();
    if let Some(dir) = &args.install_dir {
        toolchain.install_dir = dir.clone();
    }
    if let Some(dir) = &args.temp_dir {
        toolchain.temp_dir = Some(dir.clone());
    }
    toolchain.solve_timeout = args.timeout;
    toolchain.guide_rate = args.guide_rate;
    toolchain
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CanonicalError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| configuration_error(
        format!("Cannot encode result: {:?}", e).as_str()))?;
    println!("{}", text);
    Ok(())
}

fn read_headers(path: &Path) -> Result<ObservationHeaders, CanonicalError> {
    let text = fs::read_to_string(path).map_err(|e| configuration_error(
        format!("Cannot read {:?}: {:?}", path, e).as_str()))?;
    serde_json::from_str(&text).map_err(|e| configuration_error(
        format!("Bad headers in {:?}: {:?}", path, e).as_str()))
}

fn run(args: &Args) -> Result<(), CanonicalError> {
    let toolchain = toolchain_from_args(args);
    match &args.command {
        Command::Solve{image, ra, dec, radius, no_replace, keep_extras} => {
            let hint = SearchHint{
                ra: *ra,
                dec: *dec,
                radius: radius.or(ra.map(|_| toolchain.search_radius)),
            };
            let mut request = SolveRequest::new(image, &toolchain).with_hint(hint);
            request.replace = !no_replace;
            request.remove_extras = !keep_extras;
            print_json(&get_solve_field(&toolchain, request)?)
        },
        Command::Wcsinfo{image} => {
            print_json(&get_wcsinfo(&toolchain, image)?)
        },
        Command::Pointing{images, hour_angle} => {
            let pipeline = PointingPipeline::new(toolchain);
            let mut reports = Vec::new();
            let mut failures = 0;
            for result in pipeline.pointing_reports(images, *hour_angle) {
                match result {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        warn!("{}", e);
                        failures += 1;
                    },
                }
            }
            print_json(&reports)?;
            if failures > 0 {
                return Err(configuration_error(
                    format!("{} of {} images failed", failures, images.len()).as_str()));
            }
            Ok(())
        },
        Command::Correction{hour_angle, delta_ra, delta_dec} => {
            let pointing_error = PointingError::from_arcseconds(*delta_ra, *delta_dec);
            print_json(&get_tracking_correction(&pointing_error, *hour_angle,
                                                toolchain.guide_rate)?)
        },
        Command::Drift{images, sigma} => {
            let pipeline = PointingPipeline::new(toolchain);
            match images.as_slice() {
                [first, second] => print_json(&pipeline.drift(first, second)?),
                _ => print_json(&pipeline.drift_series(images, *sigma)?),
            }
        },
        Command::Convert{cr2, fits, headers, overwrite, remove_cr2} => {
            let headers = match headers {
                Some(path) => read_headers(path)?,
                None => ObservationHeaders::default(),
            };
            let pipeline = PointingPipeline::new(toolchain);
            print_json(&pipeline.convert(cr2, fits.as_deref(), &headers,
                                         *overwrite, *remove_cr2)?)
        },
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging. Results go to stdout, so logs go to stderr.
    let (non_blocking_stderr, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stderr());
    let mut _guard2 = None;
    let file_layer = match &args.log_dir {
        Some(dir) => match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(&args.log_file)
            .max_log_files(10)
            .build(dir)
        {
            Ok(file_appender) => {
                let (non_blocking_file, guard) = NonBlockingBuilder::default()
                    .lossy(false)
                    .finish(file_appender);
                _guard2 = Some(guard);
                Some(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
            },
            Err(e) => {
                eprintln!("Cannot log to {:?}: {:?}", dir, e);
                None
            },
        },
        None => None,
    };
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stderr))
        .with(file_layer)
        .init();

    info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    // External tools run in their own process groups and do not see a
    // terminal interrupt, so take them down with us.
    if let Err(e) = ctrlc::set_handler(|| {
        warn!("Got control-c");
        kill_active_tools();
        std::process::exit(130);
    }) {
        warn!("Cannot install interrupt handler: {:?}", e);
    }
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}: {}", e.code, e.message);
            ExitCode::FAILURE
        },
    }
}
