// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use canonical_error::CanonicalError;
use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{precondition_error, solve_error, timeout_error};
use crate::tool_subprocess::ToolSubprocess;
use crate::toolchain::Toolchain;

/// Optional constraint on where the solver searches. Each part is passed to
/// the solver only when present.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SearchHint {
    // Degrees.
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub radius: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct SolveRequest {
    pub image: PathBuf,

    // Solver CPU limit, also the wall-clock limit for the solver process.
    pub timeout: Duration,

    // When given, used verbatim in place of default_options().
    pub options: Option<Vec<String>>,

    pub hint: SearchHint,

    // Let the solver overwrite its own outputs from an earlier run.
    pub overwrite: bool,

    // Do nothing if the image already has a .solved sentinel.
    pub skip_solved: bool,

    // Move the solver's output image over the input image.
    pub replace: bool,

    // Delete the solver's side files after a successful solve.
    pub remove_extras: bool,

    pub temp_dir: Option<PathBuf>,
}

impl SolveRequest {
    pub fn new(image: &Path, toolchain: &Toolchain) -> Self {
        SolveRequest{
            image: image.to_path_buf(),
            timeout: toolchain.solve_timeout,
            options: None,
            hint: SearchHint::default(),
            overwrite: true,
            skip_solved: toolchain.skip_solved,
            replace: toolchain.replace,
            remove_extras: toolchain.remove_extras,
            temp_dir: toolchain.temp_dir.clone(),
        }
    }

    pub fn with_hint(mut self, hint: SearchHint) -> Self {
        self.hint = hint;
        self
    }

    /// Solver arguments, excluding the image path.
    pub fn arguments(&self) -> Vec<OsString> {
        match &self.options {
            Some(options) => options.iter().map(OsString::from).collect(),
            None => default_options(self),
        }
    }
}

/// The solver's standard argument set for a request: fast, no plots, no
/// verification and no match/correlation/WCS side files.
pub fn default_options(request: &SolveRequest) -> Vec<OsString> {
    let cpu_limit = (request.timeout.as_secs_f64().ceil().max(1.0) as u64)
        .to_string();
    let mut options: Vec<OsString> = [
        "--guess-scale",
        "--cpulimit", cpu_limit.as_str(),
        "--no-verify",
        "--no-plots",
        "--no-fits2fits",
        "--crpix-center",
        "--temp-axy",
        "--match", "none",
        "--corr", "none",
        "--wcs", "none",
        "--downsample", "4",
    ].iter().map(OsString::from).collect();

    if request.overwrite {
        options.push("--overwrite".into());
    }
    if request.skip_solved {
        options.push("--skip-solved".into());
    }
    let hint = &request.hint;
    for (flag, value) in [("--ra", hint.ra), ("--dec", hint.dec),
                          ("--radius", hint.radius)] {
        if let Some(v) = value {
            options.push(flag.into());
            options.push(v.to_string().into());
        }
    }
    if let Some(dir) = &request.temp_dir {
        // Paths are passed through as-is; they need not be UTF-8.
        options.push("--temp-dir".into());
        options.push(dir.as_os_str().to_os_string());
    }
    options
}

/// Files the solver writes alongside an image.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SolveArtifacts {
    // Empty marker whose presence means the image was solved.
    pub sentinel: PathBuf,
    // Copy of the image with the WCS solution in its header.
    pub new_image: PathBuf,
    pub rdls: PathBuf,
    pub xyls: PathBuf,
}

impl SolveArtifacts {
    pub fn for_image(image: &Path) -> Self {
        let stem = image.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        SolveArtifacts{
            sentinel: image.with_extension("solved"),
            new_image: image.with_extension("new"),
            rdls: image.with_extension("rdls"),
            xyls: image.with_file_name(format!("{}-indx.xyls", stem)),
        }
    }

    fn remove_extras(&self) {
        for path in [&self.rdls, &self.xyls] {
            remove_if_present(path);
        }
    }

    // Everything an unsuccessful or abandoned solve may have left behind.
    fn remove_partial(&self) {
        for path in [&self.new_image, &self.rdls, &self.xyls] {
            remove_if_present(path);
        }
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => warn!("Could not remove {:?}: {:?}", path, e),
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SolveOutcome {
    // Image carrying the WCS solution.
    pub solved_file: PathBuf,
    // True if an existing sentinel short-circuited the solve.
    pub skipped: bool,
    // True if the solver had to be killed at its deadline.
    pub timed_out: bool,
    // Solver stdout and stderr.
    pub output: Vec<String>,
}

/// One running plate solve. The process is owned by this handle; dropping
/// the handle without calling wait() kills the solver and deletes any files
/// it wrote.
pub struct SolveFieldProcess {
    request: SolveRequest,
    artifacts: SolveArtifacts,
    process: Option<ToolSubprocess>,
}

impl Drop for SolveFieldProcess {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            warn!("Abandoning solve of {:?}", self.request.image);
            drop(process);
            self.artifacts.remove_partial();
        }
    }
}

impl SolveFieldProcess {
    /// Starts the solver on `request.image`. Returns immediately.
    pub fn spawn(toolchain: &Toolchain, request: SolveRequest)
                 -> Result<Self, CanonicalError> {
        if !request.image.exists() {
            return Err(precondition_error(
                format!("Image {:?} does not exist", request.image).as_str()));
        }
        let solver = toolchain.locate_solver()?;
        let mut args = request.arguments();
        args.push(request.image.as_os_str().to_os_string());
        info!("Solving {:?}", request.image);
        let process = ToolSubprocess::spawn(&solver, &args)?;
        let artifacts = SolveArtifacts::for_image(&request.image);
        Ok(SolveFieldProcess{request, artifacts, process: Some(process)})
    }

    pub fn artifacts(&self) -> &SolveArtifacts {
        &self.artifacts
    }

    /// Waits for the solver (killing it at the request's timeout) and
    /// reconciles its outputs. The solver's exit status is not consulted:
    /// the sentinel file alone decides success.
    pub fn wait(mut self) -> Result<SolveOutcome, CanonicalError> {
        let process = match self.process.take() {
            Some(p) => p,
            None => return Err(solve_error("Solve process already consumed")),
        };
        let output = match process.wait_timeout(self.request.timeout) {
            Ok(output) => output,
            Err(e) => {
                self.artifacts.remove_partial();
                return Err(e);
            }
        };
        debug!("Solver exited with {:?} after {:?}", output.status, output.elapsed);

        if !self.artifacts.sentinel.exists() {
            self.artifacts.remove_partial();
            let last_line = output.lines.last().cloned().unwrap_or_default();
            return Err(if output.timed_out {
                timeout_error(format!("Solve of {:?} timed out after {:?}",
                                      self.request.image,
                                      self.request.timeout).as_str())
            } else {
                solve_error(format!("File {:?} not solved: {}",
                                    self.request.image, last_line).as_str())
            });
        }
        if output.timed_out {
            warn!("Solver was killed at its deadline but left {:?}",
                  self.artifacts.sentinel);
        }
        let solved_file = reconcile(&self.request, &self.artifacts);
        info!("Solved {:?}", solved_file);
        Ok(SolveOutcome{
            solved_file,
            skipped: false,
            timed_out: output.timed_out,
            output: output.lines,
        })
    }
}

// Puts the solved image in its final place and removes side files.
// Failures here are logged, not returned.
fn reconcile(request: &SolveRequest, artifacts: &SolveArtifacts) -> PathBuf {
    let solved_file = promote(request, artifacts);
    if request.remove_extras {
        artifacts.remove_extras();
    }
    solved_file
}

fn promote(request: &SolveRequest, artifacts: &SolveArtifacts) -> PathBuf {
    let new_image = &artifacts.new_image;
    if !new_image.exists() {
        return request.image.clone();
    }
    if !request.replace {
        return new_image.clone();
    }
    match fs::rename(new_image, &request.image) {
        Ok(()) => {
            debug!("Replaced {:?} with solved image", request.image);
            request.image.clone()
        },
        Err(e) => {
            warn!("Could not replace {:?} with {:?}: {:?}",
                  request.image, new_image, e);
            new_image.clone()
        }
    }
}

/// Plate-solves `request.image`, blocking until the solver finishes or
/// times out. An image that already has a sentinel is not solved again when
/// `request.skip_solved` is set, but outputs an interrupted run left behind
/// are still promoted and cleaned up.
pub fn get_solve_field(toolchain: &Toolchain, request: SolveRequest)
                       -> Result<SolveOutcome, CanonicalError> {
    let artifacts = SolveArtifacts::for_image(&request.image);
    if request.skip_solved && request.image.exists() &&
        artifacts.sentinel.exists()
    {
        info!("Solved file exists, skipping {:?}", request.image);
        let solved_file = reconcile(&request, &artifacts);
        return Ok(SolveOutcome{
            solved_file,
            skipped: true,
            timed_out: false,
            output: vec![],
        });
    }
    SolveFieldProcess::spawn(toolchain, request)?.wait()
}
