// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, CanonicalErrorCode,
                      deadline_exceeded_error, failed_precondition_error,
                      invalid_argument_error, not_found_error,
                      unavailable_error};
use thiserror::Error;

// The pipeline reports its failures as CanonicalError values. Each failure
// category has a constructor here so that the category can be recovered from
// the error code with ErrorKind::of().

// Missing or invalid parameter, file, or executable.
pub fn configuration_error(message: &str) -> CanonicalError {
    invalid_argument_error(message)
}

// External process could not be started.
pub fn launch_error(message: &str) -> CanonicalError {
    unavailable_error(message)
}

// External process exceeded its allotted time and was killed.
pub fn timeout_error(message: &str) -> CanonicalError {
    deadline_exceeded_error(message)
}

// Process ran but produced no usable solution artifact.
pub fn solve_error(message: &str) -> CanonicalError {
    not_found_error(message)
}

// Required input file absent.
pub fn precondition_error(message: &str) -> CanonicalError {
    failed_precondition_error(message)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Launch,
    Timeout,
    Solve,
    Precondition,
    Other,
}

impl ErrorKind {
    pub fn of(error: &CanonicalError) -> ErrorKind {
        match error.code {
            CanonicalErrorCode::InvalidArgument => ErrorKind::Configuration,
            CanonicalErrorCode::Unavailable => ErrorKind::Launch,
            CanonicalErrorCode::DeadlineExceeded => ErrorKind::Timeout,
            CanonicalErrorCode::NotFound => ErrorKind::Solve,
            CanonicalErrorCode::FailedPrecondition => ErrorKind::Precondition,
            _ => ErrorKind::Other,
        }
    }
}

// Pipeline steps, used to attribute a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Metadata,
    Convert,
    Solve,
    WcsInfo,
    PointingError,
    Correction,
    Drift,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Metadata => "metadata",
            Stage::Convert => "convert",
            Stage::Solve => "solve",
            Stage::WcsInfo => "wcsinfo",
            Stage::PointingError => "pointing-error",
            Stage::Correction => "correction",
            Stage::Drift => "drift",
        };
        f.write_str(name)
    }
}

/// A failure of one pipeline stage for one originating file.
#[derive(Debug, Error)]
#[error("{stage} stage failed for {file:?}: {code:?}: {message}",
        code = .error.code, message = .error.message)]
pub struct PipelineError {
    pub stage: Stage,
    pub file: PathBuf,
    pub error: CanonicalError,
}

impl PipelineError {
    pub fn new(stage: Stage, file: &Path, error: CanonicalError) -> Self {
        PipelineError{stage, file: file.to_path_buf(), error}
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::of(&self.error)
    }
}

impl From<PipelineError> for CanonicalError {
    fn from(e: PipelineError) -> CanonicalError {
        CanonicalError{
            code: e.error.code,
            message: format!("{} stage failed for {:?}: {}",
                             e.stage, e.file, e.error.message),
        }
    }
}

// Attaches a stage and file to a stage-local result.
pub trait StageContext<T> {
    fn stage(self, stage: Stage, file: &Path) -> Result<T, PipelineError>;
}

impl<T> StageContext<T> for Result<T, CanonicalError> {
    fn stage(self, stage: Stage, file: &Path) -> Result<T, PipelineError> {
        self.map_err(|e| PipelineError::new(stage, file, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        assert_eq!(ErrorKind::of(&configuration_error("x")),
                   ErrorKind::Configuration);
        assert_eq!(ErrorKind::of(&launch_error("x")), ErrorKind::Launch);
        assert_eq!(ErrorKind::of(&timeout_error("x")), ErrorKind::Timeout);
        assert_eq!(ErrorKind::of(&solve_error("x")), ErrorKind::Solve);
        assert_eq!(ErrorKind::of(&precondition_error("x")),
                   ErrorKind::Precondition);
    }

    #[test]
    fn test_pipeline_error_names_stage_and_file() {
        let result: Result<(), CanonicalError> = Err(solve_error("File not solved"));
        let err = result.stage(Stage::Solve, Path::new("/tmp/a.fits"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Solve);
        let text = err.to_string();
        assert!(text.contains("solve stage"));
        assert!(text.contains("/tmp/a.fits"));
        assert!(text.contains("File not solved"));

        let canonical: CanonicalError = err.into();
        assert!(matches!(canonical.code, CanonicalErrorCode::NotFound));
        assert!(canonical.message.contains("/tmp/a.fits"));
    }
}
