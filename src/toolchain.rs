// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::env;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use canonical_error::CanonicalError;
use log::debug;

use crate::error::configuration_error;

const DEFAULT_INSTALL_DIR: &str = "/var/panoptes";

/// Locations of the external tools and the settings shared by every pipeline
/// stage. Constructed once by the caller and passed to whichever stage needs
/// it; nothing in this crate reads the environment on its own.
#[derive(Clone, Debug)]
pub struct Toolchain {
    // Plate solver. None means search PATH for `solve-field`, then
    // `<install_dir>/astrometry/bin/solve-field`.
    pub solver: Option<PathBuf>,

    // WCS info tool. None means search PATH for `wcsinfo`, then
    // `<install_dir>/astrometry/bin/wcsinfo`.
    pub wcsinfo: Option<PathBuf>,

    pub exiftool: PathBuf,
    pub dcraw: PathBuf,

    // Root of the observatory software installation.
    pub install_dir: PathBuf,

    // Scratch directory handed to the solver, if any.
    pub temp_dir: Option<PathBuf>,

    // Wall-clock (and solver CPU) limit for one plate solve.
    pub solve_timeout: Duration,

    // Wall-clock limit for wcsinfo.
    pub wcsinfo_timeout: Duration,

    // Wall-clock limit for exiftool and dcraw.
    pub tool_timeout: Duration,

    // Search radius (degrees) around the commanded position.
    pub search_radius: f64,

    // Guiding rate as a fraction of sidereal.
    pub guide_rate: f64,

    // Replace the captured image with the solver's output.
    pub replace: bool,

    // Delete the solver's index and region side files.
    pub remove_extras: bool,

    // Skip images that already have a .solved sentinel.
    pub skip_solved: bool,
}

impl Default for Toolchain {
    fn default() -> Self {
        Toolchain{
            solver: None,
            wcsinfo: None,
            exiftool: PathBuf::from("exiftool"),
            dcraw: PathBuf::from("dcraw"),
            install_dir: PathBuf::from(DEFAULT_INSTALL_DIR),
            temp_dir: None,
            solve_timeout: Duration::from_secs(30),
            wcsinfo_timeout: Duration::from_secs(5),
            tool_timeout: Duration::from_secs(30),
            search_radius: 15.0,
            guide_rate: 0.9,
            replace: true,
            remove_extras: true,
            skip_solved: true,
        }
    }
}

impl Toolchain {
    /// Defaults overridden by `PANDIR` (install dir) and `PANTEMP` (solver
    /// temp dir).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var_os(key))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let mut toolchain = Toolchain::default();
        if let Some(dir) = lookup("PANDIR").filter(|d| !d.is_empty()) {
            toolchain.install_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("PANTEMP").filter(|d| !d.is_empty()) {
            toolchain.temp_dir = Some(PathBuf::from(dir));
        }
        toolchain
    }

    fn astrometry_bin(&self, name: &str) -> PathBuf {
        self.install_dir.join("astrometry").join("bin").join(name)
    }

    /// Returns the plate solver executable. Fails if it cannot be found.
    pub fn locate_solver(&self) -> Result<PathBuf, CanonicalError> {
        let candidate = match &self.solver {
            Some(path) => resolve_program(path),
            None => find_on_path("solve-field")
                .or_else(|| Some(self.astrometry_bin("solve-field"))),
        };
        match candidate {
            Some(path) if is_executable(&path) => Ok(path),
            Some(path) => Err(configuration_error(
                format!("Can't find solve-field: {:?}", path).as_str())),
            None => Err(configuration_error("Can't find solve-field")),
        }
    }

    /// Returns the wcsinfo executable: the configured path, else the first
    /// `wcsinfo` on PATH, else the one in the installation directory. The
    /// result is not checked; a missing tool surfaces when it is run.
    pub fn locate_wcsinfo(&self) -> PathBuf {
        if let Some(path) = &self.wcsinfo {
            return resolve_program(path).unwrap_or_else(|| path.clone());
        }
        find_on_path("wcsinfo").unwrap_or_else(|| self.astrometry_bin("wcsinfo"))
    }

    pub fn locate_exiftool(&self) -> PathBuf {
        resolve_program(&self.exiftool).unwrap_or_else(|| self.exiftool.clone())
    }

    pub fn locate_dcraw(&self) -> PathBuf {
        resolve_program(&self.dcraw).unwrap_or_else(|| self.dcraw.clone())
    }
}

// A bare program name is looked up on PATH; anything with a directory
// component is taken as is.
fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return Some(program.to_path_buf());
    }
    find_on_path(program.as_os_str())
}

/// Returns the first executable file named `name` in the PATH directories.
pub fn find_on_path(name: impl AsRef<Path>) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name.as_ref());
        if is_executable(&candidate) {
            debug!("Found {:?}", candidate);
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    match path.metadata() {
        Ok(metadata) => metadata.is_file() &&
            metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::ErrorKind;
    use crate::test_util::write_script;

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> =
            [("PANDIR", "/opt/pan"), ("PANTEMP", "/scratch")].into_iter().collect();
        let toolchain = Toolchain::from_lookup(
            |key| vars.get(key).map(OsString::from));
        assert_eq!(toolchain.install_dir, PathBuf::from("/opt/pan"));
        assert_eq!(toolchain.temp_dir, Some(PathBuf::from("/scratch")));

        let toolchain = Toolchain::from_lookup(|_| None);
        assert_eq!(toolchain.install_dir, PathBuf::from(DEFAULT_INSTALL_DIR));
        assert_eq!(toolchain.temp_dir, None);
    }

    #[test]
    fn test_locate_solver() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = write_script(dir.path(), "solve-field", "exit 0");
        let toolchain = Toolchain{solver: Some(script.clone()), ..Default::default()};
        assert_eq!(toolchain.locate_solver().unwrap(), script);

        let toolchain = Toolchain{
            solver: Some(dir.path().join("missing")), ..Default::default()};
        let err = toolchain.locate_solver().unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::Configuration);
    }

    #[test]
    fn test_locate_wcsinfo_falls_back_to_install_dir() {
        let toolchain = Toolchain{
            install_dir: PathBuf::from("/nonexistent/pan"), ..Default::default()};
        let located = toolchain.locate_wcsinfo();
        // Either a real wcsinfo on this machine's PATH, or the fallback.
        if find_on_path("wcsinfo").is_none() {
            assert_eq!(located,
                       PathBuf::from("/nonexistent/pan/astrometry/bin/wcsinfo"));
        }
    }

    #[test]
    fn test_find_on_path() {
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("surely-not-a-real-program-name").is_none());
    }
}
