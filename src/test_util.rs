// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Helpers shared by unit tests that stand in for external tools with small
// shell scripts.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Writes an executable `/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Number of lines in `path`, or 0 if it does not exist.
pub fn count_lines(path: &Path) -> usize {
    fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
}

/// A fake solve-field. Records each invocation in `calls`, then (unless
/// `fail`) creates the sentinel, the solved image and both side files next to
/// the image given as last argument, after sleeping `delay` seconds.
pub fn fake_solver(dir: &Path, calls: &Path, delay: f64, fail: bool) -> PathBuf {
    let produce = if fail {
        "touch \"$base.rdls\"\necho 'Did not solve'".to_string()
    } else {
        "touch \"$base.solved\" \"$base.rdls\" \"$base-indx.xyls\"\n\
         cp \"$last\" \"$base.new\"\n\
         echo solved >> \"$base.new\"\n\
         echo 'Field 1: solved with index 4110'".to_string()
    };
    let body = format!(
        "echo \"$@\" >> '{}'\n\
         for last; do :; done\n\
         base=\"${{last%.*}}\"\n\
         sleep {}\n\
         {}\n\
         exit 1",
        calls.display(), delay, produce);
    write_script(dir, "solve-field", &body)
}

/// A fake wcsinfo that prints `output` regardless of its arguments.
pub fn fake_wcsinfo(dir: &Path, output: &str) -> PathBuf {
    let body = format!("cat <<'WCS_EOF'\n{}\nWCS_EOF", output.trim_end());
    write_script(dir, "wcsinfo", &body)
}
