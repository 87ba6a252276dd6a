//! Worker program and directory resolution

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Validate and canonicalize a directory path
pub fn validate_and_canonicalize_dir(path: &Path) -> Result<PathBuf> {
    let canonical_path = path.canonicalize().map_err(|_| {
        Error::InvalidPath(format!("Invalid or non-existent path: {}", path.display()))
    })?;

    if !canonical_path.is_dir() {
        return Err(Error::InvalidPath(format!(
            "Not a directory: {}",
            canonical_path.display()
        )));
    }

    Ok(canonical_path)
}

/// Resolve the worker executable.
///
/// Anything containing a path separator is taken as a path; bare names are
/// looked up in PATH.
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
        return Err(Error::SpawnFailure(format!(
            "Worker program not found: {}",
            program
        )));
    }

    which::which(program).map_err(|e| {
        Error::SpawnFailure(format!("Worker program {} not found in PATH: {}", program, e))
    })
}

/// Make a relative script argument absolute so it survives the change of
/// working directory
pub fn absolutize_script(args: &mut [String]) {
    if let Some(first) = args.first_mut() {
        let path = Path::new(first.as_str());
        if path.is_relative() && path.is_file() {
            if let Ok(absolute) = path.canonicalize() {
                *first = absolute.to_string_lossy().into_owned();
            }
        }
    }
}

/// Directory workers run in: the explicit setting, else the directory holding
/// the worker script (first argument), else the program's own directory.
pub fn worker_directory(
    explicit: Option<&Path>,
    program: &Path,
    args: &[String],
) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return validate_and_canonicalize_dir(dir);
    }

    let script_dir = args
        .first()
        .map(Path::new)
        .filter(|p| p.is_file())
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty());

    let dir = script_dir
        .or_else(|| program.parent().filter(|p| !p.as_os_str().is_empty()))
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    validate_and_canonicalize_dir(&dir)
}
