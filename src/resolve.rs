//! Executable resolution
//!
//! `which` semantics: names containing a slash are checked as-is, everything
//! else is searched along the given paths or `$PATH`.

use std::path::{Path, PathBuf};

use log::debug;
use nix::unistd::{AccessFlags, access};

use crate::errors::{Result, ShError};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Whether `path` is a regular file we may execute
pub fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

/// Locate `program`, returning an absolute path
///
/// `search_paths` overrides `$PATH` when given.
pub fn which(program: &str, search_paths: Option<&[PathBuf]>) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }

    if program.contains('/') {
        let candidate = PathBuf::from(program);
        let candidate = if candidate.is_absolute() {
            candidate
        } else {
            std::env::current_dir().ok()?.join(candidate)
        };
        return is_executable(&candidate).then_some(candidate);
    }

    let dirs: Vec<PathBuf> = match search_paths {
        Some(paths) => paths.to_vec(),
        None => {
            let path_value = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
            path_value
                .split(':')
                .map(|entry| PathBuf::from(if entry.is_empty() { "." } else { entry }))
                .collect()
        }
    };

    dirs.iter()
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// Resolve a program for the command registry
///
/// Falls back to the dashed spelling when the underscored one is missing, so
/// `google_chrome` finds `google-chrome`.
pub fn resolve_program(program: &str, search_paths: Option<&[PathBuf]>) -> Result<PathBuf> {
    if let Some(path) = which(program, search_paths) {
        return Ok(path);
    }

    if program.contains('_') {
        let dashed = program.replace('_', "-");
        if let Some(path) = which(&dashed, search_paths) {
            debug!("resolved {} as {}", program, dashed);
            return Ok(path);
        }
    }

    Err(ShError::NotFound(program.to_string()))
}
