//! Configuration path helpers

use std::path::{Path, PathBuf};

/// Resolve a path that may be relative to a base directory (usually the
/// directory holding the configuration file)
pub fn resolve_relative(base: Option<&Path>, path: &str) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        return candidate;
    }
    match base {
        Some(dir) => dir.join(candidate),
        None => candidate,
    }
}
