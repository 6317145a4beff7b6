//! Slash-separated node path helpers.

use crate::error::{ConfigNodeError, Result};

pub const SEPARATOR: char = '/';
pub const ROOT: &str = "/";

/// Join a parent path and a child segment
pub fn join(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of a path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind(SEPARATOR) {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path
pub fn name(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or(path)
}

/// Segments of an absolute path, root yields none
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

/// Every proper ancestor of a path, outermost first, excluding the root
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = parent(path);
    while let Some(p) = current {
        if p == ROOT {
            break;
        }
        out.push(p.to_string());
        current = parent(p);
    }
    out.reverse();
    out
}

/// Check that a single path segment can be stored
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(ConfigNodeError::InvalidPath("empty path segment".to_string()));
    }
    if segment.contains(SEPARATOR) {
        return Err(ConfigNodeError::InvalidPath(format!(
            "segment {:?} contains '{}'",
            segment, SEPARATOR
        )));
    }
    if segment == "." || segment == ".." {
        return Err(ConfigNodeError::InvalidPath(format!(
            "segment {:?} is reserved",
            segment
        )));
    }
    Ok(())
}

/// Check that a path is absolute and well formed
pub fn validate(path: &str) -> Result<()> {
    if path == ROOT {
        return Ok(());
    }
    if !path.starts_with(SEPARATOR) {
        return Err(ConfigNodeError::InvalidPath(format!(
            "{:?} is not absolute",
            path
        )));
    }
    if path.ends_with(SEPARATOR) {
        return Err(ConfigNodeError::InvalidPath(format!(
            "{:?} has a trailing separator",
            path
        )));
    }
    path[1..].split(SEPARATOR).try_for_each(validate_segment)
}
