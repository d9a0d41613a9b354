//! Path helpers.
//!
//! Paths are absolute, `/`-separated, and never end in `/` (except the root).

use crate::{CoordError, CoordResult};

/// The root path.
pub const ROOT: &str = "/";

/// Validate an absolute path.
pub fn validate(path: &str) -> CoordResult<()> {
    let invalid = |reason| {
        Err(CoordError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };

    if !path.starts_with('/') {
        return invalid("must start with '/'");
    }
    if path == ROOT {
        return Ok(());
    }
    if path.ends_with('/') {
        return invalid("must not end with '/'");
    }
    if path[1..].split('/').any(str::is_empty) {
        return invalid("empty segment");
    }
    Ok(())
}

/// Join path segments onto a base path.
pub fn join<I, S>(base: &str, segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = base.trim_end_matches('/').to_string();
    for segment in segments {
        out.push('/');
        out.push_str(segment.as_ref());
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Returns the parent of `path`, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Returns the last segment of `path`.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Returns the prefix every descendant of `path` starts with.
pub(crate) fn child_prefix(path: &str) -> String {
    if path == ROOT {
        ROOT.to_string()
    } else {
        format!("{path}/")
    }
}
