//! Remote path helpers
//!
//! A remote path is slash separated and relative to the configured root of
//! a backend. It never carries a leading or trailing slash and the empty
//! string names the root itself.

/// Strip leading and trailing slashes from a configured root
pub fn clean_root(root: &str) -> String {
    root.trim_matches('/').to_string()
}

/// Split a path into its parent directory and leaf name
///
/// ```
/// use rfs_core::path::split_path;
/// assert_eq!(split_path("a/b/c"), ("a/b", "c"));
/// assert_eq!(split_path("c"), ("", "c"));
/// ```
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// Join two remote paths, treating the empty string as the root
pub fn join_path(dir: &str, leaf: &str) -> String {
    match (dir.is_empty(), leaf.is_empty()) {
        (true, _) => leaf.to_string(),
        (_, true) => dir.to_string(),
        _ => format!("{dir}/{leaf}"),
    }
}

/// Normalise a path for use as a lookup key
///
/// Backends that declare themselves case-insensitive compare lowercased
/// paths; everyone else compares bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathKey {
    case_insensitive: bool,
}

impl PathKey {
    pub fn new(case_insensitive: bool) -> Self {
        Self { case_insensitive }
    }

    pub fn key(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if self.case_insensitive {
            path.to_lowercase()
        } else {
            path.to_string()
        }
    }

    /// True if `path` is `dir` or lives somewhere below it
    pub fn is_within(&self, path: &str, dir: &str) -> bool {
        let path = self.key(path);
        let dir = self.key(dir);
        dir.is_empty()
            || path == dir
            || (path.starts_with(&dir) && path.as_bytes().get(dir.len()) == Some(&b'/'))
    }
}
