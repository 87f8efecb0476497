// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Store path helpers.
//!
//! The store rejects `_` in paths, so application keys are rewritten `_`→`-`
//! on the way out and `-`→`_` on the way in. Both spellings name the same
//! logical key.

use crate::error::{Error, Result};

/// Rewrites an application path into the form the store accepts.
pub fn to_store(path: &str) -> String {
    path.replace('_', "-")
}

/// Rewrites a path received from the store into its application form.
pub fn from_store(path: &str) -> String {
    path.replace('-', "_")
}

/// Canonical spelling used to compare keys.
pub fn logical(path: &str) -> String {
    from_store(path)
}

pub fn validate(path: &str) -> Result<()> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(Error::InvalidPath(path.to_string()))
    }
}

/// Joins a root and a relative key, tolerating missing or doubled slashes.
pub fn join(root: &str, key: &str) -> String {
    let root = root.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        if root.is_empty() {
            "/".to_string()
        } else {
            root.to_string()
        }
    } else {
        format!("{root}/{key}")
    }
}

/// Returns `path` relative to `root` (with a leading `/`), or `None` when the
/// path lies outside the root.
pub fn relative<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Normalizes a relative key to its logical form with a single leading `/`.
pub fn normalize_key(key: &str) -> String {
    let trimmed = key.trim_start_matches('/');
    logical(&format!("/{trimmed}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalization_is_reversible() {
        let key = "/service_a/max_conns";
        let wire = to_store(key);
        assert_eq!(wire, "/service-a/max-conns");
        assert_eq!(from_store(&wire), key);
        assert_eq!(logical("/service-a/max_conns"), logical(key));
    }

    #[test]
    fn paths_must_be_absolute() {
        assert!(validate("/a").is_ok());
        assert!(matches!(validate("a/b"), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn join_and_relative_agree() {
        assert_eq!(join("/app", "x"), "/app/x");
        assert_eq!(join("/app/", "/x/y"), "/app/x/y");
        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join("/app", ""), "/app");

        assert_eq!(relative("/app", "/app/x/y"), Some("/x/y"));
        assert_eq!(relative("/app", "/apple/x"), None);
        assert_eq!(relative("/", "/x"), Some("/x"));
    }

    #[test]
    fn keys_normalize_to_leading_slash() {
        assert_eq!(normalize_key("x"), "/x");
        assert_eq!(normalize_key("/max-conns"), "/max_conns");
    }
}
