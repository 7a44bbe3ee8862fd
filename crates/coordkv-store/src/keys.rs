//! Key path normalization and prefix handling.
//!
//! Keys are `/`-separated paths. Every backend call goes through
//! [`normalize`] first, so `a//b/`, `/a/b` and `a/b` all address the same
//! entry. Adapters that need a rooted path add the slash back with
//! [`rooted`].

use crate::error::{Result, StoreError};

/// Normalizes a key: collapses slash runs, strips the leading and trailing
/// slash, rejects `.` and `..` segments. The empty string is the root.
pub fn normalize(key: &str) -> Result<String> {
    let mut out = String::with_capacity(key.len());
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "relative path segment",
            });
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    Ok(out)
}

/// Like [`normalize`], but the root is rejected. Used for single-key
/// operations.
pub fn normalize_leaf(key: &str) -> Result<String> {
    let normalized = normalize(key)?;
    if normalized.is_empty() {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason: "empty key",
        });
    }
    Ok(normalized)
}

/// Returns the normalized key with a single leading slash.
pub fn rooted(normalized: &str) -> String {
    format!("/{}", normalized)
}

/// Splits a normalized key into (directory, leaf). The directory of a
/// single segment is the empty prefix.
pub fn split(normalized: &str) -> (&str, &str) {
    match normalized.rsplit_once('/') {
        Some((dir, leaf)) => (dir, leaf),
        None => ("", normalized),
    }
}

/// Directory part of a normalized key.
pub fn directory(normalized: &str) -> &str {
    split(normalized).0
}

/// Every proper ancestor of a normalized key, shortest first.
///
/// `ancestors("a/b/c")` is `["a", "a/b"]`.
pub fn ancestors(normalized: &str) -> Vec<&str> {
    normalized
        .match_indices('/')
        .map(|(idx, _)| &normalized[..idx])
        .collect()
}

/// Joins a normalized prefix and a segment.
pub fn join(prefix: &str, segment: &str) -> String {
    let segment = segment.trim_matches('/');
    match (prefix.is_empty(), segment.is_empty()) {
        (true, _) => segment.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, segment),
    }
}

/// Prefix match on normalized keys. The character after the prefix must be
/// a slash, so `foo` does not match `foobar`.
pub fn has_prefix(key: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Key relative to `prefix`, or `None` if the key is outside it.
pub fn relative<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    if !has_prefix(key, prefix) {
        return None;
    }
    Some(key[prefix.len()..].trim_start_matches('/'))
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalize_is_idempotent(key in "[a-z/]{0,24}") {
            let once = normalize(&key).unwrap();
            prop_assert_eq!(normalize(&once).unwrap(), once.clone());
        }

        #[test]
        fn trailing_slash_is_insignificant(key in "[a-z]{1,6}(/[a-z]{1,6}){0,3}") {
            let with_slash = format!("{}/", key);
            prop_assert_eq!(normalize(&key).unwrap(), normalize(&with_slash).unwrap());
        }

        #[test]
        fn key_has_its_directory_as_prefix(key in "[a-z]{1,6}(/[a-z]{1,6}){1,3}") {
            let (dir, _) = split(&key);
            prop_assert!(has_prefix(&key, dir));
        }
    }
}
