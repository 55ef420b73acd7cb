// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Utility functions for varia.
//!
//! This module provides URL helpers used across the codebase.

use url::Url;

/// Name used when a URL ends in a slash.
const FALLBACK_FILE_NAME: &str = "download";

/// Check that a download URL is well formed: it must parse and carry
/// both a scheme and a host.
///
/// # Examples
///
/// ```
/// use varia::utils::is_valid_url;
///
/// assert!(is_valid_url("https://example.com/file.iso"));
/// assert!(!is_valid_url("example.com/file.iso"));
/// assert!(!is_valid_url("file:///etc/passwd"));
/// ```
pub fn is_valid_url(input: &str) -> bool {
    match Url::parse(input.trim()) {
        Ok(url) => !url.scheme().is_empty() && url.host_str().is_some_and(|h| !h.is_empty()),
        Err(_) => false,
    }
}

/// Derive a display file name from a URL: the last path segment with any
/// query string dropped.
///
/// # Examples
///
/// ```
/// use varia::utils::file_name_from_url;
///
/// assert_eq!(file_name_from_url("http://example.com/a/file.iso?token=1"), "file.iso");
/// ```
pub fn file_name_from_url(url: &str) -> String {
    let last = url.rsplit('/').next().unwrap_or_default();
    let name = last.split(['?', '#']).next().unwrap_or_default();
    if name.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        assert!(is_valid_url("http://example.com/file.iso"));
        assert!(is_valid_url("https://mirror.example.org:8443/pub/x.tar.gz?x=1"));
        assert!(is_valid_url("ftp://ftp.example.com/file"));
        assert!(is_valid_url("  http://example.com/padded  "));
    }

    #[test]
    fn test_urls_without_scheme_or_host() {
        assert!(!is_valid_url(""));
        assert!(!is_valid_url("example.com/file.iso"));
        assert!(!is_valid_url("/just/a/path"));
        assert!(!is_valid_url("http://"));
        assert!(!is_valid_url("mailto:someone@example.com"));
        assert!(!is_valid_url("file:///tmp/file.iso"));
        assert!(!is_valid_url("not a url at all"));
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("http://example.com/file.iso"), "file.iso");
        assert_eq!(file_name_from_url("http://example.com/dir/a.zip?sig=abc"), "a.zip");
        assert_eq!(file_name_from_url("http://example.com/dir/b.bin#frag"), "b.bin");
        assert_eq!(file_name_from_url("http://example.com/"), "download");
    }
}
