//! Utility functions for text cleaning, file naming, and file system checks.
//!
//! This module provides helper functions used throughout the application:
//! - Text normalization for scraped fields
//! - String truncation for logging
//! - Injective file-name encoding for dataset paths
//! - User-Agent classification for mobile-aware parsing
//! - File system validation for output directories

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs as stdfs;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static CONTROL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f-\x9f]").unwrap());
static QUOTES_AND_BREAKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\n"'“”‘’]"#).unwrap());

/// Normalize scraped text: strip control characters and collapse whitespace.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(clean_text("  Breaking\n\tnews  "), "Breaking news");
/// ```
pub fn clean_text(text: &str) -> String {
    let text = CONTROL.replace_all(text, "");
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Article-body variant of [`clean_text`] that also drops line breaks and
/// quote characters, which break downstream CSV consumers.
pub fn clean_article_text(text: &str) -> String {
    let text = QUOTES_AND_BREAKS.replace_all(text, " ");
    clean_text(&text)
}

/// Truncate a string for logging purposes.
///
/// Long strings are truncated to `max` characters with an ellipsis and
/// byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}…(+{} bytes)", &s[..cut], s.len() - cut),
    }
}

/// Encode a topic for use in a file name.
///
/// Percent-encoding is injective, so two different topics can never map to
/// the same file.
pub fn encode_file_component(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

/// Classify a User-Agent string into a `Browser-OS` tag such as `Chrome-macOS`.
pub fn user_agent_env(user_agent: &str) -> String {
    if user_agent.is_empty() {
        return "unknown".to_string();
    }
    let ua = user_agent.to_lowercase();

    let browser = if ua.contains("edg") {
        "Edge"
    } else if ua.contains("chrome") {
        "Chrome"
    } else if ua.contains("firefox") {
        "Firefox"
    } else if ua.contains("safari") {
        "Safari"
    } else {
        "Other"
    };

    let os = if ua.contains("windows") {
        "Windows"
    } else if ua.contains("iphone") {
        "iPhone"
    } else if ua.contains("android") {
        "Android"
    } else if ua.contains("macintosh") || ua.contains("mac os") {
        "macOS"
    } else if ua.contains("linux") {
        "Linux"
    } else {
        "Other"
    };

    format!("{browser}-{os}")
}

/// Whether a User-Agent announces a mobile browser.
pub fn is_mobile_user_agent(user_agent: &str) -> bool {
    ["Mobile", "Android", "iPhone"]
        .iter()
        .any(|needle| user_agent.contains(needle))
}

/// Ensure a directory exists and is writable.
///
/// This function creates the directory if it doesn't exist, then performs
/// a write test by creating and immediately deleting a marker file.
///
/// # Errors
///
/// Returns an error if:
/// - The directory cannot be created
/// - The directory is not writable (permission denied, read-only filesystem, etc.)
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path).await?;
    // Try a small sync write using std fs (simpler error surface)
    let marker_path = path.join("..__write_check__");
    stdfs::File::create(&marker_path)?;
    let _ = stdfs::remove_file(&marker_path);
    info!("Output directory is writable");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_for_log_short_string() {
        let s = "Hello, world!";
        assert_eq!(truncate_for_log(s, 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_truncate_for_log_multibyte() {
        let s = "é".repeat(10);
        let result = truncate_for_log(&s, 3);
        assert!(result.starts_with("ééé…"));
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  Breaking\n\tnews  "), "Breaking news");
        assert_eq!(clean_text("a\u{0007}b"), "ab");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn test_clean_article_text_strips_quotes() {
        assert_eq!(
            clean_article_text("He said \"no\"\nand left"),
            "He said no and left"
        );
    }

    #[test]
    fn test_encode_file_component_is_injective_for_separators() {
        assert_ne!(encode_file_component("a/b"), encode_file_component("a_b"));
        assert_eq!(encode_file_component("gun"), "gun");
        assert!(!encode_file_component("\"gun law\" OR x").contains('"'));
    }

    #[test]
    fn test_user_agent_env() {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                  (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
        assert_eq!(user_agent_env(ua), "Chrome-macOS");
        assert_eq!(user_agent_env(""), "unknown");
        let iphone = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) \
                      Version/17.0 Mobile/15E148 Safari/604.1";
        assert_eq!(user_agent_env(iphone), "Safari-iPhone");
        assert!(is_mobile_user_agent(iphone));
        assert!(!is_mobile_user_agent(ua));
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        ensure_writable_dir(&nested).await.unwrap();
        assert!(nested.is_dir());
    }
}
