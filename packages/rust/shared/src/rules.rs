//! Filename, URL, and content-hash policy for fetched pages.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};

/// Longest sanitized title kept in a filename (bytes), before the page-id suffix.
const MAX_TITLE_BYTES: usize = 200;

/// Device names that are not valid file stems on every platform.
const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Bytes left literal in canonical URL paths: unreserved marks plus `/`.
const TITLE_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

fn is_invalid_filename_char(c: char) -> bool {
    matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
}

/// Make a page title safe to use as a filename on any platform.
///
/// `\ / : * ? " < > |` and control characters become `_`. Trailing dots and
/// spaces are dropped, the stem is cut to 200 bytes on a char boundary, and an
/// empty result falls back to `untitled`. The Windows device names `CON`,
/// `PRN`, `AUX`, `NUL`, `COM1`-`COM9` and `LPT1`-`LPT9` (any case) get a
/// trailing `_`.
pub fn sanitize_filename(title: &str) -> String {
    let replaced: String = title
        .trim()
        .chars()
        .map(|c| if is_invalid_filename_char(c) { '_' } else { c })
        .collect();

    let mut cleaned = replaced.trim_end_matches(['.', ' ']).to_string();

    if cleaned.len() > MAX_TITLE_BYTES {
        let mut cut = MAX_TITLE_BYTES;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
        cleaned = cleaned.trim_end_matches(['.', ' ']).to_string();
    }

    if cleaned.is_empty() {
        return "untitled".to_string();
    }

    if RESERVED_STEMS
        .iter()
        .any(|r| r.eq_ignore_ascii_case(&cleaned))
    {
        cleaned.push('_');
    }

    cleaned
}

/// File name for a fetched page: `<sanitized title>_<pageid>.json`.
pub fn make_filename(title: &str, page_id: u64) -> String {
    format!("{}_{page_id}.json", sanitize_filename(title))
}

/// Canonical wiki URL for a title: spaces become underscores and the rest is
/// percent-encoded, keeping `/` literal.
pub fn build_canonical_url(title: &str, wiki_root: &str) -> String {
    let mut url = wiki_root.to_string();
    if !url.ends_with('/') {
        url.push('/');
    }
    url.extend(utf8_percent_encode(&title.replace(' ', "_"), TITLE_PATH));
    url
}

/// Normalize line endings to `\n` and trim outer whitespace.
pub fn normalize_content(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

/// Stable hex digest of a page body after normalization.
pub fn compute_content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_content(content).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_filename("A/B Test"), "A_B Test");
        assert_eq!(sanitize_filename("What? <Really>"), "What_ _Really_");
    }

    #[test]
    fn sanitize_falls_back_to_untitled() {
        assert_eq!(sanitize_filename(""), "untitled");
        assert_eq!(sanitize_filename("  ...  "), "untitled");
    }

    #[test]
    fn sanitize_guards_reserved_names() {
        assert_eq!(sanitize_filename("con"), "con_");
        assert_eq!(sanitize_filename("Console"), "Console");
    }

    #[test]
    fn sanitize_truncates_on_char_boundary() {
        let long = "ネコ".repeat(100);
        let out = sanitize_filename(&long);
        assert!(out.len() <= MAX_TITLE_BYTES);
        assert!(out.starts_with("ネコ"));
    }

    #[test]
    fn filename_appends_page_id() {
        assert_eq!(make_filename("A/B Test", 42), "A_B Test_42.json");
        assert_eq!(make_filename("", 7), "untitled_7.json");
    }

    #[test]
    fn canonical_url_encodes_title() {
        assert_eq!(
            build_canonical_url("A/B Test", "https://battlecats.miraheze.org/wiki/"),
            "https://battlecats.miraheze.org/wiki/A/B_Test"
        );
        assert_eq!(
            build_canonical_url("Category:Cat Units", "https://wiki.example.org/wiki"),
            "https://wiki.example.org/wiki/Category%3ACat_Units"
        );
        assert_eq!(
            build_canonical_url("Ñ", "https://wiki.example.org/wiki/"),
            "https://wiki.example.org/wiki/%C3%91"
        );
        assert_eq!(
            build_canonical_url("Ms. Sign's Tower & Co~", "https://wiki.example.org/wiki/"),
            "https://wiki.example.org/wiki/Ms._Sign%27s_Tower_%26_Co~"
        );
    }

    #[test]
    fn content_hash_ignores_line_endings_and_outer_space() {
        let a = compute_content_hash("line one\r\nline two\r\n");
        let b = compute_content_hash("  line one\nline two");
        let c = compute_content_hash("line one\rline two");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 64);
        assert_ne!(a, compute_content_hash("line one\nline three"));
    }
}
