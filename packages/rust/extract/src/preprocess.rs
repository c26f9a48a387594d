//! Markdown preprocessing pipeline for archived curated content.
//!
//! Each pass is a function `&str -> String` applied in a fixed sequence:
//! strip inline HTML comments, strip embedded base64 images, normalize line
//! endings, collapse excessive consecutive blank lines. The whole pipeline is
//! idempotent: re-applying it to its own output is a no-op.

use std::sync::LazyLock;

use regex::Regex;

/// Run the full preprocessing pipeline on raw archived Markdown.
///
/// `max_blank_lines` is the maximum run of consecutive blank lines kept.
pub fn preprocess_markdown(md: &str, max_blank_lines: usize) -> String {
    let mut result = md.to_string();

    result = strip_html_comments(&result);
    result = strip_base64_images(&result);
    result = normalize_line_endings(&result);
    result = collapse_blank_lines(&result, max_blank_lines);

    result
}

// ---------------------------------------------------------------------------
// Pass 1: Strip inline HTML comments
// ---------------------------------------------------------------------------

/// Remove `<!-- ... -->` comments, including multi-line ones.
fn strip_html_comments(md: &str) -> String {
    static COMMENT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));

    COMMENT_RE.replace_all(md, "").to_string()
}

// ---------------------------------------------------------------------------
// Pass 2: Strip embedded base64 images
// ---------------------------------------------------------------------------

/// Remove inline data-URI images, both Markdown `![alt](data:...)` form and
/// raw `<img src="data:...">` tags. Embedded payloads run to hundreds of
/// kilobytes of base64 and carry no answerable content.
fn strip_base64_images(md: &str) -> String {
    static MD_IMAGE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\(data:[^)]*\)").expect("valid regex"));
    static IMG_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"<img[^>]*src\s*=\s*["']data:[^"']*["'][^>]*/?>"#).expect("valid regex")
    });

    let result = MD_IMAGE_RE.replace_all(md, "").to_string();
    IMG_TAG_RE.replace_all(&result, "").to_string()
}

// ---------------------------------------------------------------------------
// Pass 3: Normalize line endings
// ---------------------------------------------------------------------------

/// CRLF and lone CR both become LF.
fn normalize_line_endings(md: &str) -> String {
    md.replace("\r\n", "\n").replace('\r', "\n")
}

// ---------------------------------------------------------------------------
// Pass 4: Collapse excessive blank lines
// ---------------------------------------------------------------------------

/// Collapse runs of more than `max` consecutive blank lines to exactly `max`.
/// Lines containing only whitespace count as blank and are emptied.
fn collapse_blank_lines(md: &str, max: usize) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut blank_run = 0usize;

    for line in md.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run <= max {
                out.push("");
            }
        } else {
            blank_run = 0;
            out.push(line);
        }
    }

    out.join("\n")
}
