//! llms.txt format parser.
//!
//! Parses the llms.txt format as specified by <https://llmstxt.org/>:
//! - Line 1: `# Title`
//! - Optional: `> Summary blockquote`
//! - Sections: `## Section Name` followed by Markdown link lists
//! - Links: `- [Link Name](url): Optional description`

use ccbench_shared::{CcbenchError, Result};
use regex::Regex;
use std::sync::LazyLock;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Parsed representation of an llms.txt file.
#[derive(Debug, Clone)]
pub struct LlmsDocument {
    /// The H1 title.
    pub title: String,
    /// The blockquote summary (if present).
    pub summary: Option<String>,
    /// Named sections containing entries.
    pub sections: Vec<LlmsSection>,
}

/// A named section within the llms.txt (## heading).
#[derive(Debug, Clone)]
pub struct LlmsSection {
    /// Section title (from ## heading).
    pub title: String,
    /// Entries within this section.
    pub entries: Vec<LlmsEntry>,
}

/// A single linked entry in the llms.txt.
#[derive(Debug, Clone)]
pub struct LlmsEntry {
    /// Display name of the link.
    pub name: String,
    /// Target URL.
    pub url: String,
    /// Optional description/notes after the `:`.
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

/// Matches `# Title` at the start of a line.
static H1_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s+(.+)$").expect("H1 regex"));

/// Matches `## Section Title`.
static H2_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^##\s+(.+)$").expect("H2 regex"));

/// Matches `> Blockquote text`.
static BLOCKQUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^>\s*(.+)$").expect("blockquote regex"));

/// Matches `- [Name](url)` or `- [Name](url): Notes`.
static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-*]\s+\[([^\]]+)\]\(([^)]+)\)(?::\s*(.+))?$").expect("link regex")
});

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse an llms.txt string into structured data.
pub fn parse_llms_txt(content: &str) -> Result<LlmsDocument> {
    let mut lines = content.lines().peekable();

    // --- Extract H1 title ---
    let title = loop {
        match lines.next() {
            Some(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(caps) = H1_RE.captures(trimmed) {
                    break caps[1].trim().to_string();
                }
                return Err(CcbenchError::parse(
                    "llms.txt must start with an H1 heading (# Title)",
                ));
            }
            None => {
                return Err(CcbenchError::parse("llms.txt is empty"));
            }
        }
    };

    // --- Extract optional blockquote summary (may span multiple lines) ---
    let mut summary_parts: Vec<String> = Vec::new();

    while let Some(&line) = lines.peek() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            lines.next();
            continue;
        }
        if let Some(caps) = BLOCKQUOTE_RE.captures(trimmed) {
            summary_parts.push(caps[1].trim().to_string());
            lines.next();
        } else {
            break;
        }
    }

    let summary = if summary_parts.is_empty() {
        None
    } else {
        Some(summary_parts.join(" "))
    };

    // --- Parse sections and entries ---
    let mut sections: Vec<LlmsSection> = Vec::new();
    let mut current_section: Option<LlmsSection> = None;

    for line in lines {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continue;
        }

        // New section heading?
        if let Some(caps) = H2_RE.captures(trimmed) {
            if let Some(section) = current_section.take() {
                sections.push(section);
            }
            current_section = Some(LlmsSection {
                title: caps[1].trim().to_string(),
                entries: Vec::new(),
            });
            continue;
        }

        // Link entry? Entries outside any section are ignored: section
        // membership is exactly what Condition B consumes.
        if let Some(caps) = LINK_RE.captures(trimmed) {
            if let Some(ref mut section) = current_section {
                section.entries.push(LlmsEntry {
                    name: caps[1].trim().to_string(),
                    url: caps[2].trim().to_string(),
                    notes: caps.get(3).map(|m| m.as_str().trim().to_string()),
                });
            }
            continue;
        }

        // Other lines (descriptive text) — skip but don't error
    }

    if let Some(section) = current_section.take() {
        sections.push(section);
    }

    Ok(LlmsDocument {
        title,
        summary,
        sections,
    })
}

// ---------------------------------------------------------------------------
// URL lookups
// ---------------------------------------------------------------------------

impl LlmsDocument {
    /// The title of the section containing `url`, if any. Matching is
    /// trailing-slash and case insensitive, like the archiver's.
    pub fn section_for_url(&self, url: &str) -> Option<&str> {
        let normalized = normalize(url);
        for section in &self.sections {
            if section.entries.iter().any(|e| normalize(&e.url) == normalized) {
                return Some(&section.title);
            }
        }
        None
    }

    /// The entry for `url`, if listed anywhere in the document.
    pub fn entry_for_url(&self, url: &str) -> Option<&LlmsEntry> {
        let normalized = normalize(url);
        self.sections
            .iter()
            .flat_map(|s| s.entries.iter())
            .find(|e| normalize(&e.url) == normalized)
    }
}

fn normalize(url: &str) -> String {
    url.trim_end_matches('/').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "\
# Example Docs

> Example documentation for the benchmark corpus.

## Getting Started

- [Installation](https://docs.example.com/getting-started/installation.md): How to install
- [Quickstart](https://docs.example.com/getting-started/quickstart.md)

## API Reference

- [Charges](https://docs.example.com/api/charges.md): Charge objects
- [Refunds](https://docs.example.com/api/refunds.md)
";

    #[test]
    fn parse_valid_document() {
        let parsed = parse_llms_txt(VALID).unwrap();

        assert_eq!(parsed.title, "Example Docs");
        assert_eq!(
            parsed.summary,
            Some("Example documentation for the benchmark corpus.".into())
        );
        assert_eq!(parsed.sections.len(), 2);
        assert_eq!(parsed.sections[0].title, "Getting Started");
        assert_eq!(parsed.sections[0].entries.len(), 2);
        assert_eq!(parsed.sections[1].title, "API Reference");

        let first = &parsed.sections[0].entries[0];
        assert_eq!(first.name, "Installation");
        assert_eq!(
            first.url,
            "https://docs.example.com/getting-started/installation.md"
        );
        assert_eq!(first.notes, Some("How to install".into()));
        assert!(parsed.sections[0].entries[1].notes.is_none());
    }

    #[test]
    fn parse_empty_fails() {
        assert!(parse_llms_txt("").is_err());
    }

    #[test]
    fn parse_no_h1_fails() {
        assert!(parse_llms_txt("This has no heading\nJust text.").is_err());
    }

    #[test]
    fn parse_multiline_blockquote() {
        let content = "# Title\n\n> Line one\n> Line two\n\n## Sec\n- [A](https://a.com)\n";
        let parsed = parse_llms_txt(content).unwrap();
        assert_eq!(parsed.summary, Some("Line one Line two".into()));
    }

    #[test]
    fn section_for_url_normalizes() {
        let parsed = parse_llms_txt(VALID).unwrap();
        assert_eq!(
            parsed.section_for_url("https://docs.example.com/api/charges.md/"),
            Some("API Reference")
        );
        assert_eq!(
            parsed.section_for_url("https://docs.example.com/API/Charges.md"),
            Some("API Reference")
        );
        assert!(parsed.section_for_url("https://docs.example.com/other").is_none());
    }

    #[test]
    fn entry_for_url_finds_name() {
        let parsed = parse_llms_txt(VALID).unwrap();
        let entry = parsed
            .entry_for_url("https://docs.example.com/api/refunds.md")
            .unwrap();
        assert_eq!(entry.name, "Refunds");
    }
}
