//! Archive manifest: the URL-keyed fetch-status table produced by the
//! external archival step.
//!
//! The manifest records every fetch attempt the archiver made, successful or
//! not, one entry per (URL, condition). The runner treats it as read-only
//! ground truth about what content exists on disk.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CcbenchError, Result};
use crate::types::Condition;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Fetch outcome recorded by the archiver for a single URL/condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStatus {
    Success,
    HttpError,
    Timeout,
    DnsFailure,
    WafBlocked,
    JsOnly,
    Pending,
}

/// A single entry in `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub site_id: String,
    pub url: String,
    pub url_hash: String,
    pub condition: Condition,
    #[serde(default)]
    pub fetch_timestamp: String,
    #[serde(default)]
    pub http_status: u16,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub content_length_bytes: u64,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    pub fetch_status: FetchStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Path relative to `<archive_dir>/html`, set for Condition A successes.
    #[serde(default)]
    pub html_path: Option<String>,
    /// Path relative to `<archive_dir>/markdown`, set for Condition B successes.
    #[serde(default)]
    pub markdown_path: Option<String>,
    /// Section label recorded at archive time from the site's llms.txt.
    #[serde(default)]
    pub llmstxt_section: Option<String>,
}

impl ManifestEntry {
    /// Whether this entry has stored content the runner can read.
    pub fn is_usable(&self) -> bool {
        self.fetch_status == FetchStatus::Success
            && (self.html_path.is_some() || self.markdown_path.is_some())
    }
}

/// Archive protocol settings recorded alongside the entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveProtocol {
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub rate_limit_ms: u64,
}

/// The parsed `manifest.json`, indexed by (URL, condition).
#[derive(Debug, Clone)]
pub struct ArchiveManifest {
    pub fetched_at: String,
    pub archive_protocol: ArchiveProtocol,
    pub entries: Vec<ManifestEntry>,
    index: HashMap<(String, Condition), usize>,
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    fetched_at: String,
    #[serde(default)]
    archive_protocol: ArchiveProtocol,
    entries: Vec<ManifestEntry>,
}

// ---------------------------------------------------------------------------
// Loading and lookup
// ---------------------------------------------------------------------------

impl ArchiveManifest {
    /// Load `manifest.json` and build the lookup index.
    pub fn load(path: &Path) -> Result<ArchiveManifest> {
        let content = std::fs::read_to_string(path).map_err(|e| CcbenchError::io(path, e))?;

        let raw: RawManifest = serde_json::from_str(&content)
            .map_err(|e| CcbenchError::parse(format!("failed to parse {}: {e}", path.display())))?;

        Ok(Self::from_entries(
            raw.fetched_at,
            raw.archive_protocol,
            raw.entries,
        ))
    }

    /// Build a manifest from entries directly (tests, synthetic archives).
    pub fn from_entries(
        fetched_at: String,
        archive_protocol: ArchiveProtocol,
        entries: Vec<ManifestEntry>,
    ) -> ArchiveManifest {
        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            // First entry wins on duplicates, matching the archiver's
            // resume semantics (earlier SUCCESS entries are kept).
            index
                .entry((normalize_url(&entry.url), entry.condition))
                .or_insert(i);
        }

        ArchiveManifest {
            fetched_at,
            archive_protocol,
            entries,
            index,
        }
    }

    /// Exact-URL lookup (trailing-slash and case insensitive, matching the
    /// archiver's URL normalization).
    pub fn entry_for(&self, url: &str, condition: Condition) -> Option<&ManifestEntry> {
        self.index
            .get(&(normalize_url(url), condition))
            .map(|&i| &self.entries[i])
    }

    /// Resolve a question source URL to its archive entry for a condition,
    /// trying the derived URL forms the archiver stores content under:
    ///
    /// - Condition A for a `.md` source URL is archived under the stripped URL
    ///   (the rendered HTML page lives at the same path without `.md`).
    /// - Condition B for an HTML source URL may be archived under `<url>.md`
    ///   or `<url>/index.md`, per the site's llms.txt listing.
    pub fn resolve(&self, url: &str, condition: Condition) -> Option<&ManifestEntry> {
        for candidate in resolve_candidates(url, condition) {
            if let Some(entry) = self.entry_for(&candidate, condition) {
                return Some(entry);
            }
        }
        None
    }
}

/// Candidate archive URLs for a source URL under a condition, most specific
/// first. Mirrors the archiver's URL derivation.
pub fn resolve_candidates(url: &str, condition: Condition) -> Vec<String> {
    let mut candidates = vec![url.to_string()];

    match condition {
        Condition::A => {
            if let Some(stripped) = url.strip_suffix(".md") {
                candidates.push(stripped.to_string());
            }
        }
        Condition::B => {
            if !url.ends_with(".md") && !url.ends_with("/llms.txt") {
                let trimmed = url.trim_end_matches('/');
                candidates.push(format!("{trimmed}.md"));
                candidates.push(format!("{trimmed}/index.md"));
            }
        }
    }

    candidates
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, condition: Condition, status: FetchStatus) -> ManifestEntry {
        ManifestEntry {
            site_id: "S001".into(),
            url: url.into(),
            url_hash: "abcd1234abcd1234".into(),
            condition,
            fetch_timestamp: String::new(),
            http_status: 200,
            content_type: String::new(),
            content_length_bytes: 0,
            last_modified: None,
            etag: None,
            fetch_status: status,
            failure_reason: None,
            html_path: matches!(condition, Condition::A).then(|| "S001/abcd.html".into()),
            markdown_path: matches!(condition, Condition::B).then(|| "S001/abcd.md".into()),
            llmstxt_section: None,
        }
    }

    fn manifest(entries: Vec<ManifestEntry>) -> ArchiveManifest {
        ArchiveManifest::from_entries(String::new(), ArchiveProtocol::default(), entries)
    }

    #[test]
    fn manifest_json_parses() {
        let json = r#"{
            "fetched_at": "2025-11-02T10:00:00+00:00",
            "archive_protocol": {"user_agent": "bench/1.0", "timeout_seconds": 30, "rate_limit_ms": 1000},
            "entries": [{
                "site_id": "S001",
                "url": "https://docs.example.com/charges",
                "url_hash": "0011223344556677",
                "condition": "A",
                "fetch_status": "SUCCESS",
                "http_status": 200,
                "html_path": "S001/0011223344556677.html"
            }, {
                "site_id": "S001",
                "url": "https://docs.example.com/charges.md",
                "url_hash": "8899aabbccddeeff",
                "condition": "B",
                "fetch_status": "TIMEOUT",
                "failure_reason": "Request timed out after 30s"
            }]
        }"#;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, json).unwrap();

        let manifest = ArchiveManifest::load(&path).expect("load manifest");
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.archive_protocol.rate_limit_ms, 1000);

        let a = manifest
            .entry_for("https://docs.example.com/charges", Condition::A)
            .expect("condition A entry");
        assert!(a.is_usable());

        let b = manifest
            .entry_for("https://docs.example.com/charges.md", Condition::B)
            .expect("condition B entry");
        assert_eq!(b.fetch_status, FetchStatus::Timeout);
        assert!(!b.is_usable());
    }

    #[test]
    fn lookup_ignores_trailing_slash_and_case() {
        let m = manifest(vec![entry(
            "https://docs.example.com/Charges",
            Condition::A,
            FetchStatus::Success,
        )]);
        assert!(
            m.entry_for("https://docs.example.com/charges/", Condition::A)
                .is_some()
        );
    }

    #[test]
    fn resolve_strips_md_for_condition_a() {
        let m = manifest(vec![entry(
            "https://docs.example.com/charges",
            Condition::A,
            FetchStatus::Success,
        )]);
        let resolved = m
            .resolve("https://docs.example.com/charges.md", Condition::A)
            .expect("resolved via stripped URL");
        assert_eq!(resolved.url, "https://docs.example.com/charges");
    }

    #[test]
    fn resolve_appends_md_for_condition_b() {
        let m = manifest(vec![entry(
            "https://docs.example.com/charges.md",
            Condition::B,
            FetchStatus::Success,
        )]);
        assert!(
            m.resolve("https://docs.example.com/charges", Condition::B)
                .is_some()
        );
    }

    #[test]
    fn resolve_misses_when_no_candidate_exists() {
        let m = manifest(vec![]);
        assert!(
            m.resolve("https://docs.example.com/charges", Condition::A)
                .is_none()
        );
    }
}
