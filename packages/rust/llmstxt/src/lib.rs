//! Archived llms.txt loading and per-site caching.
//!
//! Condition B needs each site's parsed llms.txt to group documents by
//! section. Source files are frozen for the lifetime of a run, so the cache
//! is a plain populate-on-miss map with no invalidation: one parse per site,
//! read many times. (A concurrent reimplementation would need to guard
//! against duplicate-parse races on first access per site.)

mod parser;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

pub use parser::{LlmsDocument, LlmsEntry, LlmsSection, parse_llms_txt};

/// Per-site memoizing cache of parsed llms.txt documents.
#[derive(Debug, Default)]
pub struct SiteCache {
    cache: HashMap<String, Option<Arc<LlmsDocument>>>,
}

impl SiteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The parsed llms.txt for `site_id`, reading and parsing `path` on first
    /// access. A missing or unparseable file is cached as `None` so the run
    /// does not retry the parse per question — Condition B then falls back to
    /// the manifest's archived section labels.
    pub fn get_or_load(&mut self, site_id: &str, path: &Path) -> Option<Arc<LlmsDocument>> {
        if let Some(cached) = self.cache.get(site_id) {
            return cached.clone();
        }

        let loaded = match std::fs::read_to_string(path) {
            Ok(content) => match parser::parse_llms_txt(&content) {
                Ok(doc) => {
                    debug!(
                        site_id,
                        title = %doc.title,
                        sections = doc.sections.len(),
                        "parsed llms.txt"
                    );
                    Some(Arc::new(doc))
                }
                Err(e) => {
                    warn!(site_id, error = %e, "llms.txt unparseable, sections unavailable");
                    None
                }
            },
            Err(e) => {
                warn!(site_id, path = %path.display(), error = %e, "llms.txt unreadable");
                None
            }
        };

        self.cache.insert(site_id.to_string(), loaded.clone());
        loaded
    }

    /// Number of sites resolved so far (hit or miss).
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# Site Docs\n\n> A site.\n\n## Guides\n- [One](https://s.com/one.md)\n";

    #[test]
    fn cache_parses_once_and_memoizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llms.txt");
        std::fs::write(&path, DOC).unwrap();

        let mut cache = SiteCache::new();
        let first = cache.get_or_load("S001", &path).expect("parsed");
        assert_eq!(first.title, "Site Docs");

        // Mutate the file; the cached parse must not change (frozen inputs).
        std::fs::write(&path, "# Changed\n").unwrap();
        let second = cache.get_or_load("S001", &path).expect("cached");
        assert_eq!(second.title, "Site Docs");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_file_cached_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.txt");

        let mut cache = SiteCache::new();
        assert!(cache.get_or_load("S002", &path).is_none());

        // Writing the file afterwards must not change the answer for this run.
        std::fs::write(&path, DOC).unwrap();
        assert!(cache.get_or_load("S002", &path).is_none());
        assert_eq!(cache.len(), 1);
    }
}
