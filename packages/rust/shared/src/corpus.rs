//! Question corpus and site list loading.
//!
//! Both files are authored by external collaborators and read-only here:
//! `questions.json` holds per-site question blocks, `site-list.csv` maps
//! site ids to their domains and llms.txt locations.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{CcbenchError, Result};

// ---------------------------------------------------------------------------
// Questions
// ---------------------------------------------------------------------------

/// One benchmark question, flattened from its site block.
#[derive(Debug, Clone)]
pub struct Question {
    /// Owning site id (e.g. `S001`).
    pub site_id: String,
    /// Unique question id across the whole corpus.
    pub question_id: String,
    /// The question posed to the model.
    pub question_text: String,
    /// Source URLs whose archived content answers the question.
    pub source_urls: Vec<String>,
    /// Complexity tag (e.g. `single-page`, `multi-page`).
    pub complexity: String,
}

/// The full question corpus, in file order.
#[derive(Debug, Clone)]
pub struct Corpus {
    pub questions: Vec<Question>,
}

#[derive(Deserialize)]
struct SiteBlock {
    site_id: String,
    questions: Vec<RawQuestion>,
}

#[derive(Deserialize)]
struct RawQuestion {
    question_id: String,
    question_text: String,
    source_urls: Vec<String>,
    #[serde(default)]
    complexity: String,
}

impl Corpus {
    /// Load and flatten `questions.json`. Order is preserved: the orchestrator
    /// iterates questions in corpus order.
    pub fn load(path: &Path) -> Result<Corpus> {
        let content = std::fs::read_to_string(path).map_err(|e| CcbenchError::io(path, e))?;

        let blocks: Vec<SiteBlock> = serde_json::from_str(&content)
            .map_err(|e| CcbenchError::parse(format!("failed to parse {}: {e}", path.display())))?;

        let questions = blocks
            .into_iter()
            .flat_map(|block| {
                let site_id = block.site_id;
                block
                    .questions
                    .into_iter()
                    .map(move |q| Question {
                        site_id: site_id.clone(),
                        question_id: q.question_id,
                        question_text: q.question_text,
                        source_urls: q.source_urls,
                        complexity: q.complexity,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        Ok(Corpus { questions })
    }

    /// Schema check used by preflight: non-empty corpus, unique question ids,
    /// every question with at least one source URL.
    pub fn check_schema(&self) -> Result<()> {
        if self.questions.is_empty() {
            return Err(CcbenchError::validation("question corpus is empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for q in &self.questions {
            if !seen.insert(q.question_id.as_str()) {
                return Err(CcbenchError::validation(format!(
                    "duplicate question_id '{}'",
                    q.question_id
                )));
            }
            if q.source_urls.is_empty() {
                return Err(CcbenchError::validation(format!(
                    "question '{}' has no source URLs",
                    q.question_id
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Site list
// ---------------------------------------------------------------------------

/// One row of `site-list.csv`.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteInfo {
    pub site_id: String,
    pub domain: String,
    pub llms_txt_url: String,
    pub html_docs_url: String,
}

/// The site registry, keyed by site id.
#[derive(Debug, Clone)]
pub struct SiteList {
    sites: HashMap<String, SiteInfo>,
}

impl SiteList {
    /// Build a site list directly (synthetic corpora, tests).
    pub fn from_sites(sites: impl IntoIterator<Item = SiteInfo>) -> SiteList {
        SiteList {
            sites: sites
                .into_iter()
                .map(|s| (s.site_id.clone(), s))
                .collect(),
        }
    }

    /// Load `site-list.csv`.
    pub fn load(path: &Path) -> Result<SiteList> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| {
            CcbenchError::parse(format!("failed to open {}: {e}", path.display()))
        })?;

        let mut sites = HashMap::new();
        for record in reader.deserialize::<SiteInfo>() {
            let site = record.map_err(|e| {
                CcbenchError::parse(format!("bad row in {}: {e}", path.display()))
            })?;
            sites.insert(site.site_id.clone(), site);
        }

        Ok(SiteList { sites })
    }

    pub fn get(&self, site_id: &str) -> Option<&SiteInfo> {
        self.sites.get(site_id)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
