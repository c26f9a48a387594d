//! Content assembly: builds the two prompt variants for a (site, question,
//! model) tuple.
//!
//! Both assembly paths are wrapped so that any internal error becomes an
//! exclusion result, never a thrown error — the orchestrator must always
//! receive a value it can write as a row. Per-URL failures are tolerated:
//! a tuple is only excluded when *no* source URL yields usable content.

use std::path::PathBuf;

use tracing::{debug, warn};

use ccbench_extract::preprocess::preprocess_markdown;
use ccbench_llmstxt::{LlmsDocument, SiteCache};
use ccbench_shared::config::render_prompt;
use ccbench_shared::{
    ArchiveManifest, Condition, FetchStatus, InferenceParams, ModelConfig, Question, Result,
    RunConfig, SiteList, TokenCountTable,
};

/// Section label used when a document matches nothing in the site's llms.txt
/// and the archiver recorded no label either.
const DEFAULT_SECTION: &str = "Documentation";

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// The assembled input for one tuple-condition, consumed immediately by the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct AssembledContent {
    pub condition: Condition,
    pub outcome: AssemblyOutcome,
}

/// Either a ready prompt with its token accounting, or an exclusion.
#[derive(Debug, Clone)]
pub enum AssemblyOutcome {
    Ready(ReadyContent),
    Excluded { reason: ExclusionReason, note: String },
}

/// A fully rendered prompt plus the numbers the result row needs.
#[derive(Debug, Clone)]
pub struct ReadyContent {
    pub prompt: String,
    pub input_tokens: u64,
    pub reference_tokens: u64,
    pub content_bytes: u64,
    /// Per-request context-window hint, capped at the model's hard limit.
    pub num_ctx: u64,
    /// Assembly caveats carried into the row's scoring notes
    /// (unusable source URLs, missing token counts).
    pub notes: String,
}

/// Why a condition produced no prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    /// Condition A: no source URL yielded extractable text above the minimum.
    NoContent,
    /// Condition B: no source URL yielded readable Markdown.
    MarkdownMissing,
    /// An internal assembly failure, recorded rather than raised.
    AssemblyError,
}

impl ExclusionReason {
    /// Stable tag written into the `exclusion_reason` result column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoContent => "no_content",
            Self::MarkdownMissing => "markdown_missing",
            Self::AssemblyError => "assembly_error",
        }
    }
}

/// `min(model_max_context, input + predict + overhead)` — the request never
/// asks the backend for more context than the model's hard limit.
pub fn compute_context_window(
    max_context: u64,
    input_tokens: u64,
    params: &InferenceParams,
) -> u64 {
    max_context.min(
        input_tokens
            .saturating_add(params.num_predict)
            .saturating_add(params.token_overhead),
    )
}

// ---------------------------------------------------------------------------
// ContentAssembler
// ---------------------------------------------------------------------------

/// Assembles prompt content from the frozen archive. Holds the per-site
/// llms.txt cache for the lifetime of a run.
pub struct ContentAssembler<'a> {
    config: &'a RunConfig,
    sites: &'a SiteList,
    manifest: &'a ArchiveManifest,
    tokens: &'a TokenCountTable,
    llms_cache: SiteCache,
}

impl<'a> ContentAssembler<'a> {
    pub fn new(
        config: &'a RunConfig,
        sites: &'a SiteList,
        manifest: &'a ArchiveManifest,
        tokens: &'a TokenCountTable,
    ) -> ContentAssembler<'a> {
        ContentAssembler {
            config,
            sites,
            manifest,
            tokens,
            llms_cache: SiteCache::new(),
        }
    }

    /// Assemble one condition for a tuple. Never fails: internal errors come
    /// back as [`ExclusionReason::AssemblyError`].
    pub fn assemble(
        &mut self,
        question: &Question,
        model: &ModelConfig,
        condition: Condition,
    ) -> AssembledContent {
        let result = match condition {
            Condition::A => self.assemble_raw(question, model),
            Condition::B => self.assemble_curated(question, model),
        };

        match result {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    question_id = %question.question_id,
                    model = %model.id,
                    %condition,
                    error = %e,
                    "assembly failed internally, recording exclusion"
                );
                AssembledContent {
                    condition,
                    outcome: AssemblyOutcome::Excluded {
                        reason: ExclusionReason::AssemblyError,
                        note: e.to_string(),
                    },
                }
            }
        }
    }

    // -- Condition A: raw extraction ------------------------------------

    fn assemble_raw(
        &mut self,
        question: &Question,
        model: &ModelConfig,
    ) -> Result<AssembledContent> {
        let min_chars = self.config.assembly.min_extract_chars;
        let mut texts: Vec<String> = Vec::new();
        let mut url_notes: Vec<String> = Vec::new();

        for url in &question.source_urls {
            let Some(entry) = self.manifest.resolve(url, Condition::A) else {
                url_notes.push(format!("{url}: no archive entry"));
                continue;
            };
            if entry.fetch_status != FetchStatus::Success {
                url_notes.push(format!(
                    "{url}: archived fetch failed ({})",
                    entry
                        .failure_reason
                        .as_deref()
                        .unwrap_or("no reason recorded")
                ));
                continue;
            }
            let Some(rel) = &entry.html_path else {
                url_notes.push(format!("{url}: no stored page"));
                continue;
            };

            let path = self.html_root().join(rel);
            let html = match std::fs::read_to_string(&path) {
                Ok(html) => html,
                Err(e) => {
                    url_notes.push(format!("{url}: archive file unreadable ({e})"));
                    continue;
                }
            };

            match ccbench_extract::extract_article_text(&html) {
                Ok(text) if text.chars().count() >= min_chars => texts.push(text),
                Ok(_) => url_notes.push(format!("{url}: no renderable content")),
                Err(e) => url_notes.push(format!("{url}: extraction failed ({e})")),
            }
        }

        if texts.is_empty() {
            return Ok(self.excluded(
                Condition::A,
                ExclusionReason::NoContent,
                url_notes.join("; "),
            ));
        }

        let content = texts.join(&self.config.assembly.separator);
        Ok(self.finish(question, model, Condition::A, &content, url_notes))
    }

    // -- Condition B: curated structure ---------------------------------

    fn assemble_curated(
        &mut self,
        question: &Question,
        model: &ModelConfig,
    ) -> Result<AssembledContent> {
        let site = self.sites.get(&question.site_id);
        let llms = self.site_llms(question);

        let mut docs: Vec<CuratedDoc> = Vec::new();
        let mut url_notes: Vec<String> = Vec::new();

        for url in &question.source_urls {
            let Some(entry) = self.manifest.resolve(url, Condition::B) else {
                url_notes.push(format!("{url}: no archive entry"));
                continue;
            };
            if entry.fetch_status != FetchStatus::Success {
                url_notes.push(format!(
                    "{url}: archived fetch failed ({})",
                    entry
                        .failure_reason
                        .as_deref()
                        .unwrap_or("no reason recorded")
                ));
                continue;
            }
            let Some(rel) = &entry.markdown_path else {
                url_notes.push(format!("{url}: no stored markdown"));
                continue;
            };

            let path = self.markdown_root().join(rel);
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    url_notes.push(format!("{url}: archive file unreadable ({e})"));
                    continue;
                }
            };

            let body = preprocess_markdown(&raw, self.config.assembly.max_blank_lines);
            if body.trim().is_empty() {
                url_notes.push(format!("{url}: empty after preprocessing"));
                continue;
            }

            // Section membership: llms.txt URL match wins, then the label the
            // archiver recorded, then the fixed default.
            let section = llms
                .as_deref()
                .and_then(|d| d.section_for_url(&entry.url))
                .map(str::to_string)
                .or_else(|| entry.llmstxt_section.clone())
                .unwrap_or_else(|| DEFAULT_SECTION.to_string());

            let title = llms
                .as_deref()
                .and_then(|d| d.entry_for_url(&entry.url))
                .map(|e| e.name.clone())
                .unwrap_or_else(|| title_from_url(&entry.url));

            docs.push(CuratedDoc {
                section,
                title,
                url: entry.url.clone(),
                body,
            });
        }

        if docs.is_empty() {
            return Ok(self.excluded(
                Condition::B,
                ExclusionReason::MarkdownMissing,
                url_notes.join("; "),
            ));
        }

        let site_title = llms
            .as_deref()
            .map(|d| d.title.clone())
            .or_else(|| site.map(|s| s.domain.clone()))
            .unwrap_or_else(|| question.site_id.clone());
        let summary = llms.as_deref().and_then(|d| d.summary.clone());

        let content = render_curated_container(&site_title, summary.as_deref(), &docs);
        Ok(self.finish(question, model, Condition::B, &content, url_notes))
    }

    // -- shared tail ----------------------------------------------------

    fn finish(
        &self,
        question: &Question,
        model: &ModelConfig,
        condition: Condition,
        content: &str,
        mut notes: Vec<String>,
    ) -> AssembledContent {
        let prompt = render_prompt(
            &self.config.prompt.template,
            &question.question_text,
            content,
        );

        let counts = self
            .tokens
            .lookup(&question.site_id, &question.question_id, condition, &model.family);
        let (input_tokens, reference_tokens) = match counts {
            Some(c) => (c.input_tokens, c.reference_tokens),
            None => {
                notes.push("token counts missing from table".to_string());
                (0, 0)
            }
        };

        let num_ctx =
            compute_context_window(model.max_context, input_tokens, &self.config.inference);

        debug!(
            question_id = %question.question_id,
            model = %model.id,
            %condition,
            input_tokens,
            num_ctx,
            content_bytes = content.len(),
            "assembled condition"
        );

        AssembledContent {
            condition,
            outcome: AssemblyOutcome::Ready(ReadyContent {
                prompt,
                input_tokens,
                reference_tokens,
                content_bytes: content.len() as u64,
                num_ctx,
                notes: notes.join("; "),
            }),
        }
    }

    fn excluded(
        &self,
        condition: Condition,
        reason: ExclusionReason,
        note: String,
    ) -> AssembledContent {
        AssembledContent {
            condition,
            outcome: AssemblyOutcome::Excluded { reason, note },
        }
    }

    /// The parsed llms.txt for the question's site, via the populate-on-miss
    /// cache. The file path is resolved through the manifest entry for the
    /// site's llms.txt URL.
    fn site_llms(&mut self, question: &Question) -> Option<std::sync::Arc<LlmsDocument>> {
        let site = self.sites.get(&question.site_id)?;
        let rel = self
            .manifest
            .entry_for(&site.llms_txt_url, Condition::B)
            .and_then(|e| e.markdown_path.clone())?;
        let path = self.markdown_root().join(rel);
        self.llms_cache.get_or_load(&question.site_id, &path)
    }

    fn html_root(&self) -> PathBuf {
        self.config.paths.archive_dir.join("html")
    }

    fn markdown_root(&self) -> PathBuf {
        self.config.paths.archive_dir.join("markdown")
    }
}

// ---------------------------------------------------------------------------
// Curated container rendering
// ---------------------------------------------------------------------------

struct CuratedDoc {
    section: String,
    title: String,
    url: String,
    body: String,
}

/// Render the nested, title/summary-annotated container Condition B sends:
/// documents grouped by llms.txt section, in first-seen section order.
fn render_curated_container(
    site_title: &str,
    summary: Option<&str>,
    docs: &[CuratedDoc],
) -> String {
    let mut sections: Vec<(&str, Vec<&CuratedDoc>)> = Vec::new();
    for doc in docs {
        match sections.iter_mut().find(|(name, _)| *name == doc.section) {
            Some((_, list)) => list.push(doc),
            None => sections.push((&doc.section, vec![doc])),
        }
    }

    let mut out = String::new();
    out.push_str(&format!("<documents site=\"{}\"", escape_attr(site_title)));
    if let Some(summary) = summary {
        out.push_str(&format!(" summary=\"{}\"", escape_attr(summary)));
    }
    out.push_str(">\n");

    for (name, list) in sections {
        out.push_str(&format!("  <section name=\"{}\">\n", escape_attr(name)));
        for doc in list {
            out.push_str(&format!(
                "    <document title=\"{}\" url=\"{}\">\n",
                escape_attr(&doc.title),
                escape_attr(&doc.url)
            ));
            out.push_str(&doc.body);
            if !doc.body.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("    </document>\n");
        }
        out.push_str("  </section>\n");
    }

    out.push_str("</documents>");
    out
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

/// Fallback document title: the last URL path segment, extension stripped.
fn title_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".md")
        .to_string()
}
