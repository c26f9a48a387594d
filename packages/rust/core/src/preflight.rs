//! Preflight validation: ten checks run once before any inference.
//!
//! The design goal is catching a missing archive file at minute zero, not at
//! hour three. Each check is independently pass/fail and fatal/warning; any
//! fatal failure aborts the run before the first inference call.

use std::collections::HashSet;
use std::path::Path;

use tracing::{error, info, warn};

use ccbench_shared::{
    ArchiveManifest, Condition, Corpus, FetchStatus, Result, RunConfig, SiteList,
};
use ccbench_store::{CheckpointManager, ResultWriter};

use crate::inference::InferenceClient;

/// Assumed upper bound on a result row's on-disk size, for the disk check.
const EST_ROW_BYTES: u64 = 16 * 1024;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Aborts the run.
    Fatal,
    /// Logged, run proceeds.
    Warning,
}

/// Outcome of one preflight check. Produced once per run, never persisted.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub check_id: &'static str,
    pub description: &'static str,
    pub passed: bool,
    pub severity: Severity,
    pub detail: String,
}

impl ValidationResult {
    fn pass(check_id: &'static str, description: &'static str) -> ValidationResult {
        ValidationResult {
            check_id,
            description,
            passed: true,
            severity: Severity::Fatal,
            detail: String::new(),
        }
    }

    fn fail(
        check_id: &'static str,
        description: &'static str,
        severity: Severity,
        detail: String,
    ) -> ValidationResult {
        ValidationResult {
            check_id,
            description,
            passed: false,
            severity,
            detail,
        }
    }
}

/// Whether any failed check is fatal.
pub fn has_fatal_failure(results: &[ValidationResult]) -> bool {
    results
        .iter()
        .any(|r| !r.passed && r.severity == Severity::Fatal)
}

/// Log every check outcome at the appropriate level.
pub fn log_results(results: &[ValidationResult]) {
    for r in results {
        if r.passed {
            info!(check = r.check_id, "preflight: {}", r.description);
        } else {
            match r.severity {
                Severity::Fatal => {
                    error!(check = r.check_id, detail = %r.detail, "preflight FAILED: {}", r.description);
                }
                Severity::Warning => {
                    warn!(check = r.check_id, detail = %r.detail, "preflight warning: {}", r.description);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The battery
// ---------------------------------------------------------------------------

/// Run all ten checks in order. Never short-circuits: the operator sees the
/// full picture even when an early check fails.
pub async fn run_preflight(
    config: &RunConfig,
    corpus: &Corpus,
    sites: &SiteList,
    manifest: &ArchiveManifest,
    client: &InferenceClient,
) -> Result<Vec<ValidationResult>> {
    let mut results = Vec::with_capacity(10);

    // 1. Config parses — trivially true once loading succeeded.
    results.push(ValidationResult::pass(
        "config-parse",
        "run configuration parses and validates",
    ));

    results.push(check_paths_exist(config));
    results.push(check_corpus_schema(corpus, sites));
    results.push(check_manifest_coverage(corpus, manifest));
    results.push(check_archive_files(config, manifest));
    results.push(check_endpoint_health(client).await);
    results.push(check_models_available(config, client).await);
    results.push(check_checkpoint_version(config)?);
    results.push(check_checkpoint_consistency(config)?);
    results.push(check_disk_space(config, corpus));

    Ok(results)
}

/// 2. All configured input paths resolve to existing files/directories.
fn check_paths_exist(config: &RunConfig) -> ValidationResult {
    let missing: Vec<String> = config
        .paths
        .inputs()
        .filter(|(_, path)| !path.exists())
        .map(|(name, path)| format!("{name}: {}", path.display()))
        .collect();

    if missing.is_empty() {
        ValidationResult::pass("paths-exist", "all input paths exist")
    } else {
        ValidationResult::fail(
            "paths-exist",
            "all input paths exist",
            Severity::Fatal,
            missing.join("; "),
        )
    }
}

/// 3. The question corpus has a valid schema.
fn check_corpus_schema(corpus: &Corpus, sites: &SiteList) -> ValidationResult {
    if let Err(e) = corpus.check_schema() {
        return ValidationResult::fail(
            "corpus-schema",
            "question corpus has a valid schema",
            Severity::Fatal,
            e.to_string(),
        );
    }

    let unknown: Vec<&str> = corpus
        .questions
        .iter()
        .filter(|q| sites.get(&q.site_id).is_none())
        .map(|q| q.question_id.as_str())
        .collect();
    if !unknown.is_empty() {
        return ValidationResult::fail(
            "corpus-schema",
            "question corpus has a valid schema",
            Severity::Fatal,
            format!("questions reference unknown site ids: {}", unknown.join(", ")),
        );
    }

    ValidationResult::pass("corpus-schema", "question corpus has a valid schema")
}

/// 4. The archive manifest covers every source URL referenced by any question.
fn check_manifest_coverage(corpus: &Corpus, manifest: &ArchiveManifest) -> ValidationResult {
    let mut uncovered: Vec<String> = Vec::new();

    for question in &corpus.questions {
        for url in &question.source_urls {
            for condition in [Condition::A, Condition::B] {
                if manifest.resolve(url, condition).is_none() {
                    uncovered.push(format!("{} ({}, {})", url, question.question_id, condition));
                }
            }
        }
    }

    if uncovered.is_empty() {
        ValidationResult::pass(
            "manifest-coverage",
            "archive manifest covers every source URL",
        )
    } else {
        let shown = uncovered.iter().take(5).cloned().collect::<Vec<_>>().join("; ");
        ValidationResult::fail(
            "manifest-coverage",
            "archive manifest covers every source URL",
            Severity::Fatal,
            format!("{} uncovered: {shown}", uncovered.len()),
        )
    }
}

/// 5. Every manifest entry marked successful has a non-empty backing file.
fn check_archive_files(config: &RunConfig, manifest: &ArchiveManifest) -> ValidationResult {
    let mut broken: Vec<String> = Vec::new();

    for entry in &manifest.entries {
        if entry.fetch_status != FetchStatus::Success {
            continue;
        }
        let rel_path = match entry.condition {
            Condition::A => entry.html_path.as_ref().map(|r| ("html", r)),
            Condition::B => entry.markdown_path.as_ref().map(|r| ("markdown", r)),
        };
        let Some((kind, rel)) = rel_path else {
            broken.push(format!("{}: SUCCESS entry without a stored path", entry.url));
            continue;
        };
        let path = config.paths.archive_dir.join(kind).join(rel);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => broken.push(format!("{}: backing file empty", entry.url)),
            Err(_) => broken.push(format!("{}: backing file missing", entry.url)),
        }
    }

    if broken.is_empty() {
        ValidationResult::pass(
            "archive-files",
            "every successful manifest entry has a non-empty backing file",
        )
    } else {
        let shown = broken.iter().take(5).cloned().collect::<Vec<_>>().join("; ");
        ValidationResult::fail(
            "archive-files",
            "every successful manifest entry has a non-empty backing file",
            Severity::Fatal,
            format!("{} broken: {shown}", broken.len()),
        )
    }
}

/// 6. The inference endpoint responds to a health check.
async fn check_endpoint_health(client: &InferenceClient) -> ValidationResult {
    if client.health_check().await {
        ValidationResult::pass("endpoint-health", "inference endpoint responds")
    } else {
        ValidationResult::fail(
            "endpoint-health",
            "inference endpoint responds",
            Severity::Fatal,
            "health probe failed".into(),
        )
    }
}

/// 7. Every configured model is listed at the endpoint. Warning only —
/// backends may load models lazily.
async fn check_models_available(config: &RunConfig, client: &InferenceClient) -> ValidationResult {
    match client.list_models().await {
        Some(available) => {
            let available: HashSet<&str> = available.iter().map(String::as_str).collect();
            let missing: Vec<&str> = config
                .models
                .iter()
                .filter(|m| !available.contains(m.id.as_str()))
                .map(|m| m.id.as_str())
                .collect();
            if missing.is_empty() {
                ValidationResult::pass("models-available", "all configured models are listed")
            } else {
                ValidationResult::fail(
                    "models-available",
                    "all configured models are listed",
                    Severity::Warning,
                    format!("not listed (may load lazily): {}", missing.join(", ")),
                )
            }
        }
        None => ValidationResult::fail(
            "models-available",
            "all configured models are listed",
            Severity::Warning,
            "model listing probe failed".into(),
        ),
    }
}

/// 8. The checkpoint's recorded config version matches. Warning only.
fn check_checkpoint_version(config: &RunConfig) -> Result<ValidationResult> {
    let stored = CheckpointManager::stored_config_version(&config.paths.checkpoint)?;
    Ok(match stored {
        Some(version) if version != config.version => ValidationResult::fail(
            "checkpoint-version",
            "checkpoint config version matches",
            Severity::Warning,
            format!("checkpoint has '{version}', config has '{}'", config.version),
        ),
        _ => ValidationResult::pass("checkpoint-version", "checkpoint config version matches"),
    })
}

/// 9. Checkpoint and result-store contents cross-validate. Warning only;
/// this is a read-only diff — the orchestrator does the authoritative
/// reconcile (and repair) at startup.
fn check_checkpoint_consistency(config: &RunConfig) -> Result<ValidationResult> {
    let store_tuples = ResultWriter::completed_tuples(&config.paths.results_csv)?;

    let mut checkpoint = CheckpointManager::new(&config.paths.checkpoint, &config.version);
    if !checkpoint.try_load_existing()? {
        return Ok(ValidationResult::pass(
            "checkpoint-consistency",
            "checkpoint agrees with the result store",
        ));
    }

    let mut ahead = 0usize; // claimed complete, store lacks both rows
    let mut behind = 0usize; // store has both rows, checkpoint silent
    for (model, questions) in &checkpoint.state().completed {
        for q in questions {
            if !store_tuples.contains(&(model.clone(), q.clone())) {
                ahead += 1;
            }
        }
    }
    for (model, question) in &store_tuples {
        if !checkpoint.is_completed(model, question) {
            behind += 1;
        }
    }

    Ok(if ahead == 0 && behind == 0 {
        ValidationResult::pass(
            "checkpoint-consistency",
            "checkpoint agrees with the result store",
        )
    } else {
        ValidationResult::fail(
            "checkpoint-consistency",
            "checkpoint agrees with the result store",
            Severity::Warning,
            format!(
                "{ahead} tuple(s) checkpointed without store rows, {behind} stored without checkpoint entries; will be reconciled at startup"
            ),
        )
    })
}

/// 10. Sufficient free disk space for the expected result volume. Warning only.
fn check_disk_space(config: &RunConfig, corpus: &Corpus) -> ValidationResult {
    let expected_rows = (config.models.len() * corpus.questions.len() * 2) as u64;
    let required = expected_rows * EST_ROW_BYTES;

    let probe_dir = nearest_existing_dir(&config.paths.results_csv);
    match fs4::available_space(&probe_dir) {
        Ok(available) if available >= required => {
            ValidationResult::pass("disk-space", "sufficient free disk space")
        }
        Ok(available) => ValidationResult::fail(
            "disk-space",
            "sufficient free disk space",
            Severity::Warning,
            format!("{available} bytes free, ~{required} needed"),
        ),
        Err(e) => ValidationResult::fail(
            "disk-space",
            "sufficient free disk space",
            Severity::Warning,
            format!("could not query free space: {e}"),
        ),
    }
}

/// Walk up from the results path until a directory that exists.
fn nearest_existing_dir(path: &Path) -> std::path::PathBuf {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir.exists() {
            return dir.to_path_buf();
        }
        current = dir.parent();
    }
    std::path::PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccbench_shared::manifest::ArchiveProtocol;
    use ccbench_shared::{
        AssemblyConfig, EndpointConfig, Engine, InferenceParams, ManifestEntry, ModelConfig,
        PromptConfig, Question, RunPaths, SiteInfo,
    };
    use wiremock::matchers::{method, path as wm_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(root: &Path, base_url: String) -> RunConfig {
        RunConfig {
            version: "1.0".into(),
            models: vec![ModelConfig {
                id: "test-model".into(),
                family: "qwen".into(),
                max_context: 8192,
            }],
            inference: InferenceParams {
                temperature: 0.0,
                seed: 42,
                top_p: 0.9,
                top_k: 40,
                repeat_penalty: 1.1,
                num_predict: 512,
                token_overhead: 128,
            },
            paths: RunPaths {
                questions: root.join("questions.json"),
                site_list: root.join("site-list.csv"),
                archive_dir: root.join("archive"),
                archive_manifest: root.join("archive/manifest.json"),
                token_counts: root.join("archive/token-counts.json"),
                results_csv: root.join("results/results.csv"),
                checkpoint: root.join("results/checkpoint.json"),
                log_dir: root.join("logs"),
                scoring_dir: root.join("scoring"),
            },
            prompt: PromptConfig {
                system: "s".into(),
                template: "{question} {content}".into(),
            },
            condition_order: vec![Condition::A, Condition::B],
            assembly: AssemblyConfig::default(),
            endpoint: EndpointConfig {
                base_url,
                engine: Engine::Ollama,
                request_timeout_secs: 5,
                retry_delay_secs: 0,
                warmup_prompts: 0,
            },
        }
    }

    fn write_inputs(root: &Path) {
        std::fs::create_dir_all(root.join("archive/html/S001")).unwrap();
        std::fs::create_dir_all(root.join("archive/markdown/S001")).unwrap();
        std::fs::write(root.join("questions.json"), "[]").unwrap();
        std::fs::write(
            root.join("site-list.csv"),
            "site_id,domain,llms_txt_url,html_docs_url\n",
        )
        .unwrap();
        std::fs::write(root.join("archive/manifest.json"), "{\"entries\":[]}").unwrap();
        std::fs::write(root.join("archive/token-counts.json"), "{}").unwrap();
        std::fs::write(root.join("archive/html/S001/page.html"), "<html>x</html>").unwrap();
    }

    fn corpus() -> Corpus {
        Corpus {
            questions: vec![Question {
                site_id: "S001".into(),
                question_id: "Q001".into(),
                question_text: "why?".into(),
                source_urls: vec!["https://docs.example.com/page".into()],
                complexity: String::new(),
            }],
        }
    }

    fn sites() -> SiteList {
        SiteList::from_sites([SiteInfo {
            site_id: "S001".into(),
            domain: "docs.example.com".into(),
            llms_txt_url: "https://docs.example.com/llms.txt".into(),
            html_docs_url: "https://docs.example.com".into(),
        }])
    }

    fn covering_manifest() -> ArchiveManifest {
        let base = ManifestEntry {
            site_id: "S001".into(),
            url: "https://docs.example.com/page".into(),
            url_hash: "0".repeat(16),
            condition: Condition::A,
            fetch_timestamp: String::new(),
            http_status: 200,
            content_type: String::new(),
            content_length_bytes: 0,
            last_modified: None,
            etag: None,
            fetch_status: FetchStatus::Success,
            failure_reason: None,
            html_path: Some("S001/page.html".into()),
            markdown_path: None,
            llmstxt_section: None,
        };
        ArchiveManifest::from_entries(
            String::new(),
            ArchiveProtocol::default(),
            vec![
                base.clone(),
                ManifestEntry {
                    url: "https://docs.example.com/page.md".into(),
                    condition: Condition::B,
                    fetch_status: FetchStatus::HttpError,
                    html_path: None,
                    markdown_path: None,
                    ..base
                },
            ],
        )
    }

    async fn healthy_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wm_path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{"name": "test-model"}]
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn all_checks_pass_on_complete_setup() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path());
        let server = healthy_server().await;
        let config = test_config(dir.path(), server.uri());
        let client = InferenceClient::new(config.endpoint.clone()).unwrap();

        let results = run_preflight(&config, &corpus(), &sites(), &covering_manifest(), &client)
            .await
            .unwrap();

        assert_eq!(results.len(), 10);
        assert!(
            !has_fatal_failure(&results),
            "unexpected failures: {:?}",
            results.iter().filter(|r| !r.passed).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn missing_input_path_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path());
        std::fs::remove_file(dir.path().join("archive/token-counts.json")).unwrap();
        let server = healthy_server().await;
        let config = test_config(dir.path(), server.uri());
        let client = InferenceClient::new(config.endpoint.clone()).unwrap();

        let results = run_preflight(&config, &corpus(), &sites(), &covering_manifest(), &client)
            .await
            .unwrap();

        let paths = results.iter().find(|r| r.check_id == "paths-exist").unwrap();
        assert!(!paths.passed);
        assert!(paths.detail.contains("token_counts"));
        assert!(has_fatal_failure(&results));
    }

    #[tokio::test]
    async fn uncovered_source_url_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path());
        let server = healthy_server().await;
        let config = test_config(dir.path(), server.uri());
        let client = InferenceClient::new(config.endpoint.clone()).unwrap();

        let empty = ArchiveManifest::from_entries(
            String::new(),
            ArchiveProtocol::default(),
            vec![],
        );
        let results = run_preflight(&config, &corpus(), &sites(), &empty, &client)
            .await
            .unwrap();

        let coverage = results
            .iter()
            .find(|r| r.check_id == "manifest-coverage")
            .unwrap();
        assert!(!coverage.passed);
        assert_eq!(coverage.severity, Severity::Fatal);
    }

    #[tokio::test]
    async fn empty_backing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path());
        std::fs::write(dir.path().join("archive/html/S001/page.html"), "").unwrap();
        let server = healthy_server().await;
        let config = test_config(dir.path(), server.uri());
        let client = InferenceClient::new(config.endpoint.clone()).unwrap();

        let results = run_preflight(&config, &corpus(), &sites(), &covering_manifest(), &client)
            .await
            .unwrap();

        let archive = results.iter().find(|r| r.check_id == "archive-files").unwrap();
        assert!(!archive.passed);
        assert!(archive.detail.contains("backing file empty"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_fatal_but_model_listing_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path());
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());
        drop(listener);

        let config = test_config(dir.path(), dead_url);
        let client = InferenceClient::new(config.endpoint.clone()).unwrap();

        let results = run_preflight(&config, &corpus(), &sites(), &covering_manifest(), &client)
            .await
            .unwrap();

        let health = results
            .iter()
            .find(|r| r.check_id == "endpoint-health")
            .unwrap();
        assert!(!health.passed);
        assert_eq!(health.severity, Severity::Fatal);

        let models = results
            .iter()
            .find(|r| r.check_id == "models-available")
            .unwrap();
        assert!(!models.passed);
        assert_eq!(models.severity, Severity::Warning);
    }

    #[tokio::test]
    async fn checkpoint_version_mismatch_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path());
        let server = healthy_server().await;
        let config = test_config(dir.path(), server.uri());
        let client = InferenceClient::new(config.endpoint.clone()).unwrap();

        let mut old = CheckpointManager::new(&config.paths.checkpoint, "0.9");
        old.flush().unwrap();

        let results = run_preflight(&config, &corpus(), &sites(), &covering_manifest(), &client)
            .await
            .unwrap();

        let version = results
            .iter()
            .find(|r| r.check_id == "checkpoint-version")
            .unwrap();
        assert!(!version.passed);
        assert_eq!(version.severity, Severity::Warning);
        assert!(!has_fatal_failure(&results));
    }
}
