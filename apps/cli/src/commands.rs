//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ccbench_core::{
    ConsoleOperator, InferenceClient, Operator, Orchestrator, ProgressReporter, RunOutcome,
    RunSummary, ScriptedOperator, has_fatal_failure, run_preflight,
};
use ccbench_core::preflight::log_results;
use ccbench_shared::{ArchiveManifest, Corpus, RunConfig, SiteList, TokenCountTable};
use ccbench_store::{CheckpointManager, ResultWriter};

/// Exit code when the inference endpoint is unreachable.
const EXIT_ENDPOINT_UNREACHABLE: i32 = 2;

/// Exit code on operator/Ctrl-C cancellation.
const EXIT_CANCELLED: i32 = 130;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ccbench — run the context-collapse benchmark matrix.
#[derive(Parser)]
#[command(
    name = "ccbench",
    version,
    about = "Resumable benchmark runner: sites x questions x models x two content conditions.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the benchmark (resumes from the checkpoint automatically).
    Run {
        /// Path to benchmark-config.json.
        #[arg(short, long, default_value = "benchmark-config.json")]
        config: PathBuf,

        /// Never block for operator input: skip unloaded models, stop on a
        /// downed endpoint.
        #[arg(long)]
        non_interactive: bool,
    },

    /// Run the ten preflight checks and exit without any inference.
    Preflight {
        /// Path to benchmark-config.json.
        #[arg(short, long, default_value = "benchmark-config.json")]
        config: PathBuf,
    },

    /// Summarize checkpoint and result-store progress.
    Status {
        /// Path to benchmark-config.json.
        #[arg(short, long, default_value = "benchmark-config.json")]
        config: PathBuf,
    },

    /// Discard a model's checkpoint entries and result rows for a forced re-run.
    ResetModel {
        /// Path to benchmark-config.json.
        #[arg(short, long, default_value = "benchmark-config.json")]
        config: PathBuf,

        /// Model id to reset.
        model: String,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            config,
            non_interactive,
        } => cmd_run(&config, non_interactive).await,
        Command::Preflight { config } => cmd_preflight(&config).await,
        Command::Status { config } => cmd_status(&config).await,
        Command::ResetModel { config, model } => cmd_reset_model(&config, &model).await,
    }
}

/// Everything loaded from the config's input paths.
struct RunInputs {
    config: RunConfig,
    corpus: Corpus,
    sites: SiteList,
    manifest: ArchiveManifest,
    tokens: TokenCountTable,
}

fn load_inputs(config_path: &Path) -> Result<RunInputs> {
    let config = RunConfig::load(config_path)?;
    let corpus = Corpus::load(&config.paths.questions)?;
    let sites = SiteList::load(&config.paths.site_list)?;
    let manifest = ArchiveManifest::load(&config.paths.archive_manifest)?;
    let tokens = TokenCountTable::load(&config.paths.token_counts)?;

    info!(
        models = config.models.len(),
        questions = corpus.questions.len(),
        sites = sites.len(),
        manifest_entries = manifest.entries.len(),
        token_entries = tokens.len(),
        "inputs loaded"
    );

    Ok(RunInputs {
        config,
        corpus,
        sites,
        manifest,
        tokens,
    })
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: &Path, non_interactive: bool) -> Result<()> {
    let inputs = load_inputs(config_path)?;

    let client = InferenceClient::new(inputs.config.endpoint.clone())?;

    // Preflight gates the run: any fatal failure aborts before the first
    // inference call.
    let checks = run_preflight(
        &inputs.config,
        &inputs.corpus,
        &inputs.sites,
        &inputs.manifest,
        &client,
    )
    .await?;
    log_results(&checks);
    if has_fatal_failure(&checks) {
        return Err(eyre!("preflight failed; fix the issues above and re-run"));
    }

    let checkpoint =
        CheckpointManager::new(&inputs.config.paths.checkpoint, &inputs.config.version);

    let console = ConsoleOperator;
    let headless = ScriptedOperator::headless();
    let operator: &dyn Operator = if non_interactive { &headless } else { &console };

    // Ctrl-C cancels cooperatively; the orchestrator flushes and exits clean.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested, finishing the in-flight step");
            signal_cancel.cancel();
        }
    });

    let reporter = CliProgress::new();
    let orchestrator = Orchestrator::new(
        &inputs.config,
        &inputs.corpus,
        &inputs.sites,
        &inputs.manifest,
        &inputs.tokens,
        client,
        checkpoint,
        operator,
        &reporter,
        cancel,
    );

    let (outcome, summary) = orchestrator.run().await?;
    print_summary(&summary);

    match outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::EndpointUnreachable => {
            eprintln!("endpoint unreachable — resume with the same command once it is back");
            std::process::exit(EXIT_ENDPOINT_UNREACHABLE);
        }
        RunOutcome::Cancelled => {
            eprintln!("cancelled — resume with the same command");
            std::process::exit(EXIT_CANCELLED);
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Run finished");
    println!("  Rows written:      {}", summary.rows_written);
    println!("  Questions done:    {}", summary.questions_completed);
    println!("  Exclusions:        {}", summary.exclusions);
    println!("  Inference errors:  {}", summary.inference_errors);
    println!("  Time:              {:.1}s", summary.elapsed.as_secs_f64());
    if !summary.failure_tally.is_empty() {
        println!("  Failures by type:");
        for (tag, count) in &summary.failure_tally {
            println!("    {tag:<24} {count}");
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// preflight
// ---------------------------------------------------------------------------

async fn cmd_preflight(config_path: &Path) -> Result<()> {
    let inputs = load_inputs(config_path)?;
    let client = InferenceClient::new(inputs.config.endpoint.clone())?;

    let checks = run_preflight(
        &inputs.config,
        &inputs.corpus,
        &inputs.sites,
        &inputs.manifest,
        &client,
    )
    .await?;

    println!();
    for check in &checks {
        let mark = if check.passed { "ok  " } else { "FAIL" };
        println!("  [{mark}] {:<24} {}", check.check_id, check.description);
        if !check.passed {
            println!("         {}", check.detail);
        }
    }
    println!();

    if has_fatal_failure(&checks) {
        Err(eyre!("preflight failed"))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(config_path: &Path) -> Result<()> {
    let inputs = load_inputs(config_path)?;
    let config = &inputs.config;

    let mut checkpoint = CheckpointManager::new(&config.paths.checkpoint, &config.version);
    let has_checkpoint = checkpoint.try_load_existing()?;
    let summaries = ResultWriter::read_summaries(&config.paths.results_csv)?;

    let total_questions = inputs.corpus.questions.len();

    println!();
    println!("  Config version:  {}", config.version);
    println!("  Result rows:     {}", summaries.len());
    if has_checkpoint {
        println!("  Run started:     {}", checkpoint.state().started_at);
        println!("  Last update:     {}", checkpoint.state().updated_at);
    } else {
        println!("  No checkpoint — run not started");
    }
    println!();

    let mut exclusions: BTreeMap<String, usize> = BTreeMap::new();
    for row in &summaries {
        if !row.exclusion_reason.is_empty() {
            *exclusions.entry(row.exclusion_reason.clone()).or_default() += 1;
        }
    }

    println!("  Model progress ({} questions each):", total_questions);
    for model in &config.models {
        let done = checkpoint
            .state()
            .completed
            .get(&model.id)
            .map(|qs| qs.len())
            .unwrap_or(0);
        let rows = summaries.iter().filter(|r| r.model == model.id).count();
        println!(
            "    {:<32} {done:>4}/{total_questions} complete, {rows} rows",
            model.id
        );
    }

    if !exclusions.is_empty() {
        println!();
        println!("  Exclusions/errors by type:");
        for (reason, count) in &exclusions {
            println!("    {reason:<24} {count}");
        }
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// reset-model
// ---------------------------------------------------------------------------

async fn cmd_reset_model(config_path: &Path, model: &str) -> Result<()> {
    let config = RunConfig::load(config_path)?;

    if config.model(model).is_none() {
        return Err(eyre!("model '{model}' is not in the configured model list"));
    }

    // Purge result rows first: the store is authoritative, so leaving rows
    // behind would just re-adopt the tuples at the next cross-validation.
    let questions: Vec<String> = ResultWriter::read_summaries(&config.paths.results_csv)?
        .into_iter()
        .filter(|r| r.model == model)
        .map(|r| r.question_id)
        .collect();
    let mut removed_rows = 0usize;
    for question in questions.iter().collect::<std::collections::BTreeSet<_>>() {
        removed_rows += ResultWriter::remove_tuple(&config.paths.results_csv, model, question)?;
    }

    let mut checkpoint = CheckpointManager::new(&config.paths.checkpoint, &config.version);
    checkpoint.try_load_existing()?;
    let had_entries = checkpoint.remove_model(model)?;

    println!(
        "  Reset '{model}': {removed_rows} result row(s) removed, checkpoint entries {}.",
        if had_entries { "cleared" } else { "absent" }
    );
    println!("  Re-run the benchmark to collect it again.");

    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("valid template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn model_started(&self, model: &str, index: usize, total: usize) {
        self.spinner
            .set_message(format!("Model [{}/{}] {model}", index + 1, total));
    }

    fn question_done(&self, model: &str, question: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("{model} [{current}/{total}] {question} done"));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
