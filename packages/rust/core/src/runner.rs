//! The orchestration loop: model → question → condition.
//!
//! Everything is strictly sequential — one model loaded at a time, one
//! question at a time, one condition at a time, one outstanding request at a
//! time — because local inference throughput is bound by a single shared
//! compute resource. Per-tuple state machine:
//! `NotAssembled → {Excluded | Assembled} → {InferenceSuccess | InferenceError} → RowWritten`;
//! a question is checkpointed only after both condition rows are on disk.
//!
//! Startup repairs the aftermath of a crash: orphaned single-condition
//! tuples are purged from the result file, then the checkpoint is
//! cross-validated against the store's ground truth.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use ccbench_shared::{
    ArchiveManifest, Corpus, ModelConfig, Question, Result, RunConfig, SiteList, TokenCountTable,
};
use ccbench_store::{CheckpointManager, ResultRow, ResultWriter};

use crate::assembler::{AssembledContent, AssemblyOutcome, ContentAssembler, ReadyContent};
use crate::inference::{InferenceClient, InferenceOutcome, InferenceRequest, SendOutcome};
use crate::operator::{Operator, OperatorDecision};

/// Throwaway prompt used to warm (and load) each model.
const WARMUP_PROMPT: &str = "Respond with the single word: ready.";

/// Context-window hint for warmup requests.
const WARMUP_NUM_CTX: u64 = 2048;

/// Log throughput/ETA every this many completed questions.
const ETA_LOG_INTERVAL: usize = 5;

// ---------------------------------------------------------------------------
// Outcome & summary
// ---------------------------------------------------------------------------

/// How the run ended. The CLI maps each to a distinct exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every model/question tuple is accounted for.
    Completed,
    /// The endpoint went down and the operator chose not to resume.
    EndpointUnreachable,
    /// Cooperative cancellation (Ctrl-C) or operator abort.
    Cancelled,
}

/// End-of-run accounting, also used for the periodic summary log.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub rows_written: usize,
    pub exclusions: usize,
    pub inference_errors: usize,
    pub questions_completed: usize,
    /// Failure tag → occurrence count (exclusion reasons and error codes).
    pub failure_tally: BTreeMap<String, usize>,
    pub elapsed: Duration,
}

impl RunSummary {
    fn tally(&mut self, tag: &str) {
        *self.failure_tally.entry(tag.to_string()).or_default() += 1;
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for the CLI; the orchestrator stays UI-free.
pub trait ProgressReporter {
    /// A model's question loop is starting.
    fn model_started(&self, model: &str, index: usize, total: usize);
    /// A question was fully written and checkpointed.
    fn question_done(&self, model: &str, question: &str, current: usize, total: usize);
    /// The run ended.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn model_started(&self, _model: &str, _index: usize, _total: usize) {}
    fn question_done(&self, _model: &str, _question: &str, _current: usize, _total: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

enum Step {
    Written,
    Cancelled,
    EndpointDown,
}

enum Warmup {
    Ready,
    SkipModel,
    Cancelled,
    EndpointDown,
}

/// Drives the whole run. Owns the inference client and checkpoint; borrows
/// the immutable run inputs.
pub struct Orchestrator<'a> {
    config: &'a RunConfig,
    corpus: &'a Corpus,
    assembler: ContentAssembler<'a>,
    client: InferenceClient,
    checkpoint: CheckpointManager,
    operator: &'a dyn Operator,
    progress: &'a dyn ProgressReporter,
    cancel: CancellationToken,
    summary: RunSummary,
}

impl<'a> Orchestrator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a RunConfig,
        corpus: &'a Corpus,
        sites: &'a SiteList,
        manifest: &'a ArchiveManifest,
        tokens: &'a TokenCountTable,
        client: InferenceClient,
        checkpoint: CheckpointManager,
        operator: &'a dyn Operator,
        progress: &'a dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> Orchestrator<'a> {
        Orchestrator {
            config,
            corpus,
            assembler: ContentAssembler::new(config, sites, manifest, tokens),
            client,
            checkpoint,
            operator,
            progress,
            cancel,
            summary: RunSummary::default(),
        }
    }

    /// Run the full matrix. Per-tuple failures never abort the batch; only
    /// cancellation and an unrecovered endpoint stop it early.
    #[instrument(skip_all)]
    pub async fn run(mut self) -> Result<(RunOutcome, RunSummary)> {
        let started = Instant::now();
        let results_path = self.config.paths.results_csv.clone();

        // --- startup repair: purge half-written tuples, reconcile ---
        for (model, question) in ResultWriter::orphan_tuples(&results_path)? {
            warn!(%model, %question, "discarding half-written tuple left by a crash");
            ResultWriter::remove_tuple(&results_path, &model, &question)?;
        }
        self.checkpoint.try_load_existing()?;
        let store_tuples = ResultWriter::completed_tuples(&results_path)?;
        self.checkpoint.cross_validate(&store_tuples)?;

        let mut writer = ResultWriter::open(&results_path)?;

        let total_questions = self.corpus.questions.len();
        let work_total = self.pending_question_count();
        info!(
            models = self.config.models.len(),
            questions = total_questions,
            pending = work_total,
            "starting benchmark run"
        );

        let model_count = self.config.models.len();
        for index in 0..model_count {
            let model = self.config.models[index].clone();

            if self.cancel.is_cancelled() {
                return self.finish(RunOutcome::Cancelled, started);
            }

            self.checkpoint.set_current_model_index(index)?;
            self.progress.model_started(&model.id, index, model_count);
            info!(model = %model.id, index, "starting model");

            match self.warm_model(&model).await? {
                Warmup::Ready => {}
                Warmup::SkipModel => {
                    warn!(model = %model.id, "skipping model by operator decision");
                    continue;
                }
                Warmup::Cancelled => return self.finish(RunOutcome::Cancelled, started),
                Warmup::EndpointDown => {
                    return self.finish(RunOutcome::EndpointUnreachable, started);
                }
            }

            for qi in 0..total_questions {
                let question = self.corpus.questions[qi].clone();

                if self.cancel.is_cancelled() {
                    return self.finish(RunOutcome::Cancelled, started);
                }
                if self.checkpoint.is_completed(&model.id, &question.question_id) {
                    debug!(model = %model.id, question = %question.question_id, "already complete, skipping");
                    continue;
                }

                // Assemble both conditions before the first inference call.
                let order = self.config.condition_order.clone();
                let assembled: Vec<AssembledContent> = order
                    .iter()
                    .map(|&c| self.assembler.assemble(&question, &model, c))
                    .collect();

                for content in &assembled {
                    loop {
                        match self
                            .run_condition(&model, &question, content, &mut writer)
                            .await?
                        {
                            Step::Written => break,
                            Step::Cancelled => {
                                return self.finish(RunOutcome::Cancelled, started);
                            }
                            Step::EndpointDown => {
                                self.checkpoint.flush()?;
                                error!(
                                    "inference endpoint is down after repeated connection refusals"
                                );
                                match self.operator.ask(
                                    "Inference endpoint is unreachable. Resume after intervention?",
                                ) {
                                    OperatorDecision::Proceed => {
                                        self.client.reset_health();
                                        info!("operator resumed the run");
                                    }
                                    OperatorDecision::Skip | OperatorDecision::Abort => {
                                        return self
                                            .finish(RunOutcome::EndpointUnreachable, started);
                                    }
                                }
                            }
                        }
                    }
                }

                // Both condition rows are on disk — only now is the tuple done.
                self.checkpoint
                    .mark_completed(&model.id, &question.question_id)?;
                self.summary.questions_completed += 1;
                self.progress
                    .question_done(&model.id, &question.question_id, qi + 1, total_questions);
                self.log_eta(started, work_total);
            }
        }

        self.checkpoint.flush()?;
        self.finish(RunOutcome::Completed, started)
    }

    /// Questions not yet checkpointed, across all models.
    fn pending_question_count(&self) -> usize {
        self.config
            .models
            .iter()
            .map(|m| {
                self.corpus
                    .questions
                    .iter()
                    .filter(|q| !self.checkpoint.is_completed(&m.id, &q.question_id))
                    .count()
            })
            .sum()
    }

    /// Run one condition to a written row (or signal a pause/stop).
    async fn run_condition(
        &mut self,
        model: &ModelConfig,
        question: &Question,
        content: &AssembledContent,
        writer: &mut ResultWriter,
    ) -> Result<Step> {
        match &content.outcome {
            AssemblyOutcome::Excluded { reason, note } => {
                info!(
                    model = %model.id,
                    question = %question.question_id,
                    condition = %content.condition,
                    reason = reason.as_str(),
                    "condition excluded, writing exclusion row"
                );
                writer.append(&self.exclusion_row(model, question, content, reason.as_str(), note))?;
                self.summary.rows_written += 1;
                self.summary.exclusions += 1;
                self.summary.tally(reason.as_str());
                Ok(Step::Written)
            }
            AssemblyOutcome::Ready(ready) => {
                let request = InferenceRequest {
                    model: &model.id,
                    system: &self.config.prompt.system,
                    user: &ready.prompt,
                    params: &self.config.inference,
                    num_ctx: ready.num_ctx,
                };

                match self.client.send(&request, &self.cancel).await {
                    SendOutcome::Cancelled => {
                        // Abandoned in flight: no row, flush, clean exit.
                        Ok(Step::Cancelled)
                    }
                    SendOutcome::Completed(result) => {
                        if matches!(result.outcome, InferenceOutcome::ConnectionRefused)
                            && self.client.is_down()
                        {
                            // Don't record the refused attempt as data — the
                            // tuple is retried after operator intervention,
                            // never silently dropped.
                            return Ok(Step::EndpointDown);
                        }

                        let row = self.result_row(model, question, content, ready, &result);
                        writer.append(&row)?;
                        self.summary.rows_written += 1;
                        if let Some(code) = result.outcome.error_code() {
                            warn!(
                                model = %model.id,
                                question = %question.question_id,
                                condition = %content.condition,
                                code = %code,
                                "inference error recorded as data"
                            );
                            self.summary.inference_errors += 1;
                            self.summary.tally(&code);
                        }
                        Ok(Step::Written)
                    }
                }
            }
        }
    }

    /// Warm a model with N throwaway prompts. Doubles as the load trigger:
    /// a model-not-loaded response (404 on ollama, 503 on llama-server)
    /// blocks for an operator decision to load-and-retry or skip.
    async fn warm_model(&mut self, model: &ModelConfig) -> Result<Warmup> {
        let target = self.config.endpoint.warmup_prompts;
        let mut completed = 0u32;

        while completed < target {
            if self.cancel.is_cancelled() {
                return Ok(Warmup::Cancelled);
            }

            let request = InferenceRequest {
                model: &model.id,
                system: &self.config.prompt.system,
                user: WARMUP_PROMPT,
                params: &self.config.inference,
                num_ctx: WARMUP_NUM_CTX.min(model.max_context),
            };

            match self.client.send(&request, &self.cancel).await {
                SendOutcome::Cancelled => return Ok(Warmup::Cancelled),
                SendOutcome::Completed(result) => match result.outcome {
                    InferenceOutcome::Success { .. } => {
                        debug!(model = %model.id, warmup = completed + 1, "warmup prompt done");
                        completed += 1;
                    }
                    InferenceOutcome::HttpError(status @ (404 | 503)) => {
                        warn!(model = %model.id, status, "model not loaded at endpoint");
                        match self.operator.ask(&format!(
                            "Model '{}' is not loaded at the endpoint. Load it, then retry?",
                            model.id
                        )) {
                            OperatorDecision::Proceed => {
                                let delay =
                                    Duration::from_secs(self.config.endpoint.retry_delay_secs);
                                tokio::select! {
                                    biased;
                                    _ = self.cancel.cancelled() => return Ok(Warmup::Cancelled),
                                    _ = tokio::time::sleep(delay) => {}
                                }
                            }
                            OperatorDecision::Skip => return Ok(Warmup::SkipModel),
                            OperatorDecision::Abort => return Ok(Warmup::Cancelled),
                        }
                    }
                    InferenceOutcome::ConnectionRefused if self.client.is_down() => {
                        self.checkpoint.flush()?;
                        error!("inference endpoint is down during warmup");
                        match self
                            .operator
                            .ask("Inference endpoint is unreachable. Resume after intervention?")
                        {
                            OperatorDecision::Proceed => self.client.reset_health(),
                            OperatorDecision::Skip | OperatorDecision::Abort => {
                                return Ok(Warmup::EndpointDown);
                            }
                        }
                    }
                    other => {
                        // Warmup failures other than the two above don't
                        // block the run; real requests will classify them.
                        warn!(model = %model.id, outcome = ?other.error_code(), "warmup request failed, proceeding");
                        completed += 1;
                    }
                },
            }
        }

        Ok(Warmup::Ready)
    }

    fn exclusion_row(
        &self,
        model: &ModelConfig,
        question: &Question,
        content: &AssembledContent,
        reason: &str,
        note: &str,
    ) -> ResultRow {
        ResultRow {
            site_id: question.site_id.clone(),
            question_id: question.question_id.clone(),
            model: model.id.clone(),
            condition: content.condition.to_string(),
            inference_engine: self.config.endpoint.engine.as_str().to_string(),
            exclusion_reason: reason.to_string(),
            scoring_notes: note.to_string(),
            ..ResultRow::default()
        }
    }

    fn result_row(
        &self,
        model: &ModelConfig,
        question: &Question,
        content: &AssembledContent,
        ready: &ReadyContent,
        result: &crate::inference::InferenceResult,
    ) -> ResultRow {
        let mut notes: Vec<String> = Vec::new();
        if !ready.notes.is_empty() {
            notes.push(ready.notes.clone());
        }

        let (response_text, output_tokens, exclusion_reason) = match &result.outcome {
            InferenceOutcome::Success {
                text,
                output_tokens,
            } => {
                if *output_tokens >= self.config.inference.num_predict {
                    notes.push(format!(
                        "output saturated the {}-token cap; response likely truncated",
                        self.config.inference.num_predict
                    ));
                }
                (text.clone(), *output_tokens, String::new())
            }
            other => (
                String::new(),
                0,
                other.error_code().unwrap_or_default(),
            ),
        };

        ResultRow {
            site_id: question.site_id.clone(),
            question_id: question.question_id.clone(),
            model: model.id.clone(),
            condition: content.condition.to_string(),
            input_tokens: ready.input_tokens,
            reference_tokens: ready.reference_tokens,
            output_tokens,
            content_bytes: ready.content_bytes,
            response_text,
            inference_engine: self.config.endpoint.engine.as_str().to_string(),
            elapsed_seconds: result.elapsed.as_secs_f64(),
            exclusion_reason,
            scoring_notes: notes.join("; "),
        }
    }

    fn log_eta(&self, started: Instant, work_total: usize) {
        let done = self.summary.questions_completed;
        if done == 0 || done % ETA_LOG_INTERVAL != 0 {
            return;
        }
        let elapsed = started.elapsed().as_secs_f64();
        let per_question = elapsed / done as f64;
        let remaining = work_total.saturating_sub(done);
        info!(
            questions_done = done,
            questions_remaining = remaining,
            throughput_per_min = format!("{:.2}", 60.0 / per_question),
            eta_min = format!("{:.1}", per_question * remaining as f64 / 60.0),
            "progress"
        );
    }

    fn finish(
        mut self,
        outcome: RunOutcome,
        started: Instant,
    ) -> Result<(RunOutcome, RunSummary)> {
        // Flush is unconditional: cancellation and pauses must never lose
        // checkpoint state.
        self.checkpoint.flush()?;
        self.summary.elapsed = started.elapsed();

        info!(
            ?outcome,
            rows_written = self.summary.rows_written,
            exclusions = self.summary.exclusions,
            inference_errors = self.summary.inference_errors,
            elapsed_secs = self.summary.elapsed.as_secs(),
            "run finished"
        );
        if !self.summary.failure_tally.is_empty() {
            for (tag, count) in &self.summary.failure_tally {
                info!(tag = %tag, count = *count, "failure tally");
            }
        }

        self.progress.done(&self.summary);
        Ok((outcome, self.summary))
    }
}
