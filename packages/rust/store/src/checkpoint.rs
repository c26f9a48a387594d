//! Checkpoint persistence for resumable runs.
//!
//! The checkpoint records which (model, question) tuples are fully done —
//! a question id appears under a model **only if** both condition rows for
//! that tuple exist in the result store. That single invariant is what the
//! resume logic depends on, and [`CheckpointManager::cross_validate`]
//! re-establishes it against the store's ground truth at startup.
//!
//! Persistence is write-to-temp-file-then-atomic-rename. A crash between
//! "write" and "rename" leaves the old checkpoint intact; this sequence is
//! the load-bearing crash-safety mechanism and must not be replaced with
//! in-place writes.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ccbench_shared::{CcbenchError, Result};

/// The persisted checkpoint structure (`checkpoint.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Config version the run was started under.
    pub config_version: String,
    /// RFC 3339 timestamp of the first run.
    pub started_at: String,
    /// RFC 3339 timestamp of the last persist.
    pub updated_at: String,
    /// Index into the config's model list of the model currently running.
    pub current_model_index: usize,
    /// model id → fully-completed question ids. BTree containers keep the
    /// serialized form sorted and diff-friendly.
    pub completed: BTreeMap<String, BTreeSet<String>>,
}

/// Owner of the checkpoint file. The orchestrator is the only caller.
pub struct CheckpointManager {
    path: PathBuf,
    state: CheckpointState,
}

impl CheckpointManager {
    /// Create a manager with a fresh in-memory state. Nothing is persisted
    /// until the first mutation or [`flush`](Self::flush).
    pub fn new(path: impl Into<PathBuf>, config_version: &str) -> CheckpointManager {
        let now = Utc::now().to_rfc3339();
        CheckpointManager {
            path: path.into(),
            state: CheckpointState {
                config_version: config_version.to_string(),
                started_at: now.clone(),
                updated_at: now,
                current_model_index: 0,
                completed: BTreeMap::new(),
            },
        }
    }

    /// Load an existing checkpoint file if present. Returns `true` when one
    /// was loaded. A config-version mismatch warns but proceeds — whether
    /// stale results are comparable is the operator's call.
    pub fn try_load_existing(&mut self) -> Result<bool> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no existing checkpoint");
                return Ok(false);
            }
            Err(e) => return Err(CcbenchError::io(&self.path, e)),
        };

        let loaded: CheckpointState = serde_json::from_str(&content).map_err(|e| {
            CcbenchError::parse(format!(
                "failed to parse checkpoint {}: {e}",
                self.path.display()
            ))
        })?;

        if loaded.config_version != self.state.config_version {
            warn!(
                checkpoint_version = %loaded.config_version,
                config_version = %self.state.config_version,
                "checkpoint was written under a different config version"
            );
        }

        let tuples: usize = loaded.completed.values().map(|qs| qs.len()).sum();
        info!(
            path = %self.path.display(),
            models = loaded.completed.len(),
            tuples,
            "resumed from checkpoint"
        );

        // Keep the current config version: the resumed run continues under it.
        let config_version = std::mem::take(&mut self.state.config_version);
        self.state = CheckpointState {
            config_version,
            ..loaded
        };
        Ok(true)
    }

    /// The config version recorded in the loaded checkpoint file, if any.
    /// Used by preflight's version check before `try_load_existing` rewrites it.
    pub fn stored_config_version(path: &Path) -> Result<Option<String>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CcbenchError::io(path, e)),
        };
        let state: CheckpointState = serde_json::from_str(&content)
            .map_err(|e| CcbenchError::parse(format!("failed to parse checkpoint: {e}")))?;
        Ok(Some(state.config_version))
    }

    /// Whether both condition rows for `(model, question)` are already stored.
    pub fn is_completed(&self, model: &str, question: &str) -> bool {
        self.state
            .completed
            .get(model)
            .is_some_and(|qs| qs.contains(question))
    }

    /// Record a fully-written tuple and persist atomically.
    pub fn mark_completed(&mut self, model: &str, question: &str) -> Result<()> {
        self.state
            .completed
            .entry(model.to_string())
            .or_default()
            .insert(question.to_string());
        self.persist()
    }

    /// Record which model the orchestrator is on and persist.
    pub fn set_current_model_index(&mut self, index: usize) -> Result<()> {
        self.state.current_model_index = index;
        self.persist()
    }

    /// Force a persist — called on graceful shutdown and before operator pauses.
    pub fn flush(&mut self) -> Result<()> {
        self.persist()
    }

    /// Reconcile against the result store's ground truth.
    ///
    /// Tuples the checkpoint claims complete but the store lacks signal a
    /// crash between the last row write and the checkpoint update: they are
    /// warned about and dropped, so `is_completed` reflects store truth.
    /// Tuples present in the store but missing here are silently added —
    /// the store is authoritative.
    pub fn cross_validate(
        &mut self,
        store_tuples: &HashSet<(String, String)>,
    ) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        let mut changed = false;

        for (model, questions) in &mut self.state.completed {
            let stale: Vec<String> = questions
                .iter()
                .filter(|q| !store_tuples.contains(&(model.clone(), (*q).clone())))
                .cloned()
                .collect();
            for q in stale {
                warnings.push(format!(
                    "checkpoint claims {model}/{q} complete but the result store lacks both rows"
                ));
                questions.remove(&q);
                changed = true;
            }
        }

        for (model, question) in store_tuples {
            let questions = self.state.completed.entry(model.clone()).or_default();
            if questions.insert(question.clone()) {
                debug!(%model, %question, "adopted completed tuple from result store");
                changed = true;
            }
        }

        self.state.completed.retain(|_, qs| !qs.is_empty());

        for w in &warnings {
            warn!("{w}");
        }
        if changed {
            self.persist()?;
        }
        Ok(warnings)
    }

    /// Drop a model's completion set entirely (explicit forced re-run).
    /// Returns whether the model had any entries.
    pub fn remove_model(&mut self, model: &str) -> Result<bool> {
        let removed = self.state.completed.remove(model).is_some();
        if removed {
            info!(model, "removed model from checkpoint");
            self.persist()?;
        }
        Ok(removed)
    }

    /// Read-only view of the current state.
    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    /// Write-to-temp-then-rename. The temp file lives in the same directory
    /// as the target so the rename stays on one filesystem.
    fn persist(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now().to_rfc3339();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CcbenchError::io(parent, e))?;
        }

        let json = serde_json::to_string_pretty(&self.state)
            .map_err(|e| CcbenchError::store(format!("serialize checkpoint: {e}")))?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|e| CcbenchError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| CcbenchError::io(&self.path, e))?;

        Ok(())
    }
}
