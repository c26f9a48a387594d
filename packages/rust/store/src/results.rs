//! Append-only CSV result store.
//!
//! Fixed 17-column schema, UTF-8 with BOM, LF line endings, every field
//! quoted. The header is written exactly once, when the file is created;
//! every row is flushed immediately on write — losing one in-flight row in a
//! crash is acceptable, silent buffering is not. Rows are never edited; the
//! only rewrite operation is [`ResultWriter::remove_tuple`], used at startup
//! to discard the half-written tuple a crash can leave behind.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use csv::{QuoteStyle, StringRecord, Terminator, WriterBuilder};
use tracing::{debug, info};

use ccbench_shared::{CcbenchError, Condition, Result};

/// UTF-8 byte-order mark written at the start of a fresh result file.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// The canonical column order. Changing this breaks every downstream
/// consumer of collected datasets; it is append-only by policy.
pub const RESULT_COLUMNS: [&str; 17] = [
    "site_id",
    "question_id",
    "model",
    "condition",
    "input_tokens",
    "reference_tokens",
    "output_tokens",
    "content_bytes",
    "response_text",
    "inference_engine",
    "elapsed_seconds",
    "exclusion_reason",
    "scoring_notes",
    "score_accuracy",
    "score_completeness",
    "score_groundedness",
    "score_citation",
];

// Column indices used by the read-side utilities.
const COL_QUESTION: usize = 1;
const COL_MODEL: usize = 2;
const COL_CONDITION: usize = 3;

// ---------------------------------------------------------------------------
// ResultRow
// ---------------------------------------------------------------------------

/// One result row. The four scoring columns are always written empty; they
/// are filled by the separate human scoring pass and never touched here.
#[derive(Debug, Clone, Default)]
pub struct ResultRow {
    pub site_id: String,
    pub question_id: String,
    pub model: String,
    pub condition: String,
    pub input_tokens: u64,
    pub reference_tokens: u64,
    pub output_tokens: u64,
    pub content_bytes: u64,
    pub response_text: String,
    pub inference_engine: String,
    pub elapsed_seconds: f64,
    pub exclusion_reason: String,
    pub scoring_notes: String,
}

impl ResultRow {
    fn to_record(&self) -> [String; 17] {
        [
            self.site_id.clone(),
            self.question_id.clone(),
            self.model.clone(),
            self.condition.clone(),
            self.input_tokens.to_string(),
            self.reference_tokens.to_string(),
            self.output_tokens.to_string(),
            self.content_bytes.to_string(),
            self.response_text.clone(),
            self.inference_engine.clone(),
            format!("{:.3}", self.elapsed_seconds),
            self.exclusion_reason.clone(),
            self.scoring_notes.clone(),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
        ]
    }
}

/// Identity + failure columns of one stored row, for status reporting.
#[derive(Debug, Clone)]
pub struct RowSummary {
    pub site_id: String,
    pub question_id: String,
    pub model: String,
    pub condition: String,
    pub exclusion_reason: String,
}

// ---------------------------------------------------------------------------
// ResultWriter
// ---------------------------------------------------------------------------

/// The single writer for the result file.
pub struct ResultWriter {
    writer: csv::Writer<std::fs::File>,
}

impl ResultWriter {
    /// Open the result file for appending, creating it with BOM + header if
    /// it does not exist (or exists empty).
    pub fn open(path: &Path) -> Result<ResultWriter> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CcbenchError::io(parent, e))?;
        }

        let fresh = match std::fs::metadata(path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CcbenchError::io(path, e))?;

        if fresh {
            file.write_all(UTF8_BOM)
                .map_err(|e| CcbenchError::io(path, e))?;
        }

        let mut writer = csv_writer(file);

        if fresh {
            writer
                .write_record(RESULT_COLUMNS)
                .map_err(|e| CcbenchError::store(format!("write header: {e}")))?;
            writer
                .flush()
                .map_err(|e| CcbenchError::store(format!("flush header: {e}")))?;
            info!(path = %path.display(), "created result file");
        } else {
            debug!(path = %path.display(), "appending to existing result file");
        }

        Ok(ResultWriter { writer })
    }

    /// Append one row and flush it to disk immediately.
    pub fn append(&mut self, row: &ResultRow) -> Result<()> {
        self.writer
            .write_record(row.to_record())
            .map_err(|e| CcbenchError::store(format!("write row: {e}")))?;
        self.writer
            .flush()
            .map_err(|e| CcbenchError::store(format!("flush row: {e}")))?;
        Ok(())
    }

    // -- read-side utilities (path-based: used before the writer is open) --

    /// (model, question) pairs for which **both** condition rows exist.
    /// This is the ground truth the resume logic cross-validates against.
    pub fn completed_tuples(path: &Path) -> Result<HashSet<(String, String)>> {
        let mut conditions: HashMap<(String, String), HashSet<String>> = HashMap::new();
        for record in read_records(path)? {
            let key = tuple_key(&record);
            conditions
                .entry(key)
                .or_default()
                .insert(record[COL_CONDITION].to_string());
        }

        Ok(conditions
            .into_iter()
            .filter(|(_, conds)| {
                conds.contains(Condition::A.as_str()) && conds.contains(Condition::B.as_str())
            })
            .map(|(key, _)| key)
            .collect())
    }

    /// (model, question) pairs with exactly one condition row — the signature
    /// of a crash between the first row write and the second.
    pub fn orphan_tuples(path: &Path) -> Result<Vec<(String, String)>> {
        let mut conditions: HashMap<(String, String), HashSet<String>> = HashMap::new();
        for record in read_records(path)? {
            let key = tuple_key(&record);
            conditions
                .entry(key)
                .or_default()
                .insert(record[COL_CONDITION].to_string());
        }

        let mut orphans: Vec<_> = conditions
            .into_iter()
            .filter(|(_, conds)| conds.len() == 1)
            .map(|(key, _)| key)
            .collect();
        orphans.sort();
        Ok(orphans)
    }

    /// Rewrite the file without any rows for `(model, question)`, preserving
    /// BOM, header, and every other row. Temp-file-then-rename so a crash
    /// mid-rewrite leaves the original intact.
    pub fn remove_tuple(path: &Path, model: &str, question: &str) -> Result<usize> {
        let records = read_records(path)?;
        let tmp_path = path.with_extension("csv.tmp");

        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| CcbenchError::io(&tmp_path, e))?;
        file.write_all(UTF8_BOM)
            .map_err(|e| CcbenchError::io(&tmp_path, e))?;

        let mut writer = csv_writer(file);
        writer
            .write_record(RESULT_COLUMNS)
            .map_err(|e| CcbenchError::store(format!("write header: {e}")))?;

        let mut removed = 0usize;
        for record in &records {
            if &record[COL_MODEL] == model && &record[COL_QUESTION] == question {
                removed += 1;
                continue;
            }
            writer
                .write_record(record)
                .map_err(|e| CcbenchError::store(format!("write row: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| CcbenchError::store(format!("flush rewrite: {e}")))?;
        drop(writer);

        std::fs::rename(&tmp_path, path).map_err(|e| CcbenchError::io(path, e))?;

        info!(model, question, removed, "removed tuple rows from result file");
        Ok(removed)
    }

    /// Identity/failure columns of every stored row, for status reporting.
    pub fn read_summaries(path: &Path) -> Result<Vec<RowSummary>> {
        Ok(read_records(path)?
            .iter()
            .map(|r| RowSummary {
                site_id: r[0].to_string(),
                question_id: r[COL_QUESTION].to_string(),
                model: r[COL_MODEL].to_string(),
                condition: r[COL_CONDITION].to_string(),
                exclusion_reason: r[11].to_string(),
            })
            .collect())
    }
}

fn csv_writer(file: std::fs::File) -> csv::Writer<std::fs::File> {
    WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .terminator(Terminator::Any(b'\n'))
        .has_headers(false)
        .from_writer(file)
}

/// All data records (header skipped). A missing file reads as empty.
fn read_records(path: &Path) -> Result<Vec<StringRecord>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CcbenchError::io(path, e)),
    };
    let content = content.strip_prefix('\u{feff}').unwrap_or(&content);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(content.as_bytes());

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| CcbenchError::store(format!("read row: {e}")))?;
        records.push(record);
    }
    Ok(records)
}

fn tuple_key(record: &StringRecord) -> (String, String) {
    (
        record[COL_MODEL].to_string(),
        record[COL_QUESTION].to_string(),
    )
}
