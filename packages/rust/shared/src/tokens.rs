//! Precomputed token-count lookup table.
//!
//! Token counting is an offline concern: the archive pipeline tokenizes every
//! assembled (site, question, condition) input once per model family and
//! stores the counts in `token-counts.json`. The runner only looks them up —
//! it never tokenizes at runtime.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{CcbenchError, Result};
use crate::types::Condition;

/// Input/reference counts for one (site, question, condition, family) key.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenCounts {
    /// Tokens in the fully assembled prompt (template + content).
    pub input_tokens: u64,
    /// Tokens in the reference source content alone.
    #[serde(default)]
    pub reference_tokens: u64,
}

/// The token-count table, keyed `<site>|<question>|<condition>|<family>`.
#[derive(Debug, Clone, Default)]
pub struct TokenCountTable {
    counts: HashMap<String, TokenCounts>,
}

impl TokenCountTable {
    /// Load `token-counts.json`.
    pub fn load(path: &Path) -> Result<TokenCountTable> {
        let content = std::fs::read_to_string(path).map_err(|e| CcbenchError::io(path, e))?;

        let counts: HashMap<String, TokenCounts> = serde_json::from_str(&content)
            .map_err(|e| CcbenchError::parse(format!("failed to parse {}: {e}", path.display())))?;

        Ok(TokenCountTable { counts })
    }

    /// Build a table from entries directly (tests).
    pub fn from_entries(entries: impl IntoIterator<Item = (String, TokenCounts)>) -> Self {
        TokenCountTable {
            counts: entries.into_iter().collect(),
        }
    }

    /// Look up the counts for a tuple-condition under a model family.
    pub fn lookup(
        &self,
        site_id: &str,
        question_id: &str,
        condition: Condition,
        family: &str,
    ) -> Option<TokenCounts> {
        self.counts
            .get(&key(site_id, question_id, condition, family))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Canonical lookup key format.
pub fn key(site_id: &str, question_id: &str, condition: Condition, family: &str) -> String {
    format!("{site_id}|{question_id}|{condition}|{family}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_canonical_key() {
        let table = TokenCountTable::from_entries([(
            "S001|Q001|A|qwen".to_string(),
            TokenCounts {
                input_tokens: 4321,
                reference_tokens: 3900,
            },
        )]);

        let counts = table
            .lookup("S001", "Q001", Condition::A, "qwen")
            .expect("present");
        assert_eq!(counts.input_tokens, 4321);
        assert_eq!(counts.reference_tokens, 3900);

        assert!(table.lookup("S001", "Q001", Condition::B, "qwen").is_none());
        assert!(table.lookup("S001", "Q001", Condition::A, "llama").is_none());
    }

    #[test]
    fn table_parses_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token-counts.json");
        std::fs::write(
            &path,
            r#"{"S001|Q001|A|qwen": {"input_tokens": 10, "reference_tokens": 7},
                "S001|Q001|B|qwen": {"input_tokens": 12}}"#,
        )
        .unwrap();

        let table = TokenCountTable::load(&path).expect("load");
        assert_eq!(table.len(), 2);
        let b = table.lookup("S001", "Q001", Condition::B, "qwen").unwrap();
        assert_eq!(b.input_tokens, 12);
        assert_eq!(b.reference_tokens, 0);
    }
}
