//! Core domain enums shared across the workspace.

use serde::{Deserialize, Serialize};

/// The two content-presentation conditions compared per question.
///
/// Condition A feeds the model readability-extracted text from archived HTML
/// pages; Condition B feeds it the curated Markdown context assembled from the
/// site's llms.txt structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Condition {
    /// Raw extraction: archived HTML → readability-style text.
    A,
    /// Curated structure: archived Markdown grouped by llms.txt section.
    B,
}

/// The fixed order in which conditions are run and written for every tuple.
pub const CANONICAL_CONDITION_ORDER: [Condition; 2] = [Condition::A, Condition::B];

impl Condition {
    /// Stable single-letter tag used in the manifest, result rows, and token keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            other => Err(format!("unknown condition '{other}', expected 'A' or 'B'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_roundtrip() {
        for c in CANONICAL_CONDITION_ORDER {
            let parsed: Condition = c.as_str().parse().expect("parse condition");
            assert_eq!(parsed, c);
        }
        assert!("C".parse::<Condition>().is_err());
    }

    #[test]
    fn condition_serializes_as_bare_letter() {
        assert_eq!(serde_json::to_string(&Condition::A).unwrap(), "\"A\"");
        let parsed: Condition = serde_json::from_str("\"B\"").unwrap();
        assert_eq!(parsed, Condition::B);
    }
}
