//! Operator interaction.
//!
//! The run blocks for a human in exactly two places: a model the backend
//! reports as not loaded, and an endpoint that has gone down. Both go through
//! this injected capability so headless runs and tests can script the
//! answers instead of reading stdin.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{BufRead, Write};

use tracing::info;

/// Answer to an operator prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorDecision {
    /// Retry / continue.
    Proceed,
    /// Skip the current unit of work (model).
    Skip,
    /// Stop the run.
    Abort,
}

/// The injected operator-interaction capability.
pub trait Operator {
    fn ask(&self, prompt: &str) -> OperatorDecision;
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

/// Interactive stdin/stderr prompt for attended runs.
pub struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn ask(&self, prompt: &str) -> OperatorDecision {
        let stdin = std::io::stdin();
        loop {
            eprint!("{prompt} [y]es / [s]kip / [a]bort: ");
            let _ = std::io::stderr().flush();

            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
                // stdin closed: treat as abort rather than loop forever.
                return OperatorDecision::Abort;
            }
            match line.trim().to_lowercase().as_str() {
                "y" | "yes" => return OperatorDecision::Proceed,
                "s" | "skip" => return OperatorDecision::Skip,
                "a" | "abort" | "q" => return OperatorDecision::Abort,
                _ => continue,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted
// ---------------------------------------------------------------------------

/// Pre-scripted answers for headless execution and deterministic tests.
/// Consumes queued answers in order, then falls back to a fixed decision.
pub struct ScriptedOperator {
    answers: RefCell<VecDeque<OperatorDecision>>,
    fallback: OperatorDecision,
}

impl ScriptedOperator {
    pub fn new(
        answers: impl IntoIterator<Item = OperatorDecision>,
        fallback: OperatorDecision,
    ) -> ScriptedOperator {
        ScriptedOperator {
            answers: RefCell::new(answers.into_iter().collect()),
            fallback,
        }
    }

    /// Headless default: never retry, never block — skip models that need
    /// loading, abort on a downed endpoint.
    pub fn headless() -> ScriptedOperator {
        Self::new([], OperatorDecision::Skip)
    }
}

impl Operator for ScriptedOperator {
    fn ask(&self, prompt: &str) -> OperatorDecision {
        let decision = self
            .answers
            .borrow_mut()
            .pop_front()
            .unwrap_or(self.fallback);
        info!(prompt, ?decision, "scripted operator decision");
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_answers_in_order_then_fallback() {
        let op = ScriptedOperator::new(
            [OperatorDecision::Proceed, OperatorDecision::Skip],
            OperatorDecision::Abort,
        );
        assert_eq!(op.ask("first?"), OperatorDecision::Proceed);
        assert_eq!(op.ask("second?"), OperatorDecision::Skip);
        assert_eq!(op.ask("third?"), OperatorDecision::Abort);
        assert_eq!(op.ask("fourth?"), OperatorDecision::Abort);
    }
}
