//! Execution engine for the context-collapse benchmark.
//!
//! Components, leaves first: [`assembler`] builds the two prompt variants per
//! tuple, [`inference`] talks to the local serving endpoint with a strict
//! failure taxonomy, [`preflight`] gates the run behind ten checks, and
//! [`runner`] drives the model → question → condition loop against the
//! stores. [`operator`] abstracts the two interactive pauses so headless
//! runs and tests can script them.

pub mod assembler;
pub mod inference;
pub mod operator;
pub mod preflight;
pub mod runner;

pub use assembler::{
    AssembledContent, AssemblyOutcome, ContentAssembler, ExclusionReason, ReadyContent,
};
pub use inference::{
    ConnectionHealth, InferenceClient, InferenceOutcome, InferenceRequest, InferenceResult,
    SendOutcome,
};
pub use operator::{ConsoleOperator, Operator, OperatorDecision, ScriptedOperator};
pub use preflight::{Severity, ValidationResult, has_fatal_failure, run_preflight};
pub use runner::{Orchestrator, ProgressReporter, RunOutcome, RunSummary, SilentProgress};
