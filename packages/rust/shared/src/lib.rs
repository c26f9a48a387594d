//! Shared types, error model, and run configuration for ccbench.
//!
//! This crate is the foundation depended on by all other ccbench crates.
//! It provides:
//! - [`CcbenchError`] — the unified error type
//! - The run configuration ([`RunConfig`], loading + validation + path resolution)
//! - Corpus types ([`Question`], [`SiteInfo`], loading)
//! - The archive manifest ([`ArchiveManifest`], [`ManifestEntry`])
//! - The precomputed token-count table ([`TokenCountTable`])

pub mod config;
pub mod corpus;
pub mod error;
pub mod manifest;
pub mod tokens;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AssemblyConfig, EndpointConfig, Engine, InferenceParams, ModelConfig, PromptConfig, RunConfig,
    RunPaths,
};
pub use corpus::{Corpus, Question, SiteInfo, SiteList};
pub use error::{CcbenchError, Result};
pub use manifest::{ArchiveManifest, FetchStatus, ManifestEntry};
pub use tokens::{TokenCountTable, TokenCounts};
pub use types::{CANONICAL_CONDITION_ORDER, Condition};
