//! Parallel query orchestrator for batch LLM prompt evaluation.
//!
//! `query-core` implements the hard engineering behind a prompt-fanout
//! tool: a scheduler that dispatches one composed prompt to many model
//! endpoints concurrently under a global concurrency ceiling and a
//! per-model rate ceiling, isolates per-model failures, classifies errors
//! into a closed taxonomy, and emits a structured audit trail.
//!
//! Collaborators outside this crate's scope — config loading, context
//! gathering, prompt assembly, concrete provider SDKs, output-file
//! writing — are consumed through the traits in [`provider`] and the
//! plain data in [`selector`]; see `query-cli` for implementations.

pub mod audit;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod rate_limit;
pub mod selector;

pub use error::{Category, ClassifiedError, Layer};
pub use orchestrator::{ClientFactory, ModelTask, Orchestrator, OutputWriter, RunRequest, TaskState};
pub use provider::{GenerationResult, ModelOptions, ProviderClient, SafetyEvaluation};
pub use rate_limit::{AdmissionTicket, RateLimiter, RateLimiterConfig};
pub use selector::{
    ConfiguredModel, EnvLookup, MapEnv, ModelDescriptor, ProcessEnv, SelectionIntent, SelectionResult,
    SelectorConfig,
};
