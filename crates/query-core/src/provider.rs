//! The contract a concrete model backend must satisfy to be dispatched
//! by the [`crate::orchestrator::Orchestrator`].
//!
//! This crate never speaks HTTP itself — `query-cli` supplies concrete
//! `ProviderClient` implementations per wire format (OpenAI-compatible,
//! Anthropic, etc). Keeping the boundary a trait rather than a concrete
//! SDK type means the orchestrator's scheduling, rate limiting, and error
//! handling are exercised in tests against a fake client, with no network
//! access required.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::ClassifiedError;

/// Open-for-extension per-call generation parameters. `extra` carries
/// provider-specific toggles not otherwise named here, so adding a new
/// provider never requires widening this struct.
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub thinking: bool,
    pub extra: Map<String, Value>,
}

/// A safety/content-moderation evaluation attached to a generation.
#[derive(Debug, Clone)]
pub struct SafetyEvaluation {
    pub category: String,
    pub flagged: bool,
    pub detail: Option<String>,
}

/// The successful outcome of one model invocation.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub content: String,
    pub finish_reason: Option<String>,
    pub token_count: Option<u32>,
    pub truncated: bool,
    pub safety_evaluations: Vec<SafetyEvaluation>,
}

/// A single-shot text-generation backend bound to one provider/model
/// pair — constructed fresh per task by the orchestrator's client
/// factory, never shared across concurrent tasks.
///
/// Implementations must treat `ctx` cancellation as authoritative: once
/// cancelled, `generate` should return a `ClassifiedError` with
/// `Category::Cancelled` as soon as practical rather than completing the
/// call to exhaustion. The contract makes no promise about thread-safety
/// of a single client beyond this; the orchestrator never shares one
/// instance across concurrent tasks.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn generate(
        &self,
        ctx: CancellationToken,
        prompt: &str,
        options: &ModelOptions,
        system_prompt: Option<&str>,
    ) -> Result<GenerationResult, ClassifiedError>;

    /// Stable `provider:model` identifier used in error/audit context.
    fn model_name(&self) -> &str;

    /// Release any held connection/session resources. Best-effort;
    /// errors are classified like any other provider error but never
    /// block a run's aggregation.
    async fn close(&self) -> Result<(), ClassifiedError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A `ProviderClient` stub driven entirely by a scripted outcome,
    /// used by orchestrator tests to exercise success/failure/cancellation
    /// paths without a real network boundary.
    pub struct ScriptedProvider {
        name: String,
        outcome: ScriptedOutcome,
        pub calls: Arc<AtomicUsize>,
    }

    pub enum ScriptedOutcome {
        Success(GenerationResult),
        Failure(ClassifiedError),
        /// Wait on cancellation rather than returning immediately, so
        /// tests can exercise "cancelled mid-flight" behavior.
        HangUntilCancelled,
    }

    impl ScriptedProvider {
        pub fn new(name: impl Into<String>, outcome: ScriptedOutcome) -> Self {
            Self {
                name: name.into(),
                outcome,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn model_name(&self) -> &str {
            &self.name
        }

        async fn generate(
            &self,
            ctx: CancellationToken,
            _prompt: &str,
            _options: &ModelOptions,
            _system_prompt: Option<&str>,
        ) -> Result<GenerationResult, ClassifiedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                ScriptedOutcome::Success(result) => Ok(result.clone()),
                ScriptedOutcome::Failure(err) => Err(clone_error(err)),
                ScriptedOutcome::HangUntilCancelled => {
                    ctx.cancelled().await;
                    Err(ClassifiedError::cancelled(
                        crate::error::Layer::ApiClient,
                        self.name.clone(),
                    ))
                }
            }
        }
    }

    fn clone_error(err: &ClassifiedError) -> ClassifiedError {
        let mut cloned = ClassifiedError::new(err.category(), err.layer(), err.provider(), err.message());
        if let Some(model) = err.model() {
            cloned = cloned.with_model(model);
        }
        if let Some(suggestion) = err.suggestion() {
            cloned = cloned.with_suggestion(suggestion);
        }
        cloned
    }
}
