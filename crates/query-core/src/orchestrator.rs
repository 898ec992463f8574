//! Drives one run: validates the selection, fans out one worker per
//! model under rate-limit admission, isolates per-model failures, and
//! aggregates outcomes into a single composite result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, OpStatus, RunContext, TokenCounts};
use crate::error::{Category, ClassifiedError, Layer};
use crate::provider::{GenerationResult, ModelOptions, ProviderClient};
use crate::rate_limit::RateLimiter;
use crate::selector::ModelDescriptor;

/// Worker lifecycle. Declaration order doubles as the total order the
/// spec requires (`Pending < Admitting < Running < terminal`); the three
/// terminal variants are mutually unordered in practice, since a task
/// only ever reaches one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Pending,
    Admitting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One worker's full lifecycle record. Built up during dispatch and
/// discarded once the run's aggregation completes — callers only ever
/// see the aggregated `Result` from [`Orchestrator::run`].
#[derive(Debug, Clone)]
pub struct ModelTask {
    pub descriptor: ModelDescriptor,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<GenerationResult>,
    pub error: Option<ClassifiedError>,
}

impl ModelTask {
    fn pending(descriptor: ModelDescriptor) -> Self {
        Self {
            descriptor,
            state: TaskState::Pending,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
        }
    }
}

/// One invocation's immutable inputs. `output_files` is positionally
/// paired with `models` — `query-cli` derives each target path before
/// calling `run`.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub models: Vec<ModelDescriptor>,
    pub output_files: Vec<String>,
    pub system_prompt_override: Option<String>,
    pub enable_thinking: bool,
    pub query_timeout: Option<Duration>,
}

/// Produces a fresh, unshared `ProviderClient` for one task. Injected
/// into the orchestrator at construction rather than into `run`, since
/// `run`'s signature is fixed by the spec to `(ctx, &RunRequest)`.
pub trait ClientFactory: Send + Sync {
    fn create(&self, model: &ModelDescriptor) -> Result<Box<dyn ProviderClient>, ClassifiedError>;
}

/// The output-file writer collaborator (spec.md §6). A failure here is
/// treated as a failure of the task that produced the content.
#[async_trait]
pub trait OutputWriter: Send + Sync {
    async fn save(&self, content: &str, output_file: &str) -> Result<(), ClassifiedError>;
}

struct ReleaseGuard {
    rate_limiter: Arc<RateLimiter>,
    ticket: Option<crate::rate_limit::AdmissionTicket>,
}

impl ReleaseGuard {
    fn new(rate_limiter: Arc<RateLimiter>, ticket: crate::rate_limit::AdmissionTicket) -> Self {
        Self {
            rate_limiter,
            ticket: Some(ticket),
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.rate_limiter.release(ticket);
        }
    }
}

pub struct Orchestrator {
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditLog>,
    client_factory: Arc<dyn ClientFactory>,
    writer: Arc<dyn OutputWriter>,
    default_query_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<dyn AuditLog>,
        client_factory: Arc<dyn ClientFactory>,
        writer: Arc<dyn OutputWriter>,
        default_query_timeout: Duration,
    ) -> Self {
        Self {
            rate_limiter,
            audit,
            client_factory,
            writer,
            default_query_timeout,
        }
    }

    /// Execute one run: validate, fan out, aggregate. The sole public
    /// operation, matching spec.md §4.6.
    pub async fn run(&self, ctx: CancellationToken, req: &RunRequest) -> Result<(), ClassifiedError> {
        if req.models.is_empty() {
            return Err(ClassifiedError::new(
                Category::InvalidRequest,
                Layer::Orchestrator,
                "orchestrator",
                "no model names specified",
            ));
        }

        if ctx.is_cancelled() {
            return Err(ClassifiedError::cancelled(Layer::Orchestrator, "orchestrator")
                .wrap(Layer::Orchestrator, "run cancelled before start"));
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let run_ctx = RunContext::new(correlation_id);

        let model_keys: Vec<String> = req.models.iter().map(ModelDescriptor::key).collect();
        let mut start_inputs = Map::new();
        start_inputs.insert("models".to_string(), json!(model_keys));
        let _ = self
            .audit
            .log_op(&run_ctx, "RunStart", OpStatus::Started, start_inputs, Map::new(), None)
            .await;

        let n = req.models.len();
        let tasks: Arc<AsyncMutex<Vec<Option<ModelTask>>>> = Arc::new(AsyncMutex::new(vec![None; n]));

        let mut handles = Vec::with_capacity(n);
        for (idx, model) in req.models.iter().cloned().enumerate() {
            let ctx = ctx.clone();
            let prompt = req.prompt.clone();
            let output_file = req.output_files.get(idx).cloned().unwrap_or_default();
            let system_override = req.system_prompt_override.clone();
            let enable_thinking = req.enable_thinking;
            let timeout = req.query_timeout.unwrap_or(self.default_query_timeout);
            let rate_limiter = self.rate_limiter.clone();
            let audit = self.audit.clone();
            let client_factory = self.client_factory.clone();
            let writer = self.writer.clone();
            let tasks = tasks.clone();
            let run_ctx = run_ctx.clone();

            handles.push(tokio::spawn(async move {
                let task = run_worker(
                    ctx,
                    model,
                    prompt,
                    output_file,
                    system_override,
                    enable_thinking,
                    timeout,
                    rate_limiter,
                    audit,
                    client_factory,
                    writer,
                    run_ctx,
                )
                .await;
                let mut guard = tasks.lock().await;
                guard[idx] = Some(task);
            }));
        }

        for (idx, handle) in handles.into_iter().enumerate() {
            if handle.await.is_err() {
                // Worker panicked before recording its own outcome. Record it as
                // a failure so the slot isn't silently missing from aggregation.
                let mut guard = tasks.lock().await;
                if guard[idx].is_none() {
                    let mut task = ModelTask::pending(req.models[idx].clone());
                    task.state = TaskState::Failed;
                    task.error = Some(ClassifiedError::new(
                        Category::Unknown,
                        Layer::Orchestrator,
                        "orchestrator",
                        format!("worker for model {} terminated unexpectedly", task.descriptor.key()),
                    ));
                    guard[idx] = Some(task);
                }
            }
        }

        let tasks: Vec<ModelTask> = {
            let mut guard = tasks.lock().await;
            std::mem::take(&mut *guard)
        }
        .into_iter()
        .map(|t| t.expect("every slot is filled by either the worker or the panic fallback above"))
        .collect();

        let outcome = aggregate(&tasks);

        let succeeded = tasks.iter().filter(|t| t.state == TaskState::Succeeded).count();
        let failed = tasks.iter().filter(|t| t.state == TaskState::Failed).count();
        let cancelled = tasks.iter().filter(|t| t.state == TaskState::Cancelled).count();
        let mut end_outputs = Map::new();
        end_outputs.insert("succeeded".to_string(), json!(succeeded));
        end_outputs.insert("failed".to_string(), json!(failed));
        end_outputs.insert("cancelled".to_string(), json!(cancelled));
        let end_status = if outcome.is_ok() {
            OpStatus::Succeeded
        } else {
            OpStatus::Failed
        };
        let _ = self
            .audit
            .log_op(&run_ctx, "RunEnd", end_status, Map::new(), end_outputs, outcome.as_ref().err())
            .await;

        outcome
    }
}

/// Build the single composite outcome from every task's terminal state,
/// in input-list order (spec.md Testable Property 6).
fn aggregate(tasks: &[ModelTask]) -> Result<(), ClassifiedError> {
    let failed: Vec<&ModelTask> = tasks.iter().filter(|t| t.state == TaskState::Failed).collect();
    let cancelled: Vec<&ModelTask> = tasks.iter().filter(|t| t.state == TaskState::Cancelled).collect();

    if failed.is_empty() && cancelled.is_empty() {
        return Ok(());
    }

    if failed.is_empty() {
        let names: Vec<String> = cancelled.iter().map(|t| t.descriptor.key()).collect();
        let message = format!("run cancelled: {}", names.join(", "));
        return Err(ClassifiedError::new(
            Category::Cancelled,
            Layer::Orchestrator,
            "orchestrator",
            message,
        ));
    }

    let mut lines = Vec::with_capacity(failed.len());
    let mut mentions_rate_limit = false;
    for task in &failed {
        let message = task
            .error
            .as_ref()
            .map(|e| e.message().to_string())
            .unwrap_or_else(|| "unknown failure".to_string());
        if message.to_lowercase().contains("rate limit") {
            mentions_rate_limit = true;
        }
        lines.push(format!("model {}: {}", task.descriptor.key(), message));
    }

    if mentions_rate_limit {
        lines.push(
            "tip: consider lowering --max-concurrent or --rate-limit to stay under provider limits"
                .to_string(),
        );
    }

    Err(ClassifiedError::new(
        Category::Unknown,
        Layer::Orchestrator,
        "orchestrator",
        lines.join("\n"),
    ))
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    ctx: CancellationToken,
    descriptor: ModelDescriptor,
    prompt: String,
    output_file: String,
    system_override: Option<String>,
    enable_thinking: bool,
    timeout: Duration,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditLog>,
    client_factory: Arc<dyn ClientFactory>,
    writer: Arc<dyn OutputWriter>,
    run_ctx: RunContext,
) -> ModelTask {
    let key = descriptor.key();
    let mut task = ModelTask::pending(descriptor);
    task.state = TaskState::Admitting;
    task.started_at = Some(Utc::now());

    let mut acquire_inputs = Map::new();
    acquire_inputs.insert("model".to_string(), json!(key));
    let _ = audit
        .log_op(&run_ctx, "Acquire", OpStatus::Started, acquire_inputs.clone(), Map::new(), None)
        .await;

    let ticket = match rate_limiter.acquire(&ctx, &key).await {
        Ok(ticket) => ticket,
        Err(err) => {
            let _ = audit
                .log_op(&run_ctx, "Acquire", OpStatus::Failed, acquire_inputs, Map::new(), Some(&err))
                .await;
            task.state = TaskState::Cancelled;
            task.ended_at = Some(Utc::now());
            task.error = Some(err);
            return task;
        }
    };
    let guard = ReleaseGuard::new(rate_limiter, ticket);
    let _ = audit
        .log_op(&run_ctx, "Acquire", OpStatus::Succeeded, acquire_inputs, Map::new(), None)
        .await;

    task.state = TaskState::Running;

    let mut generate_inputs = Map::new();
    generate_inputs.insert("model".to_string(), json!(key));
    let _ = audit
        .log_op(&run_ctx, "Generate", OpStatus::Started, generate_inputs.clone(), Map::new(), None)
        .await;

    // Precedence: run-level override > model-level > group-level (already
    // folded into the descriptor by the selector) > provider-level default,
    // first non-empty wins.
    let system_prompt = system_override
        .filter(|s| !s.is_empty())
        .or_else(|| task.descriptor.system_prompt.clone().filter(|s| !s.is_empty()));

    let options = ModelOptions {
        temperature: task.descriptor.temperature,
        max_output_tokens: task.descriptor.max_output_tokens,
        top_p: None,
        thinking: enable_thinking,
        extra: task.descriptor.extra.clone(),
    };

    let client = match client_factory.create(&task.descriptor) {
        Ok(client) => client,
        Err(err) => {
            drop(guard);
            let wrapped = err.wrap(Layer::Orchestrator, &format!("model {key}"));
            let _ = audit
                .log_op(&run_ctx, "Generate", OpStatus::Failed, generate_inputs, Map::new(), Some(&wrapped))
                .await;
            task.state = TaskState::Failed;
            task.ended_at = Some(Utc::now());
            task.error = Some(wrapped);
            return task;
        }
    };

    let call = client.generate(ctx.clone(), &prompt, &options, system_prompt.as_deref());
    let outcome: Result<GenerationResult, ClassifiedError> = tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(ClassifiedError::cancelled(Layer::Orchestrator, key.clone())),
        res = tokio::time::timeout(timeout, call) => match res {
            Ok(inner) => inner,
            Err(_elapsed) => Err(ClassifiedError::new(
                Category::Network,
                Layer::Orchestrator,
                key.clone(),
                format!("query timed out after {timeout:?}"),
            )),
        },
    };

    // Release the admission ticket on every exit path from here, per the
    // spec's "exit-path guarantee" — a guard's Drop runs on early return same
    // as on fall-through, so this single `drop` covers all of them.
    drop(guard);

    task.ended_at = Some(Utc::now());

    match outcome {
        Ok(result) => {
            let mut outputs = Map::new();
            if let Some(reason) = &result.finish_reason {
                outputs.insert("finish_reason".to_string(), json!(reason));
            }
            let mut entry_inputs = generate_inputs.clone();
            entry_inputs
                .entry("correlation_id".to_string())
                .or_insert_with(|| json!(run_ctx.correlation_id));
            let mut entry = crate::audit::AuditEntry::new("Generate", "completed successfully", "Generate completed successfully")
                .with_inputs(entry_inputs)
                .with_outputs(outputs);
            if let Some(total) = result.token_count {
                entry = entry.with_token_counts(TokenCounts {
                    prompt_tokens: 0,
                    output_tokens: Some(total),
                    total_tokens: total,
                    limit: task.descriptor.max_output_tokens,
                });
            }
            let _ = audit.log(entry).await;

            match writer.save(&result.content, &output_file).await {
                Ok(()) => {
                    task.state = TaskState::Succeeded;
                    task.result = Some(result);
                }
                Err(err) => {
                    let wrapped = err.wrap(Layer::Orchestrator, &format!("model {key}"));
                    task.state = TaskState::Failed;
                    task.error = Some(wrapped);
                }
            }
        }
        Err(err) => {
            if err.category() == Category::Cancelled {
                let _ = audit
                    .log_op(&run_ctx, "Generate", OpStatus::Failed, generate_inputs, Map::new(), Some(&err))
                    .await;
                task.state = TaskState::Cancelled;
                task.error = Some(err);
            } else {
                let _ = audit
                    .log_op(&run_ctx, "Generate", OpStatus::Failed, generate_inputs, Map::new(), Some(&err))
                    .await;
                task.state = TaskState::Failed;
                task.error = Some(err);
            }
        }
    }

    task
}
