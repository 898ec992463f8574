mod cli;
mod config;
mod context;
mod output;
mod prompt;
mod providers;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use query_core::error::Layer;
use query_core::{
    ClassifiedError, ClientFactory, MapEnv, ModelDescriptor, Orchestrator, ProviderClient,
    RateLimiter, RateLimiterConfig, RunRequest, SelectionIntent,
};
use query_core::audit::{AuditLog, FileAuditLog, NoopAuditLog};
use query_core::selector::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cli::Args;
use output::FileOutputWriter;
use providers::{AnthropicClient, OpenAiCompatibleClient};

struct RealClientFactory {
    api_keys: HashMap<String, String>,
}

impl ClientFactory for RealClientFactory {
    fn create(&self, model: &ModelDescriptor) -> Result<Box<dyn ProviderClient>, ClassifiedError> {
        let key_env = format!("{}_API_KEY", model.provider.to_uppercase());
        let api_key = self.api_keys.get(&key_env).cloned().ok_or_else(|| {
            ClassifiedError::new(
                query_core::Category::Auth,
                Layer::Orchestrator,
                model.provider.clone(),
                format!("no API key found for '{}'", key_env),
            )
        })?;

        let base_url_env = format!("{}_BASE_URL", model.provider.to_uppercase());
        let name = model.key();

        match model.provider.as_str() {
            "anthropic" => {
                let base_url = self
                    .api_keys
                    .get(&base_url_env)
                    .cloned()
                    .unwrap_or_else(|| "https://api.anthropic.com".to_string());
                Ok(Box::new(AnthropicClient::new(base_url, api_key, model.model_id.clone(), name)))
            }
            _ => {
                let base_url = self
                    .api_keys
                    .get(&base_url_env)
                    .cloned()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
                Ok(Box::new(OpenAiCompatibleClient::new(base_url, api_key, model.model_id.clone(), name)))
            }
        }
    }
}

fn selection_intent(args: &Args) -> SelectionIntent {
    if !args.models.is_empty() {
        SelectionIntent::Explicit(args.models.clone())
    } else if let Some(group) = &args.group {
        SelectionIntent::Group(group.clone())
    } else {
        SelectionIntent::Default
    }
}

fn snapshot_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let app_config = config::load(&args.config).await.with_context(|| {
        format!("loading configuration from {}", args.config.display())
    })?;

    let env_snapshot = snapshot_env();
    let env = MapEnv(env_snapshot.clone());

    let selection = select(&app_config.selector, selection_intent(&args), &env)
        .with_context(|| "resolving model selection")?;

    for warning in &selection.warnings {
        warn!("{warning}");
    }

    let context = if let Some(dir) = &args.context_dir {
        let (files, stats) = context::gather(dir, None).await;
        info!(files = stats.file_count, bytes = stats.total_bytes, "gathered context");
        files
    } else {
        Vec::new()
    };

    let final_prompt = prompt::assemble(&args.instructions, &context);

    if args.dry_run {
        info!(models = selection.models.len(), prompt_bytes = final_prompt.len(), "dry run — not invoking any provider");
        for model in &selection.models {
            println!("{}", model.key());
        }
        return Ok(());
    }

    if selection.models.is_empty() {
        bail!("no model names specified");
    }

    let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        max_concurrent_requests: args.max_concurrent,
        requests_per_minute_per_key: args.rate_limit,
    }));

    let audit: Arc<dyn AuditLog> = match &args.audit_log {
        Some(path) => Arc::new(
            FileAuditLog::open(path)
                .await
                .with_context(|| format!("opening audit log {}", path.display()))?,
        ),
        None => Arc::new(NoopAuditLog),
    };

    let factory = Arc::new(RealClientFactory { api_keys: env_snapshot });
    let writer = Arc::new(FileOutputWriter);

    let orchestrator = Orchestrator::new(
        rate_limiter,
        audit,
        factory,
        writer,
        Duration::from_millis(args.query_timeout_ms),
    );

    let output_files: Vec<String> = selection
        .models
        .iter()
        .map(|m| {
            args.output_dir
                .join(format!("{}-{}.md", m.provider, m.model_id))
                .to_string_lossy()
                .into_owned()
        })
        .collect();

    let req = RunRequest {
        prompt: final_prompt,
        models: selection.models,
        output_files,
        system_prompt_override: args.system_prompt.clone(),
        enable_thinking: args.enable_thinking,
        query_timeout: None,
    };

    let ctx = CancellationToken::new();
    let run_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt signal, cancelling run");
            run_ctx.cancel();
        }
    });

    match orchestrator.run(ctx, &req).await {
        Ok(()) => {
            info!("run completed successfully");
            Ok(())
        }
        Err(err) => {
            error!(category = %err.category(), "run failed: {}", err.message());
            std::process::exit(1);
        }
    }
}
