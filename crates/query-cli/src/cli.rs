use std::path::PathBuf;

use clap::Parser;

/// Dispatch one prompt to many LLM endpoints and save each response.
#[derive(Debug, Parser)]
#[command(name = "query-cli", version, about)]
pub struct Args {
    /// User instructions to prepend to any gathered context.
    #[arg(long)]
    pub instructions: String,

    /// Root directory to gather context files from (optional).
    #[arg(long)]
    pub context_dir: Option<PathBuf>,

    /// Path to the TOML model/group configuration file.
    #[arg(long, default_value = "query.toml")]
    pub config: PathBuf,

    /// Directory responses are saved into, one file per model.
    #[arg(long, default_value = "out")]
    pub output_dir: PathBuf,

    /// Explicit `provider:modelId` list to query (repeatable).
    #[arg(long = "model")]
    pub models: Vec<String>,

    /// A single named group to query.
    #[arg(long)]
    pub group: Option<String>,

    /// Path to the append-only JSON-lines audit log. Omit to disable auditing.
    #[arg(long)]
    pub audit_log: Option<PathBuf>,

    /// Maximum number of requests in flight at once. 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    pub max_concurrent: u64,

    /// Per-model request budget, requests per minute. 0 means unmetered.
    #[arg(long, default_value_t = 0)]
    pub rate_limit: u64,

    /// Per-call deadline in milliseconds.
    #[arg(long, default_value_t = 300_000)]
    pub query_timeout_ms: u64,

    /// Run-level system prompt override, takes precedence over per-model prompts.
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Request extended thinking on models that support it.
    #[arg(long)]
    pub enable_thinking: bool,

    /// Gather and display context only; do not invoke any provider.
    #[arg(long)]
    pub dry_run: bool,
}
