//! Append-only, concurrency-safe structured audit log.
//!
//! Two sinks: [`FileAuditLog`] (JSON-lines on disk) and [`NoopAuditLog`]
//! (discards everything). Neither failure mode aborts the caller's
//! operation — a failed audit write is reported back but the orchestrator
//! treats it as non-fatal to the run.

use std::collections::HashMap;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::ClassifiedError;

/// Per-run correlation context threaded through every audit write.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub correlation_id: String,
}

impl RunContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
        }
    }
}

/// Coarse outcome of the operation an [`AuditEntry`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Started,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditErrorInfo {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl From<&ClassifiedError> for AuditErrorInfo {
    fn from(err: &ClassifiedError) -> Self {
        Self {
            message: err.message().to_string(),
            error_type: err.category().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCounts {
    pub prompt_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    pub total_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// One immutable, append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub operation: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_counts: Option<TokenCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AuditErrorInfo>,
    pub message: String,
}

impl AuditEntry {
    pub fn new(operation: impl Into<String>, status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            operation: operation.into(),
            status: status.into(),
            duration_ms: None,
            inputs: None,
            outputs: None,
            token_counts: None,
            error: None,
            message: message.into(),
        }
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn with_inputs(mut self, inputs: serde_json::Map<String, Value>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_outputs(mut self, outputs: serde_json::Map<String, Value>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_token_counts(mut self, counts: TokenCounts) -> Self {
        self.token_counts = Some(counts);
        self
    }

    pub fn with_error(mut self, err: &ClassifiedError) -> Self {
        self.error = Some(err.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("failed to serialize audit entry: {0}")]
    Marshal(String),
    #[error("failed to write audit entry: {0}")]
    Write(String),
    #[error("audit log is closed")]
    Closed,
}

/// Durable, concurrency-safe record of every state transition worth
/// auditing. `log`/`close` are safe to call from any number of concurrent
/// workers; writes are linearised by the implementation.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn log(&self, entry: AuditEntry) -> Result<(), AuditError>;

    /// Convenience wrapper composing a human message from `status`.
    async fn log_op(
        &self,
        ctx: &RunContext,
        operation: &str,
        status: OpStatus,
        mut inputs: serde_json::Map<String, Value>,
        outputs: serde_json::Map<String, Value>,
        err: Option<&ClassifiedError>,
    ) -> Result<(), AuditError> {
        let status_word = match status {
            OpStatus::Started => "started",
            OpStatus::Succeeded => "completed successfully",
            OpStatus::Failed => "failed",
        };
        let message = format!("{operation} {status_word}");

        inputs
            .entry("correlation_id".to_string())
            .or_insert_with(|| Value::String(ctx.correlation_id.clone()));

        let mut entry = AuditEntry::new(operation, status_word, message)
            .with_inputs(inputs)
            .with_outputs(outputs);
        if let Some(e) = err {
            entry = entry.with_error(e);
        }
        self.log(entry).await
    }

    /// Idempotent; second and later calls are no-ops returning success.
    async fn close(&self) -> Result<(), AuditError>;
}

/// JSON-lines file sink. One record per line, append-create-write-only,
/// mode 0640.
pub struct FileAuditLog {
    file: Mutex<Option<tokio::fs::File>>,
    closed: AtomicBool,
}

impl FileAuditLog {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o640)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(Some(file)),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl AuditLog for FileAuditLog {
    async fn log(&self, mut entry: AuditEntry) -> Result<(), AuditError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AuditError::Closed);
        }
        if entry.timestamp.is_none() {
            entry.timestamp = Some(Utc::now());
        }

        let mut line = serde_json::to_string(&entry).map_err(|e| AuditError::Marshal(e.to_string()))?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(AuditError::Closed)?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AuditError::Write(e.to_string()))?;
        file.flush().await.map_err(|e| AuditError::Write(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AuditError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.file.lock().await;
        *guard = None;
        Ok(())
    }
}

/// No-op sink: every method returns success without allocating.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditLog;

#[async_trait]
impl AuditLog for NoopAuditLog {
    async fn log(&self, _entry: AuditEntry) -> Result<(), AuditError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Parse a JSON-lines audit file back into entries, used by tests that
/// assert on the written record stream.
pub fn parse_jsonl(contents: &str) -> Result<Vec<AuditEntry>, serde_json::Error> {
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

/// Aggregate counts kept by tests and CLI summaries alike.
#[derive(Debug, Default, Clone)]
pub struct OperationTally(HashMap<String, usize>);

impl OperationTally {
    pub fn from_entries(entries: &[AuditEntry]) -> Self {
        let mut map = HashMap::new();
        for e in entries {
            *map.entry(e.operation.clone()).or_insert(0) += 1;
        }
        Self(map)
    }

    pub fn count(&self, operation: &str) -> usize {
        self.0.get(operation).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Layer;

    #[tokio::test]
    async fn file_audit_log_writes_one_json_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = FileAuditLog::open(&path).await.unwrap();

        log.log(AuditEntry::new("RunStart", "started", "run started"))
            .await
            .unwrap();
        log.log(AuditEntry::new("RunEnd", "completed successfully", "run ended"))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let entries = parse_jsonl(&contents).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, "RunStart");
        assert_eq!(entries[1].operation, "RunEnd");
        assert!(entries[0].timestamp.unwrap() <= entries[1].timestamp.unwrap());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = FileAuditLog::open(&path).await.unwrap();

        log.close().await.unwrap();
        log.close().await.unwrap(); // second close is a no-op success

        let result = log.log(AuditEntry::new("op", "started", "msg")).await;
        assert!(matches!(result, Err(AuditError::Closed)));
    }

    #[tokio::test]
    async fn noop_log_never_errors() {
        let log = NoopAuditLog;
        log.log(AuditEntry::new("op", "started", "msg")).await.unwrap();
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn log_op_injects_correlation_id_and_error_category() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = FileAuditLog::open(&path).await.unwrap();
        let ctx = RunContext::new("corr-123");

        let err = ClassifiedError::from_status(429, Layer::ApiClient, "p1", "Rate limit exceeded");
        log.log_op(
            &ctx,
            "Generate",
            OpStatus::Failed,
            serde_json::Map::new(),
            serde_json::Map::new(),
            Some(&err),
        )
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let entries = parse_jsonl(&contents).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].inputs.as_ref().unwrap().get("correlation_id").unwrap(),
            "corr-123"
        );
        assert_eq!(entries[0].error.as_ref().unwrap().error_type, "rate_limit");
        assert!(entries[0].message.contains("failed"));
    }

    #[tokio::test]
    async fn concurrent_writers_produce_valid_jsonl_with_exact_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = std::sync::Arc::new(FileAuditLog::open(&path).await.unwrap());

        let mut handles = Vec::new();
        for worker in 0..10 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..20 {
                    log.log(AuditEntry::new(
                        format!("op-{worker}-{i}"),
                        "started",
                        "concurrent write",
                    ))
                    .await
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 200);

        let entries = parse_jsonl(&contents).unwrap();
        assert_eq!(entries.len(), 200);

        let names: std::collections::HashSet<_> = entries.iter().map(|e| e.operation.clone()).collect();
        assert_eq!(names.len(), 200);
    }
}
