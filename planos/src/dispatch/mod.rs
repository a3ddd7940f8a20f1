//! Tool dispatch client.
//!
//! Invokes a step's assigned tool backend over a request/response channel
//! with a per-call timeout, an internal bounded retry loop for transient
//! failures, and a fixed error-code taxonomy separating retryable from
//! terminal errors. The client is stateless per invocation: it holds no step
//! state across calls and publishes nothing — results are returned for the
//! engine to fold into step events.
//!
//! The internal retry budget here is independent of, and nested inside, the
//! engine's outer queue-driven retry. An exhausted internal budget surfaces
//! one typed `DispatchError` and counts as exactly one outer attempt.

pub mod retry;

pub use retry::{RetryContext, RetryPolicy};

use crate::config::DispatchConfig;
use crate::errors::DispatchError;
use crate::types::{ToolInvocation, ToolResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// A pluggable tool/agent backend reachable over RPC.
///
/// Backends must treat the invocation id as idempotency key: a call for an
/// already-completed id returns the prior result instead of re-executing.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn call(&self, invocation: &ToolInvocation) -> Result<Vec<ToolResult>, DispatchError>;
}

/// Per-tool call counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolMetrics {
    pub total_calls: u64,
    pub total_errors: u64,
    pub total_duration_ms: u64,
}

impl ToolMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_calls as f64
        }
    }
}

#[derive(Debug, Default)]
struct DispatchMetrics {
    per_tool: Mutex<HashMap<String, ToolMetrics>>,
}

impl DispatchMetrics {
    fn record(&self, tool: &str, duration: Duration, failed: bool) {
        let mut per_tool = self.per_tool.lock().unwrap_or_else(|e| e.into_inner());
        let entry = per_tool.entry(tool.to_string()).or_default();
        entry.total_calls += 1;
        entry.total_duration_ms += duration.as_millis() as u64;
        if failed {
            entry.total_errors += 1;
        }
    }

    fn snapshot(&self, tool: &str) -> Option<ToolMetrics> {
        let per_tool = self.per_tool.lock().unwrap_or_else(|e| e.into_inner());
        per_tool.get(tool).cloned()
    }
}

/// The dispatch client: a backend registry plus the retry/timeout machinery.
pub struct ToolDispatchClient {
    config: DispatchConfig,
    backends: RwLock<HashMap<String, Arc<dyn ToolBackend>>>,
    metrics: DispatchMetrics,
}

impl ToolDispatchClient {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            backends: RwLock::new(HashMap::new()),
            metrics: DispatchMetrics::default(),
        }
    }

    pub fn register_backend(&self, tool: impl Into<String>, backend: Arc<dyn ToolBackend>) {
        let tool = tool.into();
        let mut backends = self.backends.write().unwrap_or_else(|e| e.into_inner());
        if backends.insert(tool.clone(), backend).is_some() {
            log::warn!("replacing previously registered backend for tool '{}'", tool);
        }
    }

    fn backend(&self, tool: &str) -> Option<Arc<dyn ToolBackend>> {
        let backends = self.backends.read().unwrap_or_else(|e| e.into_inner());
        backends.get(tool).cloned()
    }

    /// Per-tool call metrics, if the tool has been called at least once.
    pub fn tool_metrics(&self, tool: &str) -> Option<ToolMetrics> {
        self.metrics.snapshot(tool)
    }

    /// Execute one invocation against its backend.
    ///
    /// Applies the per-call timeout (invocation override, else the configured
    /// default), retries transient failures up to the internal attempt
    /// budget, and returns the backend's ordered result sequence. Terminal
    /// errors and timeouts return immediately.
    pub async fn execute_tool(
        &self,
        invocation: &ToolInvocation,
    ) -> Result<Vec<ToolResult>, DispatchError> {
        let backend = self
            .backend(&invocation.tool)
            .ok_or_else(|| DispatchError::unknown_tool(&invocation.tool))?;

        let timeout_ms = invocation
            .timeout_ms
            .unwrap_or(self.config.default_timeout_ms);
        let timeout = Duration::from_millis(timeout_ms);

        let mut retry_ctx = RetryContext::new(self.config.retry.clone());
        let started = Instant::now();
        loop {
            let outcome = tokio::time::timeout(timeout, backend.call(invocation)).await;
            match outcome {
                Ok(Ok(results)) => {
                    retry_ctx.success();
                    self.metrics
                        .record(&invocation.tool, started.elapsed(), false);
                    return Ok(results);
                }
                Ok(Err(err)) if err.retryable => {
                    if let Some(delay) = retry_ctx.next_attempt(Some(err.to_string())) {
                        log::warn!(
                            "tool call {} failed (attempt {}), retrying in {:?}: {}",
                            invocation.invocation_id,
                            retry_ctx.attempt - 1,
                            delay,
                            err
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    log::warn!(
                        "tool call {} exhausted {} internal attempts: {}",
                        invocation.invocation_id,
                        retry_ctx.attempt,
                        err
                    );
                    self.metrics
                        .record(&invocation.tool, started.elapsed(), true);
                    return Err(err);
                }
                Ok(Err(err)) => {
                    self.metrics
                        .record(&invocation.tool, started.elapsed(), true);
                    return Err(err);
                }
                Err(_) => {
                    // A hung backend is terminal for the outer loop as well:
                    // blind redispatch risks duplicate side effects.
                    self.metrics
                        .record(&invocation.tool, started.elapsed(), true);
                    return Err(DispatchError::timeout(timeout_ms));
                }
            }
        }
    }
}
