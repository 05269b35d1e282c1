//! Host collaborator implemented over the stdio protocol.
//!
//! Each call becomes a `request` line with a fresh id; the matching
//! `response` line resolves it. Unanswered requests fail after a timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use persevere::core::types::{
    EvaluationRequest, PromptRequest, Todo, Toast, TranscriptEntry, Verdict,
};
use persevere::io::evaluator::CompletionEvaluator;
use persevere::io::host::Host;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::{Outbound, Outbox};

/// Default wait for a host response.
pub const HOST_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Reply = oneshot::Sender<Result<Value, String>>;

pub struct StdioHost {
    outbox: Outbox,
    pending: Mutex<HashMap<u64, Reply>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl StdioHost {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout: HOST_REQUEST_TIMEOUT,
        }
    }

    /// Route a `response` line. Returns `false` for unknown or expired ids.
    pub fn resolve(&self, id: u64, outcome: Result<Value, String>) -> bool {
        match self.pending().remove(&id) {
            Some(reply) => reply.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request.
    pub fn shutdown(&self) {
        let dropped = self.pending().drain().count();
        if dropped > 0 {
            debug!(dropped, "abandoning host requests");
        }
    }

    pub async fn request(&self, method: &'static str, params: Value) -> Result<Value> {
        self.request_with_timeout(method, params, self.timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &'static str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        if self
            .outbox
            .send(Outbound::Request { id, method, params })
            .is_err()
        {
            self.pending().remove(&id);
            return Err(anyhow!("host {method}: output closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(anyhow!("host {method} failed: {message}")),
            Ok(Err(_)) => Err(anyhow!("host {method}: bridge shutting down")),
            Err(_) => {
                self.pending().remove(&id);
                Err(anyhow!(
                    "host {method} timed out after {}s",
                    timeout.as_secs()
                ))
            }
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Reply>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Host for StdioHost {
    async fn fetch_todos(&self, session_id: &str) -> Result<Vec<Todo>> {
        let value = self
            .request("fetch_todos", json!({ "sessionID": session_id }))
            .await?;
        serde_json::from_value(value).context("parse fetch_todos result")
    }

    async fn send_prompt(&self, request: PromptRequest) -> Result<()> {
        let params = serde_json::to_value(&request).context("serialize prompt")?;
        self.request("send_prompt", params).await?;
        Ok(())
    }

    async fn show_toast(&self, toast: Toast) -> Result<()> {
        let params = serde_json::to_value(&toast).context("serialize toast")?;
        self.request("show_toast", params).await?;
        Ok(())
    }

    async fn fetch_transcript(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<TranscriptEntry>> {
        let value = self
            .request(
                "fetch_transcript",
                json!({ "sessionID": session_id, "limit": limit }),
            )
            .await?;
        serde_json::from_value(value).context("parse fetch_transcript result")
    }
}

/// Completion evaluator that asks the host (e.g. a reviewer agent).
pub struct HostEvaluator {
    host: Arc<StdioHost>,
    timeout: Duration,
}

impl HostEvaluator {
    pub fn new(host: Arc<StdioHost>, timeout: Duration) -> Self {
        Self { host, timeout }
    }
}

#[async_trait]
impl CompletionEvaluator for HostEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Verdict> {
        let params = serde_json::to_value(request).context("serialize evaluation request")?;
        let value = self
            .host
            .request_with_timeout("evaluate", params, self.timeout)
            .await?;
        serde_json::from_value(value).context("parse evaluate result")
    }
}
