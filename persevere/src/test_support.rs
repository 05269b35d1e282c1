//! Test-only doubles for the host runtime, the completion evaluator and the
//! delivery hook, plus deterministic todo builders.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tempfile::TempDir;

use crate::core::types::{
    EvaluationRequest, PromptRequest, Todo, TodoPriority, TodoStatus, Toast, TranscriptEntry,
    Verdict,
};
use crate::delivery::{DeliveryHook, ScheduledInjection};
use crate::io::evaluator::CompletionEvaluator;
use crate::io::host::Host;
use crate::io::loop_state::FileLoopStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a todo with medium priority.
pub fn todo(id: &str, content: &str, status: TodoStatus) -> Todo {
    Todo {
        id: id.to_string(),
        content: content.to_string(),
        status,
        priority: TodoPriority::Medium,
    }
}

/// Host that serves scripted todos and records every prompt and toast.
#[derive(Debug, Default)]
pub struct ScriptedHost {
    todos: Mutex<HashMap<String, Vec<Todo>>>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    prompts: Mutex<Vec<PromptRequest>>,
    toasts: Mutex<Vec<Toast>>,
    fail_todos: AtomicBool,
    fail_prompts: AtomicBool,
    todo_fetches: AtomicUsize,
    fetch_delay: Mutex<Duration>,
    toast_delay: Mutex<Duration>,
}

impl ScriptedHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_todos(&self, session_id: &str, todos: Vec<Todo>) {
        lock(&self.todos).insert(session_id.to_string(), todos);
    }

    pub fn set_transcript(&self, entries: Vec<TranscriptEntry>) {
        *lock(&self.transcript) = entries;
    }

    pub fn fail_todo_fetches(&self, fail: bool) {
        self.fail_todos.store(fail, Ordering::SeqCst);
    }

    pub fn fail_prompts(&self, fail: bool) {
        self.fail_prompts.store(fail, Ordering::SeqCst);
    }

    /// Hold every todo fetch for `delay` before answering.
    pub fn delay_todo_fetches(&self, delay: Duration) {
        *lock(&self.fetch_delay) = delay;
    }

    /// Hold every toast call for `delay`. The toast is recorded up front.
    pub fn delay_toasts(&self, delay: Duration) {
        *lock(&self.toast_delay) = delay;
    }

    /// Every prompt delivered, in order.
    pub fn prompts(&self) -> Vec<PromptRequest> {
        lock(&self.prompts).clone()
    }

    /// Prompts the model is expected to act on.
    pub fn continuations(&self) -> Vec<PromptRequest> {
        self.prompts().into_iter().filter(|p| !p.ignored).collect()
    }

    /// Ignored status lines.
    pub fn status_messages(&self) -> Vec<PromptRequest> {
        self.prompts().into_iter().filter(|p| p.ignored).collect()
    }

    pub fn toasts(&self) -> Vec<Toast> {
        lock(&self.toasts).clone()
    }

    pub fn todo_fetches(&self) -> usize {
        self.todo_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Host for ScriptedHost {
    async fn fetch_todos(&self, session_id: &str) -> Result<Vec<Todo>> {
        self.todo_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.fetch_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_todos.load(Ordering::SeqCst) {
            bail!("todo fetch failed");
        }
        Ok(lock(&self.todos)
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_prompt(&self, request: PromptRequest) -> Result<()> {
        if self.fail_prompts.load(Ordering::SeqCst) {
            bail!("prompt rejected");
        }
        lock(&self.prompts).push(request);
        Ok(())
    }

    async fn show_toast(&self, toast: Toast) -> Result<()> {
        lock(&self.toasts).push(toast);
        let delay = *lock(&self.toast_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn fetch_transcript(&self, _session_id: &str, limit: usize) -> Result<Vec<TranscriptEntry>> {
        let entries = lock(&self.transcript);
        let skip = entries.len().saturating_sub(limit);
        Ok(entries[skip..].to_vec())
    }
}

/// Evaluator returning queued verdicts, then a fallback.
#[derive(Debug)]
pub struct ScriptedEvaluator {
    queued: Mutex<VecDeque<Verdict>>,
    fallback: Verdict,
    calls: Mutex<Vec<EvaluationRequest>>,
    delay: Duration,
    fail: AtomicBool,
}

impl ScriptedEvaluator {
    pub fn always(verdict: Verdict) -> Arc<Self> {
        Self::sequence(Vec::new(), verdict)
    }

    pub fn sequence(verdicts: Vec<Verdict>, fallback: Verdict) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(verdicts.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
        })
    }

    /// Sleep this long (tokio time) before answering.
    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        let mut this = Arc::try_unwrap(self).expect("configure delay before sharing");
        this.delay = delay;
        Arc::new(this)
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<EvaluationRequest> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl CompletionEvaluator for ScriptedEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Verdict> {
        lock(&self.calls).push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("evaluator unavailable");
        }
        Ok(lock(&self.queued)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Delivery hook that keeps scheduled injections for the test to fire.
#[derive(Debug, Default)]
pub struct RecordingHook {
    scheduled: Mutex<Vec<ScheduledInjection>>,
}

impl RecordingHook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain everything scheduled so far.
    pub fn take(&self) -> Vec<ScheduledInjection> {
        std::mem::take(&mut *lock(&self.scheduled))
    }
}

impl DeliveryHook for RecordingHook {
    fn schedule(&self, injection: ScheduledInjection) {
        lock(&self.scheduled).push(injection);
    }
}

/// File-backed loop store inside a fresh temp dir. Keep the `TempDir` alive.
pub fn temp_loop_store() -> (TempDir, FileLoopStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileLoopStore::new(dir.path().join(".persevere/loop-state.md"));
    (dir, store)
}
