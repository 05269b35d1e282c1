//! Iteration loop state machine.
//!
//! A loop is started once (explicitly or through an `<iterate>` tag), then
//! every idle event of the owning session asks the completion evaluator
//! whether the task is done. Not done: bump the persisted iteration and send
//! the evaluator's feedback as the next prompt. Done, cancelled, or out of
//! iterations: clear the record.
//!
//! ```text
//! NoLoop -> Active(k) -> Active(k+1) | Completed | Cancelled | MaxIterationsStopped
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::codename::generate_codename;
use crate::core::echo::InjectionSource;
use crate::core::loop_tag::parse_loop_tag;
use crate::core::types::{EvaluationRequest, ToastVariant, Verdict, render_transcript};
use crate::delivery::{Delivery, ScheduledInjection};
use crate::io::config::PluginConfig;
use crate::io::evaluator::CompletionEvaluator;
use crate::io::loop_state::{LoopState, LoopStateStore};
use crate::io::prompt::PromptRenderer;
use crate::notify::Notifier;

/// Idle events closer together than this collapse into one iteration.
pub const ITERATION_DEBOUNCE: Duration = Duration::from_secs(3);

/// How long a session error suspends the loop.
pub const RECOVERY_WINDOW: Duration = Duration::from_secs(5);

/// Rejections reported to callers of the explicit loop operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    #[error("an iteration loop is already active (session {session_id})")]
    AlreadyActive { session_id: String },
    #[error("no active iteration loop")]
    NoActiveLoop,
    #[error("the active iteration loop belongs to session {owner}")]
    SessionMismatch { owner: String },
    #[error("loop state storage failed: {0}")]
    Storage(String),
}

impl LoopError {
    fn storage(err: anyhow::Error) -> Self {
        LoopError::Storage(format!("{err:#}"))
    }
}

/// Outcome of [`IterationLoop::complete_loop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopCompletion {
    pub iterations: u32,
    pub summary: Option<String>,
    pub codename: String,
}

/// A user prompt after loop-tag processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedPrompt {
    pub text: String,
    /// The loop started by this prompt, if any.
    pub started: Option<LoopState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationSettings {
    pub default_max_iterations: u32,
    pub transcript_limit: usize,
}

impl IterationSettings {
    pub fn from_config(cfg: &PluginConfig) -> Self {
        Self {
            default_max_iterations: cfg.default_max_iterations,
            transcript_limit: cfg.transcript_limit,
        }
    }
}

impl Default for IterationSettings {
    fn default() -> Self {
        Self::from_config(&PluginConfig::default())
    }
}

#[derive(Debug, Default)]
struct SessionIterationGuard {
    /// Generation of the idle handler currently holding the session.
    in_progress: Option<u64>,
    recovering_until: Option<Instant>,
    last_iteration_at: Option<Instant>,
    /// Delegated continuation not yet injected.
    pending: Option<CancellationToken>,
}

impl SessionIterationGuard {
    fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}

struct IterationInner {
    notifier: Notifier,
    renderer: Arc<PromptRenderer>,
    delivery: Delivery,
    store: Arc<dyn LoopStateStore>,
    evaluator: Option<Arc<dyn CompletionEvaluator>>,
    settings: IterationSettings,
    guards: Mutex<HashMap<String, SessionIterationGuard>>,
    next_generation: AtomicU64,
}

impl IterationInner {
    fn guards(&self) -> MutexGuard<'_, HashMap<String, SessionIterationGuard>> {
        self.guards.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the per-session lock when an idle handler finishes, however it exits.
struct IterationPermit {
    inner: Arc<IterationInner>,
    session_id: String,
    generation: u64,
}

impl Drop for IterationPermit {
    fn drop(&mut self) {
        let mut guards = self.inner.guards();
        if let Some(guard) = guards.get_mut(&self.session_id)
            && guard.in_progress == Some(self.generation)
        {
            guard.in_progress = None;
        }
    }
}

/// The iteration loop. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct IterationLoop {
    inner: Arc<IterationInner>,
}

impl IterationLoop {
    pub fn new(
        notifier: Notifier,
        renderer: Arc<PromptRenderer>,
        delivery: Delivery,
        store: Arc<dyn LoopStateStore>,
        evaluator: Option<Arc<dyn CompletionEvaluator>>,
        settings: IterationSettings,
    ) -> Self {
        Self {
            inner: Arc::new(IterationInner {
                notifier,
                renderer,
                delivery,
                store,
                evaluator,
                settings,
                guards: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Start a loop owned by `session_id`. `None` or zero `max_iterations`
    /// falls back to the configured default.
    pub fn start_loop(
        &self,
        session_id: &str,
        prompt: &str,
        max_iterations: Option<u32>,
    ) -> Result<LoopState, LoopError> {
        if let Some(existing) = self.inner.store.read().map_err(LoopError::storage)?
            && existing.active
        {
            return Err(LoopError::AlreadyActive {
                session_id: existing.session_id,
            });
        }
        let max_iterations = max_iterations
            .filter(|max| *max > 0)
            .unwrap_or(self.inner.settings.default_max_iterations);
        let state = LoopState::start(session_id, prompt.trim(), max_iterations, &generate_codename());
        self.inner
            .store
            .write(&state)
            .map_err(LoopError::storage)?;
        info!(
            session_id,
            codename = %state.completion_marker,
            max_iterations,
            "iteration loop started"
        );
        Ok(state)
    }

    /// Stop the loop without completing it.
    pub async fn cancel_loop(&self, session_id: &str) -> Result<LoopState, LoopError> {
        let state = self.owned_state(session_id)?;
        self.inner.store.clear().map_err(LoopError::storage)?;
        self.cancel_pending(session_id);
        info!(session_id, iteration = state.iteration, "iteration loop cancelled");
        self.inner
            .notifier
            .toast(
                &format!("Loop {} cancelled", state.completion_marker),
                &format!("Stopped at iteration {}/{}.", state.iteration, state.max_iterations),
                ToastVariant::Warning,
            )
            .await;
        Ok(state)
    }

    /// Canonical success path. Any evaluation still in flight for this run is
    /// discarded when it returns.
    pub async fn complete_loop(
        &self,
        session_id: &str,
        summary: Option<String>,
    ) -> Result<LoopCompletion, LoopError> {
        let state = self.owned_state(session_id)?;
        self.inner.store.clear().map_err(LoopError::storage)?;
        self.cancel_pending(session_id);
        let summary = summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        info!(session_id, iteration = state.iteration, "iteration loop completed");

        let mut message = format!("Finished after {}.", iterations_label(state.iteration));
        if let Some(summary) = &summary {
            message.push(' ');
            message.push_str(summary);
        }
        self.inner
            .notifier
            .status(
                session_id,
                InjectionSource::Iteration,
                &format!("Loop {} complete", state.completion_marker),
                &message,
                ToastVariant::Success,
            )
            .await;
        Ok(LoopCompletion {
            iterations: state.iteration,
            summary,
            codename: state.completion_marker,
        })
    }

    /// The persisted loop, if one is active.
    pub fn status(&self) -> Result<Option<LoopState>, LoopError> {
        Ok(self
            .inner
            .store
            .read()
            .map_err(LoopError::storage)?
            .filter(|state| state.active))
    }

    /// Evaluate the loop owned by an idle session and continue or stop it.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn on_session_idle(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        let _permit = match self.try_acquire(session_id) {
            Ok(permit) => permit,
            Err(reason) => {
                debug!(reason, "iteration skipped");
                return;
            }
        };

        let state = match self.inner.store.read() {
            Ok(Some(state)) if state.active && state.session_id == session_id => state,
            Ok(_) => return,
            Err(err) => {
                warn!(error = %err, "read loop state failed");
                return;
            }
        };

        let Some(evaluator) = self.inner.evaluator.clone() else {
            self.stop_unconfigured(&state).await;
            return;
        };

        let transcript = match self
            .inner
            .notifier
            .host()
            .fetch_transcript(session_id, self.inner.settings.transcript_limit)
            .await
        {
            Ok(entries) => render_transcript(&entries),
            Err(err) => {
                warn!(error = %err, "fetch transcript failed, evaluating without it");
                String::new()
            }
        };
        let request = EvaluationRequest {
            session_id: session_id.to_string(),
            iteration: state.iteration,
            max_iterations: state.max_iterations,
            prompt: state.prompt.clone(),
            transcript,
        };
        debug!(iteration = state.iteration, "evaluating iteration");
        let verdict = match evaluator.evaluate(&request).await {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(error = %err, "completion evaluator failed, retrying on next idle");
                self.inner
                    .notifier
                    .toast(
                        "Iteration loop",
                        "Completion check failed; retrying on the next idle.",
                        ToastVariant::Warning,
                    )
                    .await;
                return;
            }
        };

        // complete_loop or cancel_loop may have run during evaluation.
        let current = match self.inner.store.read() {
            Ok(Some(current))
                if current.active
                    && current.same_run(&state)
                    && current.iteration == state.iteration =>
            {
                current
            }
            Ok(_) => {
                debug!("loop changed during evaluation, discarding verdict");
                return;
            }
            Err(err) => {
                warn!(error = %err, "re-read loop state failed");
                return;
            }
        };

        if verdict.is_complete {
            self.finish_complete(&current, &verdict).await;
        } else if current.iteration >= current.max_iterations {
            self.finish_exhausted(&current, &verdict).await;
        } else {
            self.continue_loop(&current, &verdict).await;
        }
    }

    /// A new assistant turn means the last iteration's work has started.
    pub fn on_assistant_message(&self, session_id: &str) {
        if let Some(guard) = self.inner.guards().get_mut(session_id) {
            guard.in_progress = None;
        }
    }

    /// Suspend the loop for [`RECOVERY_WINDOW`].
    pub fn on_session_error(&self, session_id: &str) {
        let mut guards = self.inner.guards();
        let guard = guards.entry(session_id.to_string()).or_default();
        guard.recovering_until = Some(Instant::now() + RECOVERY_WINDOW);
        guard.cancel_pending();
        debug!(session_id, "iteration loop recovering");
    }

    pub fn on_session_deleted(&self, session_id: &str) {
        if let Some(mut guard) = self.inner.guards().remove(session_id) {
            guard.cancel_pending();
        }
        match self.inner.store.read() {
            Ok(Some(state)) if state.session_id == session_id => {
                if let Err(err) = self.inner.store.clear() {
                    warn!(session_id, error = %err, "clear loop state of deleted session failed");
                } else {
                    info!(session_id, "deleted session owned the loop, cleared");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(session_id, error = %err, "read loop state failed"),
        }
    }

    /// Start a loop from an `<iterate>` tag in a user prompt and rewrite the
    /// prompt to announce it. Prompts without a tag pass through unchanged.
    pub async fn process_prompt(&self, session_id: &str, raw: &str) -> ProcessedPrompt {
        let Some(tag) = parse_loop_tag(raw) else {
            return ProcessedPrompt {
                text: raw.to_string(),
                started: None,
            };
        };

        match self.start_loop(session_id, &tag.task, tag.max_iterations) {
            Ok(state) => {
                let text = self
                    .inner
                    .renderer
                    .loop_started(&state, &tag.remainder)
                    .unwrap_or_else(|err| {
                        warn!(session_id, error = %err, "render loop start failed");
                        tag.task.clone()
                    });
                self.inner
                    .notifier
                    .toast(
                        &format!("Loop {} started", state.completion_marker),
                        &format!("Up to {} iterations.", state.max_iterations),
                        ToastVariant::Info,
                    )
                    .await;
                ProcessedPrompt {
                    text,
                    started: Some(state),
                }
            }
            Err(err) => {
                warn!(session_id, error = %err, "loop tag ignored");
                let mut parts: Vec<&str> = Vec::new();
                if !tag.remainder.is_empty() {
                    parts.push(&tag.remainder);
                }
                parts.push(&tag.task);
                let note = format!("[Iteration loop not started: {err}]");
                parts.push(&note);
                ProcessedPrompt {
                    text: parts.join("\n\n"),
                    started: None,
                }
            }
        }
    }

    fn try_acquire(&self, session_id: &str) -> Result<IterationPermit, &'static str> {
        let mut guards = self.inner.guards();
        let guard = guards.entry(session_id.to_string()).or_default();
        if guard.in_progress.is_some() {
            return Err("iteration in progress");
        }
        if guard.pending.is_some() {
            return Err("continuation awaiting delivery");
        }
        let now = Instant::now();
        if guard.recovering_until.is_some_and(|until| now < until) {
            return Err("recovering");
        }
        if guard
            .last_iteration_at
            .is_some_and(|at| now.duration_since(at) < ITERATION_DEBOUNCE)
        {
            return Err("debounced");
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        guard.in_progress = Some(generation);
        Ok(IterationPermit {
            inner: self.inner.clone(),
            session_id: session_id.to_string(),
            generation,
        })
    }

    fn mark_iteration(&self, session_id: &str) {
        let mut guards = self.inner.guards();
        guards.entry(session_id.to_string()).or_default().last_iteration_at = Some(Instant::now());
    }

    fn cancel_pending(&self, session_id: &str) {
        if let Some(guard) = self.inner.guards().get_mut(session_id) {
            guard.cancel_pending();
        }
    }

    fn owned_state(&self, session_id: &str) -> Result<LoopState, LoopError> {
        let state = self
            .inner
            .store
            .read()
            .map_err(LoopError::storage)?
            .filter(|state| state.active)
            .ok_or(LoopError::NoActiveLoop)?;
        if state.session_id != session_id {
            return Err(LoopError::SessionMismatch {
                owner: state.session_id,
            });
        }
        Ok(state)
    }

    fn clear_store(&self, state: &LoopState) -> bool {
        match self.inner.store.clear() {
            Ok(_) => true,
            Err(err) => {
                warn!(session_id = %state.session_id, error = %err, "clear loop state failed");
                false
            }
        }
    }

    async fn stop_unconfigured(&self, state: &LoopState) {
        warn!(session_id = %state.session_id, "no completion evaluator configured, stopping loop");
        self.clear_store(state);
        self.inner
            .notifier
            .status(
                &state.session_id,
                InjectionSource::Iteration,
                &format!("Loop {} stopped", state.completion_marker),
                "No completion evaluator is configured, so the loop can never finish. Configure one and start again.",
                ToastVariant::Error,
            )
            .await;
    }

    async fn finish_complete(&self, state: &LoopState, verdict: &Verdict) {
        if !self.clear_store(state) {
            return;
        }
        info!(
            session_id = %state.session_id,
            iteration = state.iteration,
            "evaluator judged the loop complete"
        );
        let mut message = format!("Finished after {}.", iterations_label(state.iteration));
        if !verdict.feedback.trim().is_empty() {
            message.push(' ');
            message.push_str(verdict.feedback.trim());
        }
        self.inner
            .notifier
            .status(
                &state.session_id,
                InjectionSource::Iteration,
                &format!("Loop {} complete", state.completion_marker),
                &message,
                ToastVariant::Success,
            )
            .await;
    }

    async fn finish_exhausted(&self, state: &LoopState, verdict: &Verdict) {
        if !self.clear_store(state) {
            return;
        }
        info!(
            session_id = %state.session_id,
            max_iterations = state.max_iterations,
            "max iterations reached"
        );
        let mut message = format!(
            "Max iterations reached ({}/{}) without completion.",
            state.iteration, state.max_iterations
        );
        if !verdict.feedback.trim().is_empty() {
            message.push_str(" Last feedback: ");
            message.push_str(verdict.feedback.trim());
        }
        self.inner
            .notifier
            .status(
                &state.session_id,
                InjectionSource::Iteration,
                &format!("Loop {} stopped", state.completion_marker),
                &message,
                ToastVariant::Warning,
            )
            .await;
    }

    async fn continue_loop(&self, state: &LoopState, verdict: &Verdict) {
        let next = match self.inner.store.increment_iteration() {
            Ok(Some(next)) => next,
            Ok(None) => {
                debug!(session_id = %state.session_id, "loop vanished before increment");
                return;
            }
            Err(err) => {
                warn!(session_id = %state.session_id, error = %err, "increment iteration failed");
                return;
            }
        };
        let text = match self.inner.renderer.iteration_continuation(&next, verdict) {
            Ok(text) => text,
            Err(err) => {
                warn!(session_id = %next.session_id, error = %err, "render iteration continuation failed");
                return;
            }
        };
        info!(
            session_id = %next.session_id,
            iteration = next.iteration,
            max_iterations = next.max_iterations,
            "continuing iteration loop"
        );

        match &self.inner.delivery {
            Delivery::Direct => self.send_continuation(&next, text).await,
            Delivery::Delegated(hook) => {
                let token = CancellationToken::new();
                {
                    let mut guards = self.inner.guards();
                    let guard = guards.entry(next.session_id.clone()).or_default();
                    guard.cancel_pending();
                    guard.pending = Some(token.clone());
                }
                let this = self.clone();
                let expected = next.clone();
                hook.schedule(ScheduledInjection::new(
                    next.session_id.clone(),
                    InjectionSource::Iteration,
                    Duration::ZERO,
                    token,
                    Box::pin(async move { this.inject_delegated(&expected, text).await }),
                ));
            }
        }
    }

    async fn inject_delegated(&self, expected: &LoopState, text: String) {
        let still_current = matches!(
            self.inner.store.read(),
            Ok(Some(current)) if current.active
                && current.same_run(expected)
                && current.iteration == expected.iteration
        );
        if !still_current {
            debug!(session_id = %expected.session_id, "loop moved on before delegated injection");
            return;
        }
        if let Some(guard) = self.inner.guards().get_mut(&expected.session_id) {
            guard.pending = None;
        }
        self.send_continuation(expected, text).await;
    }

    /// Deliver the next iteration's prompt. The debounce window starts once it
    /// is delivered.
    async fn send_continuation(&self, state: &LoopState, text: String) {
        match self
            .inner
            .notifier
            .send_continuation(&state.session_id, InjectionSource::Iteration, text)
            .await
        {
            Ok(()) => self.mark_iteration(&state.session_id),
            Err(err) => {
                warn!(session_id = %state.session_id, error = %err, "iteration continuation failed");
            }
        }
    }
}

fn iterations_label(count: u32) -> String {
    if count == 1 {
        "1 iteration".to_string()
    } else {
        format!("{count} iterations")
    }
}
