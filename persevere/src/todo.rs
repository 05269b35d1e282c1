//! Todo continuation scheduler.
//!
//! When a session goes idle with incomplete todos, wait `countdown` and then
//! prompt the agent to keep going. User input, assistant activity, tool calls
//! and errors cancel a pending countdown. Per session the scheduler moves
//! through `Idle -> Counting -> (Injected | Cancelled)`.
//!
//! Handlers never return errors: host failures are logged and the next idle
//! event tries again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::echo::InjectionSource;
use crate::core::todos::summarize;
use crate::core::types::{Todo, ToastVariant};
use crate::delivery::{Delivery, ScheduledInjection};
use crate::io::config::PluginConfig;
use crate::io::prompt::PromptRenderer;
use crate::notify::Notifier;

const TOAST_TITLE: &str = "Todo continuation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoSettings {
    pub countdown: Duration,
    /// Toast once per elapsed countdown second.
    pub countdown_toasts: bool,
    pub error_cooldown: Duration,
    pub help_agent: Option<String>,
}

impl TodoSettings {
    pub fn from_config(cfg: &PluginConfig) -> Self {
        Self {
            countdown: cfg.countdown(),
            countdown_toasts: cfg.countdown_toasts,
            error_cooldown: cfg.error_cooldown(),
            help_agent: cfg.help_agent.clone(),
        }
    }
}

impl Default for TodoSettings {
    fn default() -> Self {
        Self::from_config(&PluginConfig::default())
    }
}

#[derive(Debug)]
struct Countdown {
    id: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct SessionTimerState {
    countdown: Option<Countdown>,
    is_recovering: bool,
    last_error_at: Option<Instant>,
    completion_shown: bool,
}

impl SessionTimerState {
    fn cancel_countdown(&mut self) -> bool {
        match self.countdown.take() {
            Some(countdown) => {
                countdown.token.cancel();
                true
            }
            None => false,
        }
    }

    fn suppression(&self, cooldown: Duration) -> Option<&'static str> {
        if self.is_recovering {
            return Some("recovering");
        }
        match self.last_error_at {
            Some(at) if at.elapsed() < cooldown => Some("error cooldown"),
            _ => None,
        }
    }
}

struct TodoInner {
    notifier: Notifier,
    renderer: Arc<PromptRenderer>,
    delivery: Delivery,
    settings: TodoSettings,
    sessions: Mutex<HashMap<String, SessionTimerState>>,
    next_countdown_id: AtomicU64,
}

/// Per-session countdown scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TodoScheduler {
    inner: Arc<TodoInner>,
}

impl TodoScheduler {
    pub fn new(
        notifier: Notifier,
        renderer: Arc<PromptRenderer>,
        delivery: Delivery,
        settings: TodoSettings,
    ) -> Self {
        Self {
            inner: Arc::new(TodoInner {
                notifier,
                renderer,
                delivery,
                settings,
                sessions: Mutex::new(HashMap::new()),
                next_countdown_id: AtomicU64::new(1),
            }),
        }
    }

    /// Decide whether an idle session needs a continuation.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn on_session_idle(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        if let Some(reason) = self.suppression(session_id) {
            debug!(reason, "todo continuation suppressed");
            return;
        }

        let todos = self.fetch_todos(session_id).await;
        let summary = summarize(&todos);
        if summary.incomplete == 0 {
            if summary.total > 0 {
                self.announce_completion(session_id).await;
            }
            return;
        }
        if self.has_pending_countdown(session_id) {
            debug!("countdown already running");
            return;
        }
        self.start_countdown(session_id, summary.incomplete, summary.total);
    }

    /// Start a countdown, replacing any running one for the session.
    ///
    /// A zero `incomplete` count is a no-op, and so is a session in error
    /// cooldown or recovery. The countdown re-fetches todos when it fires; the
    /// counts here only feed the progress toasts.
    pub fn start_countdown(&self, session_id: &str, incomplete: usize, total: usize) {
        if incomplete == 0 {
            return;
        }
        let id = self.inner.next_countdown_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut sessions = self.lock();
            let state = sessions.entry(session_id.to_string()).or_default();
            // An error or recovery may have landed while the caller fetched todos.
            if let Some(reason) = state.suppression(self.inner.settings.error_cooldown) {
                debug!(session_id, reason, "countdown not started");
                return;
            }
            if state.cancel_countdown() {
                debug!(session_id, "replaced running countdown");
            }
            state.countdown = Some(Countdown {
                id,
                token: token.clone(),
            });
            state.completion_shown = false;
        }
        info!(
            session_id,
            incomplete,
            total,
            countdown_secs = self.inner.settings.countdown.as_secs_f64(),
            "starting todo countdown"
        );

        let session = session_id.to_string();
        match &self.inner.delivery {
            Delivery::Direct => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.run_countdown(session, id, token, incomplete).await;
                });
            }
            Delivery::Delegated(hook) => {
                let this = self.clone();
                let target = session.clone();
                hook.schedule(ScheduledInjection::new(
                    session,
                    InjectionSource::Todo,
                    self.inner.settings.countdown,
                    token,
                    Box::pin(async move { this.fire(&target, id).await }),
                ));
            }
        }
    }

    /// Cancel a pending countdown. Safe to call when nothing is pending.
    pub fn cancel_countdown(&self, session_id: &str) {
        let mut sessions = self.lock();
        if let Some(state) = sessions.get_mut(session_id)
            && state.cancel_countdown()
        {
            debug!(session_id, "todo countdown cancelled");
        }
    }

    /// Errors invalidate any decision made before them and start the cooldown.
    pub fn on_session_error(&self, session_id: &str) {
        let mut sessions = self.lock();
        let state = sessions.entry(session_id.to_string()).or_default();
        state.last_error_at = Some(Instant::now());
        state.cancel_countdown();
        debug!(session_id, "session error recorded");
    }

    /// Fresh user input ends the error cooldown and supersedes a pending continuation.
    pub fn on_user_message(&self, session_id: &str) {
        let mut sessions = self.lock();
        let state = sessions.entry(session_id.to_string()).or_default();
        state.last_error_at = None;
        state.completion_shown = false;
        state.cancel_countdown();
    }

    pub fn on_session_deleted(&self, session_id: &str) {
        if let Some(mut state) = self.lock().remove(session_id) {
            state.cancel_countdown();
            debug!(session_id, "todo session state dropped");
        }
    }

    /// Suspend injections while a supervisor runs its own recovery.
    pub fn mark_recovering(&self, session_id: &str) {
        let mut sessions = self.lock();
        let state = sessions.entry(session_id.to_string()).or_default();
        state.is_recovering = true;
        state.cancel_countdown();
    }

    pub fn mark_recovery_complete(&self, session_id: &str) {
        let mut sessions = self.lock();
        if let Some(state) = sessions.get_mut(session_id) {
            state.is_recovering = false;
        }
    }

    pub fn has_pending_countdown(&self, session_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .is_some_and(|state| state.countdown.is_some())
    }

    async fn run_countdown(
        self,
        session_id: String,
        id: u64,
        token: CancellationToken,
        incomplete: usize,
    ) {
        let mut remaining = self.inner.settings.countdown;
        if self.inner.settings.countdown_toasts {
            while !remaining.is_zero() {
                let secs = remaining.as_secs_f64().ceil() as u64;
                self.spawn_progress_toast(
                    format!("Resuming in {secs}s ({incomplete} tasks left)"),
                    token.clone(),
                );
                let step = remaining.min(Duration::from_secs(1));
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(step) => {}
                }
                remaining -= step;
            }
        } else {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
        self.fire(&session_id, id).await;
    }

    /// Progress toasts never hold up the countdown itself.
    fn spawn_progress_toast(&self, message: String, token: CancellationToken) {
        let notifier = self.inner.notifier.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = notifier.toast(TOAST_TITLE, &message, ToastVariant::Info) => {}
            }
        });
    }

    /// Countdown elapsed (or the delivery hook triggered): re-check everything
    /// against fresh host state before sending.
    async fn fire(&self, session_id: &str, id: u64) {
        if !self.countdown_is_current(session_id, id) {
            return;
        }
        if let Some(reason) = self.suppression(session_id) {
            debug!(session_id, reason, "countdown fired while suppressed, dropping it");
            self.retire_countdown(session_id, id);
            return;
        }

        let todos = self.fetch_todos(session_id).await;
        let summary = summarize(&todos);
        if summary.incomplete == 0 {
            debug!(session_id, "todos completed during countdown");
            self.finish_countdown(session_id, id);
            return;
        }
        let text = match self
            .inner
            .renderer
            .todo_continuation(&todos, self.inner.settings.help_agent.as_deref())
        {
            Ok(text) => text,
            Err(err) => {
                warn!(session_id, error = %err, "render todo continuation failed");
                self.finish_countdown(session_id, id);
                return;
            }
        };

        // Cancellation may have landed while todos were being fetched.
        if !self.finish_countdown(session_id, id) {
            debug!(session_id, "countdown cancelled before injection");
            return;
        }
        match self
            .inner
            .notifier
            .send_continuation(session_id, InjectionSource::Todo, text)
            .await
        {
            Ok(()) => info!(
                session_id,
                incomplete = summary.incomplete,
                "todo continuation sent"
            ),
            Err(err) => warn!(session_id, error = %err, "todo continuation failed"),
        }
    }

    fn countdown_is_current(&self, session_id: &str, id: u64) -> bool {
        let sessions = self.lock();
        let Some(state) = sessions.get(session_id) else {
            return false;
        };
        state
            .countdown
            .as_ref()
            .is_some_and(|c| c.id == id && !c.token.is_cancelled())
    }

    /// Drop countdown `id` if it is still the session's current one.
    fn retire_countdown(&self, session_id: &str, id: u64) {
        let mut sessions = self.lock();
        if let Some(state) = sessions.get_mut(session_id)
            && state.countdown.as_ref().is_some_and(|c| c.id == id)
        {
            state.cancel_countdown();
        }
    }

    /// Retire countdown `id`. Returns whether it was still current and injectable.
    fn finish_countdown(&self, session_id: &str, id: u64) -> bool {
        let mut sessions = self.lock();
        let Some(state) = sessions.get_mut(session_id) else {
            return false;
        };
        let current = state
            .countdown
            .as_ref()
            .is_some_and(|c| c.id == id && !c.token.is_cancelled());
        if !current {
            return false;
        }
        state.countdown = None;
        state.suppression(self.inner.settings.error_cooldown).is_none()
    }

    fn suppression(&self, session_id: &str) -> Option<&'static str> {
        let mut sessions = self.lock();
        let state = sessions.entry(session_id.to_string()).or_default();
        state.suppression(self.inner.settings.error_cooldown)
    }

    async fn announce_completion(&self, session_id: &str) {
        {
            let mut sessions = self.lock();
            let state = sessions.entry(session_id.to_string()).or_default();
            if state.completion_shown {
                return;
            }
            state.completion_shown = true;
        }
        info!(session_id, "all todos complete");
        self.inner
            .notifier
            .status(
                session_id,
                InjectionSource::Todo,
                "All tasks complete",
                "Every item in the todo list is done.",
                ToastVariant::Success,
            )
            .await;
    }

    async fn fetch_todos(&self, session_id: &str) -> Vec<Todo> {
        match self.inner.notifier.host().fetch_todos(session_id).await {
            Ok(todos) => todos,
            Err(err) => {
                warn!(session_id, error = %err, "fetch todos failed, assuming none");
                Vec::new()
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionTimerState>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::echo::EchoTracker;
    use crate::core::types::TodoStatus;
    use crate::test_support::{RecordingHook, ScriptedHost, todo};

    fn scheduler(host: &Arc<ScriptedHost>, delivery: Delivery, toasts: bool) -> TodoScheduler {
        let cfg = PluginConfig {
            countdown_toasts: toasts,
            ..PluginConfig::default()
        };
        TodoScheduler::new(
            Notifier::new(host.clone(), Arc::new(EchoTracker::new()), &cfg),
            Arc::new(PromptRenderer::new()),
            delivery,
            TodoSettings::from_config(&cfg),
        )
    }

    fn open_todos(host: &ScriptedHost) {
        host.set_todos(
            "s1",
            vec![
                todo("1", "pending item", TodoStatus::Pending),
                todo("2", "done item", TodoStatus::Completed),
            ],
        );
    }

    /// Idle with a pending todo waits out the countdown, then prompts with only the open items.
    #[tokio::test(start_paused = true)]
    async fn idle_with_open_todos_sends_one_continuation_after_countdown() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.on_session_idle("s1").await;
        assert!(sched.has_pending_countdown("s1"));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(host.continuations().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let sent = host.continuations();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("[pending] pending item"));
        assert!(!sent[0].text.contains("done item"));
        assert!(!sched.has_pending_countdown("s1"));
    }

    /// A second idle during a countdown does not queue another prompt.
    #[tokio::test(start_paused = true)]
    async fn repeated_idle_does_not_stack_countdowns() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.on_session_idle("s1").await;
        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(host.continuations().len(), 1);
    }

    /// Typing during the countdown cancels the continuation.
    #[tokio::test(start_paused = true)]
    async fn user_message_cancels_countdown() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        sched.on_user_message("s1");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(host.continuations().is_empty());
    }

    /// Todos are re-fetched when the countdown fires.
    #[tokio::test(start_paused = true)]
    async fn todos_finished_during_countdown_send_nothing() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.on_session_idle("s1").await;
        host.set_todos("s1", vec![todo("1", "pending item", TodoStatus::Completed)]);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(host.continuations().is_empty());
    }

    /// Idles inside the error cooldown are ignored; the first idle after it prompts.
    #[tokio::test(start_paused = true)]
    async fn error_cooldown_suppresses_then_expires() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.on_session_error("s1");
        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(host.continuations().is_empty());

        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(host.continuations().len(), 1);
    }

    /// A session error aborts a countdown already running.
    #[tokio::test(start_paused = true)]
    async fn error_cancels_running_countdown() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.on_session_idle("s1").await;
        sched.on_session_error("s1");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(host.continuations().is_empty());
    }

    /// The all-done notice repeats only after the user speaks again.
    #[tokio::test(start_paused = true)]
    async fn completion_notice_is_shown_once_per_streak() {
        let host = ScriptedHost::new();
        host.set_todos("s1", vec![todo("1", "x", TodoStatus::Completed)]);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.on_session_idle("s1").await;
        sched.on_session_idle("s1").await;
        assert_eq!(host.status_messages().len(), 1);
        assert!(host.continuations().is_empty());

        sched.on_user_message("s1");
        sched.on_session_idle("s1").await;
        assert_eq!(host.status_messages().len(), 2);
    }

    /// No todos at all means no prompt and no notice.
    #[tokio::test(start_paused = true)]
    async fn empty_todo_list_is_silent() {
        let host = ScriptedHost::new();
        let sched = scheduler(&host, Delivery::Direct, false);
        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(host.prompts().is_empty());
    }

    /// Recovery blocks countdowns until it is marked complete.
    #[tokio::test(start_paused = true)]
    async fn recovering_session_is_suppressed_until_complete() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.mark_recovering("s1");
        sched.on_session_idle("s1").await;
        assert!(!sched.has_pending_countdown("s1"));

        sched.mark_recovery_complete("s1");
        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(host.continuations().len(), 1);
    }

    /// Cancelling is idempotent, including for unknown sessions.
    #[tokio::test(start_paused = true)]
    async fn cancel_countdown_twice_is_harmless() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.cancel_countdown("unknown");
        sched.on_session_idle("s1").await;
        sched.cancel_countdown("s1");
        sched.cancel_countdown("s1");
        assert!(!sched.has_pending_countdown("s1"));
    }

    /// Host failures leave no countdown behind and never panic.
    #[tokio::test(start_paused = true)]
    async fn failing_host_calls_are_swallowed() {
        let host = ScriptedHost::new();
        open_todos(&host);
        host.fail_todo_fetches(true);
        let sched = scheduler(&host, Delivery::Direct, true);

        sched.on_session_idle("s1").await;
        assert!(!sched.has_pending_countdown("s1"));

        host.fail_todo_fetches(false);
        host.fail_prompts(true);
        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(host.continuations().is_empty());
        assert!(!sched.has_pending_countdown("s1"));
    }

    /// One progress toast per remaining second.
    #[tokio::test(start_paused = true)]
    async fn countdown_toasts_once_per_second() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, true);

        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        let messages: Vec<String> = host.toasts().into_iter().map(|t| t.message).collect();
        assert_eq!(
            messages,
            vec![
                "Resuming in 2s (1 tasks left)".to_string(),
                "Resuming in 1s (1 tasks left)".to_string(),
            ]
        );
        assert_eq!(host.continuations().len(), 1);
    }

    /// Deleting a session cancels its countdown and forgets it.
    #[tokio::test(start_paused = true)]
    async fn session_deleted_discards_state() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.on_session_idle("s1").await;
        sched.on_session_deleted("s1");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(host.continuations().is_empty());
        assert!(!sched.has_pending_countdown("s1"));
    }

    /// An error landing while the idle handler fetches todos must not leave a
    /// countdown behind that blocks every later idle.
    #[tokio::test(start_paused = true)]
    async fn error_during_idle_fetch_leaves_no_stale_countdown() {
        let host = ScriptedHost::new();
        open_todos(&host);
        host.delay_todo_fetches(Duration::from_millis(100));
        let sched = scheduler(&host, Delivery::Direct, false);

        let idle = tokio::spawn({
            let sched = sched.clone();
            async move { sched.on_session_idle("s1").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sched.on_session_error("s1");
        idle.await.expect("idle handler");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!sched.has_pending_countdown("s1"));
        assert!(host.continuations().is_empty());

        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(host.continuations().len(), 1);
    }

    /// Same race with a supervisor recovery instead of an error.
    #[tokio::test(start_paused = true)]
    async fn recovery_during_idle_fetch_blocks_countdown() {
        let host = ScriptedHost::new();
        open_todos(&host);
        host.delay_todo_fetches(Duration::from_millis(100));
        let sched = scheduler(&host, Delivery::Direct, false);

        let idle = tokio::spawn({
            let sched = sched.clone();
            async move { sched.on_session_idle("s1").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sched.mark_recovering("s1");
        idle.await.expect("idle handler");
        assert!(!sched.has_pending_countdown("s1"));

        sched.mark_recovery_complete("s1");
        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(host.continuations().len(), 1);
    }

    /// A countdown requested during the error cooldown never becomes pending.
    #[tokio::test(start_paused = true)]
    async fn countdown_requested_during_cooldown_is_dropped() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let sched = scheduler(&host, Delivery::Direct, false);

        sched.on_session_error("s1");
        sched.start_countdown("s1", 1, 2);
        assert!(!sched.has_pending_countdown("s1"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(host.continuations().is_empty());

        sched.on_session_idle("s1").await;
        assert!(sched.has_pending_countdown("s1"));
    }

    /// A host that is slow to show toasts does not delay the continuation.
    #[tokio::test(start_paused = true)]
    async fn slow_toasts_do_not_stretch_countdown() {
        let host = ScriptedHost::new();
        open_todos(&host);
        host.delay_toasts(Duration::from_secs(10));
        let sched = scheduler(&host, Delivery::Direct, true);

        sched.on_session_idle("s1").await;
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(host.continuations().len(), 1);
        assert_eq!(host.toasts().len(), 2);
    }

    /// Delegated mode hands the wait to the hook; cancelled handles do nothing.
    #[tokio::test]
    async fn delegated_delivery_hands_off_and_honours_cancellation() {
        let host = ScriptedHost::new();
        open_todos(&host);
        let hook = RecordingHook::new();
        let sched = scheduler(&host, Delivery::Delegated(hook.clone()), false);

        sched.on_session_idle("s1").await;
        let mut scheduled = hook.take();
        assert_eq!(scheduled.len(), 1);
        let injection = scheduled.remove(0);
        assert_eq!(injection.delay, Duration::from_secs(2));
        assert!(injection.inject().await);
        assert_eq!(host.continuations().len(), 1);

        sched.on_session_idle("s1").await;
        let injection = hook.take().remove(0);
        sched.on_user_message("s1");
        assert!(!injection.inject().await);
        assert_eq!(host.continuations().len(), 1);
    }
}
