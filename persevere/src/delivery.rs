//! How a decided injection reaches the session.
//!
//! With [`Delivery::Direct`] the scheduler owns the wait and sends the prompt
//! itself. With [`Delivery::Delegated`] it hands a [`ScheduledInjection`] to a
//! [`DeliveryHook`] and keeps only the cancellation token; the hook decides
//! when to call [`ScheduledInjection::inject`]. Both modes share one
//! cancellation contract: once the token is cancelled, injecting does nothing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::core::echo::InjectionSource;

/// A pending injection handed to a delivery hook.
pub struct ScheduledInjection {
    pub session_id: String,
    pub source: InjectionSource,
    /// How long the scheduler would have waited in direct mode.
    pub delay: Duration,
    token: CancellationToken,
    action: BoxFuture<'static, ()>,
}

impl ScheduledInjection {
    pub fn new(
        session_id: String,
        source: InjectionSource,
        delay: Duration,
        token: CancellationToken,
        action: BoxFuture<'static, ()>,
    ) -> Self {
        Self {
            session_id,
            source,
            delay,
            token,
            action,
        }
    }

    /// Token cancelled when the scheduler abandons this injection.
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run the injection. Returns `false` without acting if it was cancelled.
    ///
    /// The action re-checks scheduler state, so a stale handle is harmless.
    pub async fn inject(self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.action.await;
        true
    }
}

impl fmt::Debug for ScheduledInjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledInjection")
            .field("session_id", &self.session_id)
            .field("source", &self.source)
            .field("delay", &self.delay)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Receives injections in delegated mode.
pub trait DeliveryHook: Send + Sync {
    fn schedule(&self, injection: ScheduledInjection);
}

#[derive(Clone, Default)]
pub enum Delivery {
    #[default]
    Direct,
    Delegated(Arc<dyn DeliveryHook>),
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Direct => f.write_str("Direct"),
            Delivery::Delegated(_) => f.write_str("Delegated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_injection(counter: Arc<AtomicUsize>) -> (ScheduledInjection, CancellationToken) {
        let token = CancellationToken::new();
        let injection = ScheduledInjection::new(
            "s1".to_string(),
            InjectionSource::Todo,
            Duration::from_secs(2),
            token.clone(),
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (injection, token)
    }

    #[tokio::test]
    async fn inject_runs_action_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (injection, _token) = counting_injection(counter.clone());
        assert!(injection.inject().await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_injection_is_a_no_op() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (injection, token) = counting_injection(counter.clone());
        token.cancel();
        assert!(injection.is_cancelled());
        assert!(!injection.inject().await);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
