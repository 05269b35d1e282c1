//! Delegated delivery: the host owns the wait.
//!
//! Each scheduled injection is announced with a `schedule` line carrying an
//! opaque token. The host answers with `inject` when it is ready. If the
//! scheduler cancels first, an `unschedule` line retracts the token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use persevere::delivery::{DeliveryHook, ScheduledInjection};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{Outbound, Outbox};

struct Scheduled {
    injection: ScheduledInjection,
    /// Stops the cancellation watcher once the injection is handed back.
    claimed: CancellationToken,
}

type ScheduledMap = Arc<Mutex<HashMap<String, Scheduled>>>;

fn lock(map: &ScheduledMap) -> MutexGuard<'_, HashMap<String, Scheduled>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct HostDeliveryHook {
    outbox: Outbox,
    scheduled: ScheduledMap,
    next_token: AtomicU64,
}

impl HostDeliveryHook {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
        }
    }

    /// Fire the injection behind `token`. Returns `false` for unknown tokens.
    pub fn inject(&self, token: &str) -> bool {
        let Some(entry) = lock(&self.scheduled).remove(token) else {
            debug!(token, "inject for unknown or retracted token");
            return false;
        };
        entry.claimed.cancel();
        let token = token.to_string();
        tokio::spawn(async move {
            if !entry.injection.inject().await {
                debug!(token, "injection cancelled before it fired");
            }
        });
        true
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        lock(&self.scheduled).len()
    }
}

impl DeliveryHook for HostDeliveryHook {
    fn schedule(&self, injection: ScheduledInjection) {
        let token = format!("inj-{}", self.next_token.fetch_add(1, Ordering::Relaxed));
        let cancelled = injection.cancellation();
        let claimed = CancellationToken::new();
        let announce = Outbound::Schedule {
            token: token.clone(),
            session_id: injection.session_id.clone(),
            kind: injection.source.as_str(),
            delay_ms: u64::try_from(injection.delay.as_millis()).unwrap_or(u64::MAX),
        };
        lock(&self.scheduled).insert(
            token.clone(),
            Scheduled {
                injection,
                claimed: claimed.clone(),
            },
        );
        if self.outbox.send(announce).is_err() {
            lock(&self.scheduled).remove(&token);
            return;
        }

        let scheduled = self.scheduled.clone();
        let outbox = self.outbox.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    if lock(&scheduled).remove(&token).is_some() {
                        let _ = outbox.send(Outbound::Unschedule { token });
                    }
                }
                _ = claimed.cancelled() => {}
            }
        });
    }
}
