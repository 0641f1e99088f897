//! Pending RPC call tracking.
//!
//! Maps correlation ids to in-flight `execute` calls: the reply channel
//! the caller awaits and the fire-once timer racing against resolution.
//! Whichever settles first removes the entry; the loser is silently
//! ignored, so duplicate and late replies are tolerated rather than
//! fatal.
//!
//! The tracker also reports active-count transitions. A 0 to 1
//! transition tells the driver to start its response-channel listener;
//! the return to 0 tells it the listener may stop. Backends where
//! listening has a polling or resource cost only keep the channel open
//! while calls are actually outstanding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is a best-effort pending-call map with no
/// invariants spanning multiple fields; the worst outcome of ignoring a
/// poisoned lock is a dropped or unmatched reply. This also avoids
/// propagating non-`Send` poison errors across async boundaries.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Observer of pending-call count transitions.
pub(crate) trait RpcActivityHook: Send + Sync {
    /// Count transitioned 0 to 1.
    fn on_first_call(&self);
    /// Count returned to 0.
    fn on_last_call_settled(&self);
}

/// One in-flight RPC call.
struct PendingRpcCall {
    route: String,
    created_at: Instant,
    reply_tx: oneshot::Sender<Result<Value>>,
    timer: JoinHandle<()>,
}

/// Handle awaited by the `execute` caller.
pub(crate) struct RpcHandle {
    rx: oneshot::Receiver<Result<Value>>,
}

impl RpcHandle {
    /// Wait for resolution: reply value, remote failure, timeout, or
    /// disposal.
    pub async fn wait(self) -> Result<Value> {
        // A dropped sender means the tracker went away wholesale.
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Disposed),
        }
    }
}

/// Tracker of pending RPC calls, owned exclusively by one transport.
pub(crate) struct RpcCallTracker {
    calls: Mutex<HashMap<String, PendingRpcCall>>,
    hook: Mutex<Option<Arc<dyn RpcActivityHook>>>,
    /// Weak self-handle for the timer tasks, so an expiring timer never
    /// keeps a dropped tracker alive.
    weak_self: Weak<RpcCallTracker>,
}

impl RpcCallTracker {
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new_cyclic(|weak| Self {
            calls: Mutex::new(HashMap::new()),
            hook: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    /// Wire the activity observer. Set once by the transport core before
    /// any call is registered.
    pub fn set_hook(&self, hook: Arc<dyn RpcActivityHook>) {
        *lock_ignore_poison(&self.hook) = Some(hook);
    }

    /// Register a pending call and start its timeout timer.
    ///
    /// If nothing resolves the call before the timer fires, the caller
    /// is rejected with [`Error::RpcTimeout`] and the entry removed.
    pub fn register(&self, correlation_id: &str, route: &str, timeout: Duration) -> RpcHandle {
        // ---
        let (reply_tx, rx) = oneshot::channel();

        let timer = tokio::spawn({
            let tracker = self.weak_self.clone();
            let correlation_id = correlation_id.to_string();
            let route = route.to_string();

            async move {
                tokio::time::sleep(timeout).await;
                if let Some(tracker) = tracker.upgrade() {
                    tracker.expire(&correlation_id, &route, timeout);
                }
            }
        });

        let activated = {
            let mut calls = lock_ignore_poison(&self.calls);
            calls.insert(
                correlation_id.to_string(),
                PendingRpcCall {
                    route: route.to_string(),
                    created_at: Instant::now(),
                    reply_tx,
                    timer,
                },
            );
            calls.len() == 1
        };

        if activated {
            self.notify(|hook| hook.on_first_call());
        }

        RpcHandle { rx }
    }

    /// Settle a pending call with a reply outcome.
    ///
    /// Returns false when no call is pending under this correlation id;
    /// duplicate or late replies land here and are dropped with a
    /// diagnostic, never an error.
    pub fn resolve(&self, correlation_id: &str, outcome: Result<Value>) -> bool {
        // ---
        let (call, drained) = self.take(correlation_id);

        match call {
            None => {
                tracing::debug!(correlation_id, "dropping reply with no pending RPC call");
                false
            }
            Some(call) => {
                call.timer.abort();
                if call.reply_tx.send(outcome).is_err() {
                    tracing::debug!(correlation_id, "reply arrived after caller went away");
                }
                if drained {
                    self.notify(|hook| hook.on_last_call_settled());
                }
                true
            }
        }
    }

    /// Remove a pending call without settling it.
    ///
    /// Used when the outbound send itself failed; the caller gets the
    /// send error instead of a reply, so the entry must not linger until
    /// its timer fires.
    pub fn discard(&self, correlation_id: &str) {
        // ---
        let (call, drained) = self.take(correlation_id);
        if let Some(call) = call {
            call.timer.abort();
            if drained {
                self.notify(|hook| hook.on_last_call_settled());
            }
        }
    }

    /// Reject every pending call with [`Error::Disposed`].
    pub fn dispose_all(&self) {
        // ---
        let settled: Vec<PendingRpcCall> = {
            let mut calls = lock_ignore_poison(&self.calls);
            calls.drain().map(|(_, call)| call).collect()
        };

        let had_any = !settled.is_empty();

        for call in settled {
            call.timer.abort();
            tracing::debug!(route = %call.route, "rejecting pending RPC call at disposal");
            let _ = call.reply_tx.send(Err(Error::Disposed));
        }

        if had_any {
            self.notify(|hook| hook.on_last_call_settled());
        }
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        lock_ignore_poison(&self.calls).contains_key(correlation_id)
    }

    /// Number of calls currently awaiting replies.
    pub fn active_count(&self) -> usize {
        lock_ignore_poison(&self.calls).len()
    }

    /// Timer expiry path: reject the caller and remove the entry.
    fn expire(&self, correlation_id: &str, route: &str, timeout: Duration) {
        // ---
        let (call, drained) = self.take(correlation_id);

        if let Some(call) = call {
            tracing::debug!(
                route,
                correlation_id,
                elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                "RPC call timed out"
            );

            let _ = call.reply_tx.send(Err(Error::RpcTimeout {
                route: route.to_string(),
                correlation_id: correlation_id.to_string(),
                timeout,
            }));

            if drained {
                self.notify(|hook| hook.on_last_call_settled());
            }
        }
    }

    fn take(&self, correlation_id: &str) -> (Option<PendingRpcCall>, bool) {
        // ---
        let mut calls = lock_ignore_poison(&self.calls);
        let call = calls.remove(correlation_id);
        let drained = call.is_some() && calls.is_empty();
        (call, drained)
    }

    fn notify(&self, f: impl Fn(&dyn RpcActivityHook)) {
        let hook = lock_ignore_poison(&self.hook).clone();
        if let Some(hook) = hook {
            f(hook.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        activated: AtomicUsize,
        drained: AtomicUsize,
    }

    impl CountingHook {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                activated: AtomicUsize::new(0),
                drained: AtomicUsize::new(0),
            })
        }
    }

    impl RpcActivityHook for CountingHook {
        fn on_first_call(&self) {
            self.activated.fetch_add(1, Ordering::SeqCst);
        }
        fn on_last_call_settled(&self) {
            self.drained.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn register_and_resolve() {
        // ---
        let tracker = RpcCallTracker::new();

        let handle = tracker.register("corr-1", "Query.Math.Add", Duration::from_secs(5));
        assert_eq!(tracker.active_count(), 1);

        assert!(tracker.resolve("corr-1", Ok(json!({"sum": 5}))));
        assert_eq!(tracker.active_count(), 0);

        assert_eq!(handle.wait().await.unwrap(), json!({"sum": 5}));
    }

    #[tokio::test]
    async fn duplicate_resolve_is_noop() {
        // ---
        let tracker = RpcCallTracker::new();

        let handle = tracker.register("corr-1", "Query.Math.Add", Duration::from_secs(5));

        assert!(tracker.resolve("corr-1", Ok(json!(1))));
        assert!(!tracker.resolve("corr-1", Ok(json!(2))));

        // First resolution wins
        assert_eq!(handle.wait().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn resolve_unknown_correlation_id_is_dropped() {
        // ---
        let tracker = RpcCallTracker::new();
        assert!(!tracker.resolve("nobody-home", Ok(json!(null))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_removes() {
        // ---
        let tracker = RpcCallTracker::new();

        let handle = tracker.register("corr-1", "Query.Slow.Op", Duration::from_millis(50));

        let err = handle.wait().await.unwrap_err();
        match err {
            Error::RpcTimeout {
                route,
                correlation_id,
                timeout,
            } => {
                assert_eq!(route, "Query.Slow.Op");
                assert_eq!(correlation_id, "corr-1");
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(tracker.active_count(), 0);
        // A reply landing after the timeout is the no-op duplicate case
        assert!(!tracker.resolve("corr-1", Ok(json!(null))));
    }

    #[tokio::test]
    async fn dispose_all_rejects_every_pending_call() {
        // ---
        let tracker = RpcCallTracker::new();

        let h1 = tracker.register("corr-1", "Query.A", Duration::from_secs(60));
        let h2 = tracker.register("corr-2", "Query.B", Duration::from_secs(60));

        tracker.dispose_all();

        assert!(matches!(h1.wait().await, Err(Error::Disposed)));
        assert!(matches!(h2.wait().await, Err(Error::Disposed)));
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn activity_transitions_fire_hook() {
        // ---
        let tracker = RpcCallTracker::new();
        let hook = CountingHook::new();
        tracker.set_hook(hook.clone());

        let _h1 = tracker.register("corr-1", "Query.A", Duration::from_secs(60));
        let _h2 = tracker.register("corr-2", "Query.B", Duration::from_secs(60));

        // Only the 0 to 1 transition activates
        assert_eq!(hook.activated.load(Ordering::SeqCst), 1);
        assert_eq!(hook.drained.load(Ordering::SeqCst), 0);

        tracker.resolve("corr-1", Ok(json!(null)));
        assert_eq!(hook.drained.load(Ordering::SeqCst), 0);

        tracker.resolve("corr-2", Ok(json!(null)));
        assert_eq!(hook.drained.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discard_drops_without_settling() {
        // ---
        let tracker = RpcCallTracker::new();
        let hook = CountingHook::new();
        tracker.set_hook(hook.clone());

        let handle = tracker.register("corr-1", "Query.A", Duration::from_secs(60));
        tracker.discard("corr-1");

        assert_eq!(tracker.active_count(), 0);
        assert_eq!(hook.drained.load(Ordering::SeqCst), 1);
        assert!(matches!(handle.wait().await, Err(Error::Disposed)));
    }
}
