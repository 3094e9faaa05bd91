use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;

use crate::execution::{CancelListener, ExecutionTask, ListenerId};
use crate::invocation::client::timeout_error;
use crate::invocation::{CancelSource, InvocationCallback, InvocationResultCallback};
use crate::models::{CoreError, CoreResult};

/// Blocking adapter over the callback protocol: hand it to an invocation as the result
/// callback, then park on [`SyncInvocation::result_sync`].
///
/// Only the first terminal outcome is kept. Canceling through [`SyncInvocation::cancel`]
/// or a linked execution counts as an outcome: waiters receive a `Cancelled` error and
/// the invocation's cancel listeners are fired.
#[derive(Default)]
pub struct SyncInvocation {
    outcome: Mutex<Option<CoreResult<Value>>>,
    ready: Condvar,
    cancel_source: CancelSource,
}

impl SyncInvocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until an outcome arrives. `wait` bounds the wait itself and is separate
    /// from the invocation timeout; `None` waits indefinitely.
    ///
    /// Must not be called on a thread that drives the runtime delivering the outcome.
    pub fn result_sync(&self, wait: Option<Duration>) -> CoreResult<Value> {
        let outcome = self.lock();
        let outcome = match wait {
            None => self
                .ready
                .wait_while(outcome, |outcome| outcome.is_none())
                .unwrap_or_else(PoisonError::into_inner),
            Some(wait) => {
                let (outcome, timed_out) = self
                    .ready
                    .wait_timeout_while(outcome, wait, |outcome| outcome.is_none())
                    .unwrap_or_else(PoisonError::into_inner);
                if timed_out.timed_out() && outcome.is_none() {
                    return Err(timeout_error(
                        None,
                        &format!("no result within {} ms", wait.as_millis()),
                    ));
                }
                outcome
            }
        };

        outcome.clone().unwrap_or_else(|| {
            Err(CoreError::new(
                crate::models::CoreErrorKind::Internal,
                "woken without an outcome",
            ))
        })
    }

    pub fn is_done(&self) -> bool {
        self.lock().is_some()
    }

    pub fn cancel(&self) {
        if self.complete(Err(CoreError::cancelled("invocation canceled"))) {
            tracing::debug!("synchronous invocation canceled");
        }
        self.cancel_source.cancel();
    }

    /// Cancels this invocation whenever `task` is canceled.
    pub fn link_execution(self: &Arc<Self>, task: &ExecutionTask) -> ListenerId {
        let bridge: Weak<Self> = Arc::downgrade(self);
        task.add_cancel_listener(Arc::new(move || {
            if let Some(bridge) = bridge.upgrade() {
                bridge.cancel();
            }
        }))
    }

    fn complete(&self, outcome: CoreResult<Value>) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.ready.notify_all();
        true
    }

    fn lock(&self) -> MutexGuard<'_, Option<CoreResult<Value>>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InvocationResultCallback for SyncInvocation {
    fn finished(&self, result: Value) {
        self.complete(Ok(result));
    }

    fn exception(&self, error: CoreError) {
        self.complete(Err(error));
    }

    fn timeout(&self) {
        let error = timeout_error(None, "invocation timed out");
        self.complete(Err(error));
    }
}

impl InvocationCallback for SyncInvocation {
    fn add_cancel_listener(&self, listener: CancelListener) -> ListenerId {
        self.cancel_source.add_listener(listener)
    }

    fn remove_cancel_listener(&self, id: ListenerId) -> bool {
        self.cancel_source.remove_listener(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::SyncInvocation;
    use crate::invocation::InvocationResultCallback;
    use crate::models::{CoreError, CoreErrorKind};

    #[test]
    fn first_outcome_wins() {
        let bridge = SyncInvocation::new();
        bridge.finished(json!(1));
        bridge.exception(CoreError::new(CoreErrorKind::Remote, "late"));
        bridge.timeout();

        assert_eq!(bridge.result_sync(None).unwrap(), json!(1));
    }

    #[test]
    fn bounded_wait_reports_timeout() {
        let bridge = SyncInvocation::new();
        let error = bridge
            .result_sync(Some(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Timeout);
        assert!(!bridge.is_done());
    }

    #[test]
    fn waiter_on_other_thread_is_woken() {
        let bridge = Arc::new(SyncInvocation::new());
        let waiter = std::thread::spawn({
            let bridge = bridge.clone();
            move || bridge.result_sync(Some(Duration::from_secs(5)))
        });

        std::thread::sleep(Duration::from_millis(20));
        bridge.finished(json!("done"));
        assert_eq!(waiter.join().unwrap().unwrap(), json!("done"));
    }
}
