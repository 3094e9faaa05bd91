use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::execution::listener::fire_isolated;
use crate::execution::{CancelListener, ListenerId, ListenerSet};
use crate::models::CoreError;

/// Receives the terminal outcome of an invocation. At most one method is ever called.
pub trait InvocationResultCallback: Send + Sync {
    fn finished(&self, result: Value);

    fn exception(&self, error: CoreError);

    fn timeout(&self);
}

/// A result callback that can also be canceled by its owner. Cancel listeners are how
/// the correlation layer learns that it must tell the server to stop.
pub trait InvocationCallback: InvocationResultCallback {
    fn add_cancel_listener(&self, listener: CancelListener) -> ListenerId;

    fn remove_cancel_listener(&self, id: ListenerId) -> bool;
}

/// Interim progress pushed before the terminal outcome.
pub trait InterimResponseCallback: Send + Sync {
    fn do_response(&self, response: Value);
}

/// Interim question pushed before the terminal outcome; the answer goes to `reply`.
pub trait InterimRequestCallback: Send + Sync {
    fn do_request(&self, reply: Arc<dyn InterimResponseCallback>, request: Value);
}

impl<F> InterimResponseCallback for F
where
    F: Fn(Value) + Send + Sync,
{
    fn do_response(&self, response: Value) {
        self(response)
    }
}

impl<F> InterimRequestCallback for F
where
    F: Fn(Arc<dyn InterimResponseCallback>, Value) + Send + Sync,
{
    fn do_request(&self, reply: Arc<dyn InterimResponseCallback>, request: Value) {
        self(reply, request)
    }
}

/// Discards interim progress.
pub struct IgnoreProgress;

impl InterimResponseCallback for IgnoreProgress {
    fn do_response(&self, _response: Value) {}
}

/// Leaves interim questions unanswered.
pub struct IgnoreQuestions;

impl InterimRequestCallback for IgnoreQuestions {
    fn do_request(&self, _reply: Arc<dyn InterimResponseCallback>, request: Value) {
        tracing::debug!(request = %request, "interim question ignored");
    }
}

/// One-shot cancellation source that callback implementations embed to satisfy the
/// cancel half of [`InvocationCallback`].
#[derive(Default)]
pub struct CancelSource {
    canceled: AtomicBool,
    listeners: ListenerSet<dyn Fn() + Send + Sync>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Returns `false` when the source had already fired.
    pub fn cancel(&self) -> bool {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.listeners.drain_fire(|listener| listener());
        true
    }

    /// A listener added after the source fired runs immediately on the calling thread.
    pub fn add_listener(&self, listener: CancelListener) -> ListenerId {
        let id = self.listeners.add(listener.clone());
        // Whoever removes the entry fires it: either the drain in `cancel` or this check.
        if self.is_canceled() && self.listeners.remove(id) {
            fire_isolated(|| listener());
        }
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
