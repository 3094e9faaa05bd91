use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned on subscription, used to unsubscribe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ListenerId(pub u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cancellation callback shared by execution tasks, invocation callbacks and the
/// server-side cancel registry.
pub type CancelListener = Arc<dyn Fn() + Send + Sync>;

/// Subscribe/unsubscribe observer list. Listeners are always invoked outside the
/// internal lock, and a panicking listener never prevents the others from running.
pub struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId::next();
        self.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(candidate, _)| *candidate != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn fire(&self, mut notify: impl FnMut(&L)) {
        for listener in self.snapshot() {
            fire_isolated(|| notify(listener.as_ref()));
        }
    }

    /// Fires every listener and empties the set in one step, for one-shot events.
    pub fn drain_fire(&self, mut notify: impl FnMut(&L)) {
        let drained: Vec<_> = std::mem::take(&mut *self.lock());
        for (_, listener) in drained {
            fire_isolated(|| notify(listener.as_ref()));
        }
    }

    fn snapshot(&self) -> Vec<Arc<L>> {
        self.lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Arc<L>)>> {
        // A listener never runs under this lock, so poisoning only means another
        // thread panicked mid-push; the vector is still consistent.
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn fire_isolated(notify: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(notify)) {
        tracing::warn!(panic = %panic_message(panic.as_ref()), "listener panicked during notification");
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{CancelListener, ListenerSet};

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let set: ListenerSet<dyn Fn() + Send + Sync> = ListenerSet::new();
        let calls = Arc::new(AtomicUsize::new(0));

        set.add(Arc::new(|| -> () { panic!("boom") }) as CancelListener);
        set.add(Arc::new({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        }) as CancelListener);

        set.fire(|listener| listener());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_is_not_notified() {
        let set: ListenerSet<dyn Fn() + Send + Sync> = ListenerSet::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let id = set.add(Arc::new({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        }) as CancelListener);

        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.fire(|listener| listener());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drain_fire_notifies_once() {
        let set: ListenerSet<dyn Fn() + Send + Sync> = ListenerSet::new();
        let calls = Arc::new(AtomicUsize::new(0));
        set.add(Arc::new({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        }) as CancelListener);

        set.drain_fire(|listener| listener());
        set.drain_fire(|listener| listener());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }
}
