use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::execution::listener::fire_isolated;
use crate::execution::{CancelListener, ListenerId};
use crate::models::InvocationId;

/// Server-side cancel listeners keyed by invocation id.
///
/// An id is opened when its invocation starts and closed when the terminal outcome is
/// sent. A listener added after the id was canceled fires immediately, so a cancel that
/// overtakes the service's own registration is not lost.
#[derive(Default)]
pub struct CancelRegistry {
    entries: Mutex<HashMap<InvocationId, CancelEntry>>,
}

#[derive(Default)]
struct CancelEntry {
    canceled: bool,
    listeners: Vec<(ListenerId, CancelListener)>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, invocation_id: &InvocationId) {
        self.lock().entry(invocation_id.clone()).or_default();
    }

    pub fn close(&self, invocation_id: &InvocationId) {
        self.lock().remove(invocation_id);
    }

    pub fn is_open(&self, invocation_id: &InvocationId) -> bool {
        self.lock().contains_key(invocation_id)
    }

    pub fn is_canceled(&self, invocation_id: &InvocationId) -> bool {
        self.lock()
            .get(invocation_id)
            .is_some_and(|entry| entry.canceled)
    }

    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    pub fn add(&self, invocation_id: &InvocationId, listener: CancelListener) -> ListenerId {
        let id = ListenerId::next();
        let fire_now = {
            let mut entries = self.lock();
            match entries.get_mut(invocation_id) {
                Some(entry) if entry.canceled => true,
                Some(entry) => {
                    entry.listeners.push((id, listener.clone()));
                    false
                }
                None => false,
            }
        };
        if fire_now {
            fire_isolated(|| listener());
        }
        id
    }

    pub fn remove(&self, invocation_id: &InvocationId, listener: ListenerId) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(invocation_id) else {
            return false;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|(candidate, _)| *candidate != listener);
        entry.listeners.len() != before
    }

    /// Fires and forgets every listener of an open invocation. Returns `false` for ids
    /// that are closed, unknown, or already canceled.
    pub fn cancel(&self, invocation_id: &InvocationId) -> bool {
        let listeners = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(invocation_id) else {
                return false;
            };
            if entry.canceled {
                return false;
            }
            entry.canceled = true;
            std::mem::take(&mut entry.listeners)
        };
        for (_, listener) in listeners {
            fire_isolated(|| listener());
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InvocationId, CancelEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
