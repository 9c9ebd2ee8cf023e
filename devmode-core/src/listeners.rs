// Per-session close callbacks
//
// Anything that has to stop when a session is torn down (an attach attempt
// waiting on the debuggee, UI bookkeeping) registers here. The session
// controller fires the list from `cleanup`, which drains it, so a second
// cleanup finds nothing to call.

use crate::process::SessionKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub type CloseCallback = Arc<dyn Fn(&SessionKey) + Send + Sync>;

/// Returned by [`CloseListeners::register_on_close`] for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct CloseListeners {
    next_id: AtomicU64,
    by_key: Mutex<HashMap<SessionKey, Vec<(ListenerId, CloseCallback)>>>,
}

impl CloseListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_on_close<F>(&self, key: &SessionKey, callback: F) -> ListenerId
    where
        F: Fn(&SessionKey) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut by_key = self.by_key.lock().unwrap_or_else(|e| e.into_inner());
        by_key
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the callback already ran or was never registered
    pub fn unregister_on_close(&self, key: &SessionKey, id: ListenerId) -> bool {
        let mut by_key = self.by_key.lock().unwrap_or_else(|e| e.into_inner());
        let Some(callbacks) = by_key.get_mut(key) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            by_key.remove(key);
        }
        removed
    }

    pub fn registered(&self, key: &SessionKey) -> usize {
        let by_key = self.by_key.lock().unwrap_or_else(|e| e.into_inner());
        by_key.get(key).map_or(0, Vec::len)
    }

    /// Take every callback for `key` and run them in registration order.
    /// Runs outside the lock so callbacks may register new listeners.
    pub(crate) fn fire(&self, key: &SessionKey) -> usize {
        let callbacks = {
            let mut by_key = self.by_key.lock().unwrap_or_else(|e| e.into_inner());
            by_key.remove(key).unwrap_or_default()
        };

        for (id, callback) in &callbacks {
            debug!("Running close listener {:?} for {}", id, key);
            callback(key);
        }
        callbacks.len()
    }
}
