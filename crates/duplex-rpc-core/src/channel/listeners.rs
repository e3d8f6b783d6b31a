//! Handler bookkeeping shared by the bundled transports.

use super::{EventHandler, LifecycleHandler};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct ListenerState {
    persistent: HashMap<String, Vec<EventHandler>>,
    once: HashMap<String, Vec<EventHandler>>,
    connect: Vec<LifecycleHandler>,
    disconnect: Vec<LifecycleHandler>,
    connected: bool,
    closed: bool,
}

/// Event and lifecycle handler registry for one side of a channel.
///
/// Handlers are cloned out of the lock before they run, so a handler may
/// freely register further handlers or emit on the channel.
#[derive(Default)]
pub struct EventListeners {
    state: Mutex<ListenerState>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on(&self, event: &str, handler: EventHandler) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state
            .persistent
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    pub fn once(&self, event: &str, handler: EventHandler) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.once.entry(event.to_string()).or_default().push(handler);
    }

    /// Remove every handler for `event`. Returns how many were removed.
    pub fn off(&self, event: &str) -> usize {
        let mut state = self.lock();
        let persistent = state.persistent.remove(event).map_or(0, |h| h.len());
        let once = state.once.remove(event).map_or(0, |h| h.len());
        persistent + once
    }

    /// Number of handlers currently subscribed to `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        let state = self.lock();
        state.persistent.get(event).map_or(0, |h| h.len())
            + state.once.get(event).map_or(0, |h| h.len())
    }

    pub fn on_connect(&self, handler: LifecycleHandler) {
        let run_now = {
            let mut state = self.lock();
            if state.connected {
                true
            } else {
                state.connect.push(handler.clone());
                false
            }
        };
        if run_now {
            handler();
        }
    }

    pub fn on_disconnect(&self, handler: LifecycleHandler) {
        let run_now = {
            let mut state = self.lock();
            if state.closed {
                true
            } else {
                state.disconnect.push(handler.clone());
                false
            }
        };
        if run_now {
            handler();
        }
    }

    /// Deliver `payload` to the handlers of `event`. One-shot handlers are
    /// consumed. Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &str, payload: Value) -> usize {
        let handlers = {
            let mut state = self.lock();
            let mut handlers = state.persistent.get(event).cloned().unwrap_or_default();
            if let Some(once) = state.once.remove(event) {
                handlers.extend(once);
            }
            handlers
        };
        for handler in &handlers {
            handler(payload.clone());
        }
        handlers.len()
    }

    /// Mark the channel connected and run the connect handlers.
    pub fn notify_connect(&self) {
        let handlers = {
            let mut state = self.lock();
            if state.connected || state.closed {
                return;
            }
            state.connected = true;
            std::mem::take(&mut state.connect)
        };
        for handler in &handlers {
            handler();
        }
    }

    /// Mark the channel closed, drop every event handler and run the
    /// disconnect handlers. Only the first call has any effect; returns
    /// whether this call performed the transition.
    pub fn notify_disconnect(&self) -> bool {
        let handlers = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.connected = false;
            state.persistent.clear();
            state.once.clear();
            state.connect.clear();
            std::mem::take(&mut state.disconnect)
        };
        for handler in &handlers {
            handler();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
