//! In-process transport.
//!
//! A [`MemoryChannel`] pair delivers each emitted event synchronously to the
//! handlers registered on the other end. [`MemoryListener`] plays the
//! server-side listener: every [`MemoryListener::connect`] creates a pair,
//! hands one end to the listener's subscribers and returns the other.

use crate::channel::{
    Channel, ConnectHandler, EventHandler, EventListeners, LifecycleHandler, Listener,
};
use crate::{Result, RpcError};
use serde_json::Value;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tracing::debug;

/// One end of an in-process duplex channel.
pub struct MemoryChannel {
    id: String,
    listeners: EventListeners,
    peer: OnceLock<Weak<MemoryChannel>>,
}

impl MemoryChannel {
    fn new(id: String) -> Self {
        Self {
            id,
            listeners: EventListeners::new(),
            peer: OnceLock::new(),
        }
    }

    /// Create two connected ends. `first.id()` is `first_id`, `second.id()`
    /// is `second_id`.
    pub fn pair(
        first_id: impl Into<String>,
        second_id: impl Into<String>,
    ) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        let first = Arc::new(Self::new(first_id.into()));
        let second = Arc::new(Self::new(second_id.into()));
        let _ = first.peer.set(Arc::downgrade(&second));
        let _ = second.peer.set(Arc::downgrade(&first));
        first.listeners.notify_connect();
        second.listeners.notify_connect();
        (first, second)
    }

    /// Number of handlers subscribed to `event` on this end.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.listener_count(event)
    }

    pub fn is_closed(&self) -> bool {
        self.listeners.is_closed()
    }

    fn peer(&self) -> Option<Arc<MemoryChannel>> {
        self.peer.get().and_then(Weak::upgrade)
    }
}

impl Channel for MemoryChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn emit(&self, event: &str, payload: Value) -> Result<()> {
        if self.listeners.is_closed() {
            return Err(RpcError::ChannelClosed);
        }
        let peer = self.peer().ok_or(RpcError::ChannelClosed)?;
        if peer.listeners.dispatch(event, payload) == 0 {
            debug!(channel = %self.id, event, "No listener on peer, event dropped");
        }
        Ok(())
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.listeners.on(event, handler);
    }

    fn once(&self, event: &str, handler: EventHandler) {
        self.listeners.once(event, handler);
    }

    fn off(&self, event: &str) {
        self.listeners.off(event);
    }

    fn on_connect(&self, handler: LifecycleHandler) {
        self.listeners.on_connect(handler);
    }

    fn on_disconnect(&self, handler: LifecycleHandler) {
        self.listeners.on_disconnect(handler);
    }

    fn close(&self) {
        if self.listeners.notify_disconnect() {
            if let Some(peer) = self.peer() {
                peer.close();
            }
        }
    }
}

/// In-process listener handing out the server end of each new pair.
#[derive(Default)]
pub struct MemoryListener {
    handlers: Mutex<Vec<ConnectHandler>>,
}

impl MemoryListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new peer with id `peer_id` and return its client end.
    pub fn connect(&self, peer_id: impl Into<String>) -> Arc<MemoryChannel> {
        let peer_id = peer_id.into();
        let (server_side, client_side) = MemoryChannel::pair(peer_id.clone(), peer_id);
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in &handlers {
            handler(server_side.clone());
        }
        client_side
    }
}

impl Listener for MemoryListener {
    fn on_client_connect(&self, handler: ConnectHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_peer_only() {
        let (a, b) = MemoryChannel::pair("a", "b");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        b.on("greet", Arc::new(move |p| sink.lock().unwrap().push(p)));
        let echo = Arc::new(AtomicUsize::new(0));
        let e = echo.clone();
        a.on("greet", Arc::new(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        }));

        a.emit("greet", json!("hi")).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!("hi")]);
        assert_eq!(echo.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_disconnects_both_ends() {
        let (a, b) = MemoryChannel::pair("a", "b");
        let disconnects = Arc::new(AtomicUsize::new(0));
        for end in [&a, &b] {
            let d = disconnects.clone();
            end.on_disconnect(Arc::new(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }));
        }

        b.close();
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
        assert!(a.is_closed());
        assert!(matches!(
            a.emit("x", json!(null)),
            Err(RpcError::ChannelClosed)
        ));
    }

    #[test]
    fn test_listener_hands_out_server_end() {
        let listener = MemoryListener::new();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let sink = accepted.clone();
        listener.on_client_connect(Arc::new(move |channel: Arc<dyn Channel>| {
            sink.lock().unwrap().push(channel);
        }));

        let client = listener.connect("peer-1");
        let accepted = accepted.lock().unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].id(), "peer-1");
        assert_eq!(client.id(), "peer-1");
    }
}
