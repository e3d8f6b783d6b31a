//! Duplex channel abstraction consumed by the endpoint core.
//!
//! A [`Channel`] is a named-event message transport between exactly two
//! parties. A [`Listener`] hands out one server-side channel per connecting
//! peer. Both are implemented by transports (see [`crate::transport`]).

mod listeners;

pub use listeners::EventListeners;

use crate::Result;
use serde_json::Value;
use std::sync::Arc;

/// Callback invoked with the payload of an event.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback invoked on connect or disconnect.
pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked once per new inbound channel.
pub type ConnectHandler = Arc<dyn Fn(Arc<dyn Channel>) + Send + Sync>;

/// A duplex, named-event message transport.
///
/// Handlers run on the transport's delivery path and must not block; long
/// work should be spawned.
pub trait Channel: Send + Sync {
    /// Identifier of the remote peer, unique within its listener's scope.
    fn id(&self) -> &str;

    /// Send `payload` to the remote side tagged with `event`.
    fn emit(&self, event: &str, payload: Value) -> Result<()>;

    /// Subscribe to every occurrence of `event`.
    fn on(&self, event: &str, handler: EventHandler);

    /// Subscribe to the next occurrence of `event` only.
    fn once(&self, event: &str, handler: EventHandler);

    /// Remove every handler registered for `event`.
    fn off(&self, event: &str);

    /// Run `handler` when the channel connects. If the channel is already
    /// connected, `handler` runs immediately.
    fn on_connect(&self, handler: LifecycleHandler);

    /// Run `handler` when the channel disconnects.
    fn on_disconnect(&self, handler: LifecycleHandler);

    /// Terminate the channel. Fires disconnect notifications and drops all
    /// event handlers.
    fn close(&self);
}

/// Server-side source of inbound channels.
pub trait Listener: Send + Sync {
    fn on_client_connect(&self, handler: ConnectHandler);
}
