//! Client role: one endpoint bound to one channel.

use crate::channel::Channel;
use crate::config::{EndpointConfig, FireOptions};
use crate::endpoint::{Endpoint, Handler};
use crate::middleware::Middleware;
use crate::packet::Role;
use crate::Result;
use serde_json::Value;
use std::sync::Arc;

/// The client side of a connection.
///
/// Calls go to the server at the other end of the channel; requests from the
/// server are answered with the handlers registered here.
///
/// `ON_CONNECTION` runs on a background task once the channel is connected,
/// so middleware added right after construction still observes it.
pub struct Client {
    endpoint: Arc<Endpoint>,
    channel: Arc<dyn Channel>,
}

impl Client {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self::with_config(channel, EndpointConfig::default())
    }

    pub fn with_config(channel: Arc<dyn Channel>, config: EndpointConfig) -> Self {
        let endpoint = Arc::new(Endpoint::new(Role::Client, config));
        endpoint.attach(&channel);

        let weak_endpoint = Arc::downgrade(&endpoint);
        let weak_channel = Arc::downgrade(&channel);
        channel.on_connect(Arc::new(move || {
            if let (Some(endpoint), Some(channel)) = (weak_endpoint.upgrade(), weak_channel.upgrade())
            {
                let peer = channel.id().to_string();
                endpoint.connection_opened(&channel, peer);
            }
        }));

        let weak_endpoint = Arc::downgrade(&endpoint);
        let peer = channel.id().to_string();
        channel.on_disconnect(Arc::new(move || {
            if let Some(endpoint) = weak_endpoint.upgrade() {
                endpoint.connection_closed(peer.clone());
            }
        }));

        Self { endpoint, channel }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn use_middleware(&self, middleware: Middleware) {
        self.endpoint.use_middleware(middleware);
    }

    pub fn use_first(&self, middleware: Middleware) {
        self.endpoint.use_first(middleware);
    }

    pub fn register(&self, event_name: impl Into<String>, handler: Handler) -> Result<()> {
        self.endpoint.register(event_name, handler)
    }

    /// Call `event_name` on the server with the endpoint's default timeout.
    pub async fn fire(&self, event_name: impl Into<String>, args: Vec<Value>) -> Result<Value> {
        let options = FireOptions::new(event_name, self.endpoint.config().fail_timeout);
        self.fire_with(options, args).await
    }

    pub async fn fire_with(&self, options: FireOptions, args: Vec<Value>) -> Result<Value> {
        self.endpoint.fire_on(&self.channel, options, args).await
    }

    /// Close the underlying channel.
    pub fn close(&self) {
        self.channel.close();
    }
}
