//! Server role: one endpoint answering every pooled peer.

mod broadcast;
mod pool;

pub use broadcast::{is_truthy, BroadcastResult, BroadcastStrategy, PeerOutcome};
pub use pool::ConnectionPool;

use crate::channel::Listener;
use crate::config::{EndpointConfig, FireOptions};
use crate::endpoint::{Endpoint, Handler};
use crate::middleware::Middleware;
use crate::packet::Role;
use crate::{Result, RpcError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The server side: accepts peers from any number of listeners, answers
/// their calls, and calls into them individually or by broadcast.
///
/// `ON_CONNECTION` and `ON_DISCONNECTION` middleware registered here is run
/// by the [`ConnectionPool`] as peers come and go; an `ON_CONNECTION` break
/// closes the peer's channel.
pub struct Server {
    endpoint: Arc<Endpoint>,
    pool: Arc<ConnectionPool>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(EndpointConfig::default())
    }

    pub fn with_config(config: EndpointConfig) -> Self {
        let endpoint = Arc::new(Endpoint::new(Role::Server, config));
        let pool = Arc::new(ConnectionPool::new(endpoint.clone()));
        Self { endpoint, pool }
    }

    /// Accept peers from `listener`. Returns the id that prefixes their
    /// pool keys.
    pub fn listen(&self, listener: &dyn Listener) -> String {
        self.pool.add_listener(listener)
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Pool keys of the currently connected peers.
    pub fn peers(&self) -> Vec<String> {
        self.pool.list_all()
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

    /// Call `event_name` on the peer stored under `peer` with the endpoint's
    /// default timeout.
    pub async fn fire(
        &self,
        peer: &str,
        event_name: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Value> {
        let options = FireOptions::new(event_name, self.endpoint.config().fail_timeout);
        self.fire_with(peer, options, args).await
    }

    /// Fails with `PeerNotFound` when no peer is stored under `peer`.
    pub async fn fire_with(
        &self,
        peer: &str,
        options: FireOptions,
        args: Vec<Value>,
    ) -> Result<Value> {
        let channel = self.pool.get(peer).ok_or_else(|| RpcError::PeerNotFound {
            peer: peer.to_string(),
        })?;
        self.endpoint.fire_on(&channel, options, args).await
    }

    /// Call every connected peer and fold the outcomes with `strategy`.
    ///
    /// Only `Race` can fail, and only when no peer produced a truthy result.
    pub async fn broadcast(
        &self,
        event_name: impl Into<String>,
        strategy: BroadcastStrategy,
        fail_timeout: Duration,
        args: Vec<Value>,
    ) -> Result<BroadcastResult> {
        let options = FireOptions::new(event_name, fail_timeout);
        let peers = self.pool.snapshot();
        debug!(
            event = %options.event_name,
            strategy = %strategy,
            peers = peers.len(),
            "Broadcasting"
        );

        match strategy {
            BroadcastStrategy::WaitAll => {
                let outcomes = broadcast::outcomes(&self.endpoint, peers, &options, &args).await;
                Ok(BroadcastResult::Collected(broadcast::wait_all(outcomes)))
            }
            BroadcastStrategy::WaitAllExceptUndefined => {
                let outcomes = broadcast::outcomes(&self.endpoint, peers, &options, &args).await;
                Ok(BroadcastResult::Collected(broadcast::except_undefined(
                    broadcast::wait_all(outcomes),
                )))
            }
            BroadcastStrategy::Race => {
                broadcast::race(&self.endpoint, peers, &options, &args)
                    .await
                    .map(BroadcastResult::First)
            }
        }
    }

    /// `WAIT_ALL` with the default timeout.
    pub async fn broadcast_wait_all(
        &self,
        event_name: impl Into<String>,
        args: Vec<Value>,
    ) -> Vec<Value> {
        let options = FireOptions::new(event_name, self.endpoint.config().fail_timeout);
        let outcomes =
            broadcast::outcomes(&self.endpoint, self.pool.snapshot(), &options, &args).await;
        broadcast::wait_all(outcomes)
    }

    /// `WAIT_ALL_EXCEPT_UNDEFINED` with the default timeout.
    pub async fn broadcast_wait_not_null(
        &self,
        event_name: impl Into<String>,
        args: Vec<Value>,
    ) -> Vec<Value> {
        broadcast::except_undefined(self.broadcast_wait_all(event_name, args).await)
    }

    /// `RACE` with the default timeout.
    pub async fn broadcast_race(
        &self,
        event_name: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Value> {
        let options = FireOptions::new(event_name, self.endpoint.config().fail_timeout);
        broadcast::race(&self.endpoint, self.pool.snapshot(), &options, &args).await
    }

    /// Call every connected peer and return each peer's tagged outcome, so
    /// failures stay distinguishable from `null` results.
    pub async fn broadcast_outcomes(
        &self,
        event_name: impl Into<String>,
        fail_timeout: Duration,
        args: Vec<Value>,
    ) -> Vec<PeerOutcome> {
        let options = FireOptions::new(event_name, fail_timeout);
        broadcast::outcomes(&self.endpoint, self.pool.snapshot(), &options, &args).await
    }
}
