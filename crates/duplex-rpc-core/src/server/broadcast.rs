//! Fan-out of one call to every pooled peer.
//!
//! Every peer gets an independent call through the endpoint, with its own
//! correlation id, timeout and middleware run. Strategies differ only in how
//! the per-peer outcomes are folded:
//!
//! - `WaitAll`: one value per peer in snapshot order; failures become `null`.
//! - `WaitAllExceptUndefined`: `WaitAll` with falsy values filtered out.
//! - `Race`: the first truthy value. Fails with `NoDecisiveResult` once every
//!   call has settled without one.

use crate::channel::Channel;
use crate::config::FireOptions;
use crate::endpoint::Endpoint;
use crate::{Result, RpcError};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Aggregation policy over per-peer outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastStrategy {
    WaitAll,
    WaitAllExceptUndefined,
    Race,
}

impl fmt::Display for BroadcastStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BroadcastStrategy::WaitAll => "WAIT_ALL",
            BroadcastStrategy::WaitAllExceptUndefined => "WAIT_ALL_EXCEPT_UNDEFINED",
            BroadcastStrategy::Race => "RACE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastResult {
    /// Produced by the two wait-all strategies.
    Collected(Vec<Value>),
    /// Produced by `Race`.
    First(Value),
}

impl BroadcastResult {
    pub fn into_values(self) -> Vec<Value> {
        match self {
            BroadcastResult::Collected(values) => values,
            BroadcastResult::First(value) => vec![value],
        }
    }
}

/// Tagged result of the call to one peer.
#[derive(Debug)]
pub struct PeerOutcome {
    pub peer: String,
    pub result: Result<Value>,
}

/// `null`, `false`, zero and the empty string are falsy; everything else,
/// including empty arrays and objects, is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

async fn call_peer(
    endpoint: &Endpoint,
    peer: String,
    channel: Arc<dyn Channel>,
    options: FireOptions,
    args: Vec<Value>,
) -> PeerOutcome {
    let result = endpoint.fire_on(&channel, options, args).await;
    if let Err(e) = &result {
        debug!(peer = %peer, error = %e, "Broadcast call to peer failed");
    }
    PeerOutcome { peer, result }
}

/// Call every peer and wait for all of them.
pub(crate) async fn outcomes(
    endpoint: &Endpoint,
    peers: Vec<(String, Arc<dyn Channel>)>,
    options: &FireOptions,
    args: &[Value],
) -> Vec<PeerOutcome> {
    join_all(
        peers
            .into_iter()
            .map(|(peer, channel)| call_peer(endpoint, peer, channel, options.clone(), args.to_vec())),
    )
    .await
}

pub(crate) fn wait_all(outcomes: Vec<PeerOutcome>) -> Vec<Value> {
    outcomes
        .into_iter()
        .map(|outcome| outcome.result.unwrap_or(Value::Null))
        .collect()
}

pub(crate) fn except_undefined(values: Vec<Value>) -> Vec<Value> {
    values.into_iter().filter(is_truthy).collect()
}

/// Resolve with the first truthy result. Calls still in flight are dropped,
/// which removes their response listeners.
pub(crate) async fn race(
    endpoint: &Endpoint,
    peers: Vec<(String, Arc<dyn Channel>)>,
    options: &FireOptions,
    args: &[Value],
) -> Result<Value> {
    let total = peers.len();
    let mut calls: FuturesUnordered<_> = peers
        .into_iter()
        .map(|(peer, channel)| call_peer(endpoint, peer, channel, options.clone(), args.to_vec()))
        .collect();

    while let Some(outcome) = calls.next().await {
        match outcome.result {
            Ok(value) if is_truthy(&value) => {
                debug!(peer = %outcome.peer, event = %options.event_name, "Race won");
                return Ok(value);
            }
            _ => {}
        }
    }

    Err(RpcError::NoDecisiveResult {
        event_name: options.event_name.clone(),
        peers: total,
    })
}
