//! Wire packets and correlation identifiers.
//!
//! Two shapes travel over a channel:
//!
//! ```text
//! request:  { "id": "<uuid>", "from": "client"|"server", "eventName": "...", "args": [...] }
//! response: { "id": "<uuid>", "status": true|false, "error": "..."|null, "result": ...|null }
//! ```
//!
//! Requests are emitted under the sender role's reserved event
//! ([`CLIENT_PACKET`] or [`SERVER_PACKET`]); the matching response is emitted
//! under the request's correlation id.

use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// Reserved event for packets sent by the client role.
pub const CLIENT_PACKET: &str = "client-packet";
/// Reserved event for packets sent by the server role.
pub const SERVER_PACKET: &str = "server-packet";

/// Endpoint role, used to tag packet origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }

    /// The role on the other end of the channel.
    pub fn remote(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    /// Reserved event name carrying requests sent by this role.
    pub fn packet_event(self) -> &'static str {
        match self {
            Role::Client => CLIENT_PACKET,
            Role::Server => SERVER_PACKET,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unique token binding one request to its one response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

static NODE_ID: OnceLock<[u8; 6]> = OnceLock::new();

impl CorrelationId {
    /// Generate a fresh time-based (v1) identifier.
    ///
    /// The node id is drawn once per process; the shared uuid clock context
    /// keeps ids unique for calls issued within the same timestamp tick.
    pub fn generate() -> Self {
        let node_id = NODE_ID.get_or_init(rand::random::<[u8; 6]>);
        Self(Uuid::now_v1(node_id).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A call travelling from one role to the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPacket {
    pub id: CorrelationId,
    pub from: Role,
    pub event_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RequestPacket {
    /// Parse and validate an inbound request payload.
    pub fn from_payload(payload: Value) -> Result<Self> {
        let packet: RequestPacket =
            serde_json::from_value(payload).map_err(|e| RpcError::MalformedPacket {
                reason: format!("invalid request packet: {}", e),
            })?;
        if packet.id.as_str().is_empty() {
            return Err(RpcError::MalformedPacket {
                reason: "request packet has an empty id".to_string(),
            });
        }
        Ok(packet)
    }

    pub fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// The single answer to a [`RequestPacket`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePacket {
    pub id: CorrelationId,
    pub status: bool,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl ResponsePacket {
    pub fn new(
        id: CorrelationId,
        status: bool,
        error: Option<String>,
        result: Option<Value>,
    ) -> Self {
        Self {
            id,
            status,
            error,
            result,
        }
    }

    pub fn success(id: CorrelationId, result: Value) -> Self {
        Self::new(id, true, None, Some(result))
    }

    pub fn failure(id: CorrelationId, error: impl Into<String>) -> Self {
        Self::new(id, false, Some(error.into()), None)
    }

    /// Parse and validate a response payload received under a correlation id.
    pub fn from_payload(payload: Value) -> Result<Self> {
        serde_json::from_value(payload).map_err(|e| RpcError::MalformedPacket {
            reason: format!("invalid response packet: {}", e),
        })
    }

    pub fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Build a request packet with a fresh correlation id.
pub fn new_request(
    from: Role,
    event_name: impl Into<String>,
    args: Vec<Value>,
) -> (CorrelationId, RequestPacket) {
    let id = CorrelationId::generate();
    let packet = RequestPacket {
        id: id.clone(),
        from,
        event_name: event_name.into(),
        args,
    };
    (id, packet)
}

/// Best-effort extraction of the correlation id from a payload that failed
/// validation, so that the sender can still be answered.
pub(crate) fn peek_id(payload: &Value) -> Option<CorrelationId> {
    payload
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .map(CorrelationId::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_new_request_ids_are_unique() {
        let ids: HashSet<CorrelationId> = (0..1000)
            .map(|_| new_request(Role::Client, "ping", vec![]).0)
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_new_request_wraps_envelope() {
        let (id, packet) = new_request(Role::Server, "sum", vec![json!(1), json!(2)]);
        assert_eq!(packet.id, id);
        assert_eq!(packet.from, Role::Server);
        assert_eq!(packet.event_name, "sum");
        assert_eq!(packet.args, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_request_wire_shape() {
        let (id, packet) = new_request(Role::Client, "sum", vec![json!(1)]);
        let payload = packet.to_payload().unwrap();
        assert_eq!(
            payload,
            json!({"id": id.as_str(), "from": "client", "eventName": "sum", "args": [1]})
        );
    }

    #[test]
    fn test_request_from_payload_rejects_unknown_role() {
        let payload = json!({"id": "abc", "from": "proxy", "eventName": "x", "args": []});
        let err = RequestPacket::from_payload(payload.clone()).unwrap_err();
        assert!(matches!(err, RpcError::MalformedPacket { .. }));
        assert_eq!(peek_id(&payload), Some(CorrelationId::from("abc")));
    }

    #[test]
    fn test_request_from_payload_rejects_empty_id() {
        let payload = json!({"id": "", "from": "client", "eventName": "x"});
        assert!(RequestPacket::from_payload(payload).is_err());
    }

    #[test]
    fn test_request_args_default_to_empty() {
        let payload = json!({"id": "abc", "from": "client", "eventName": "x"});
        let packet = RequestPacket::from_payload(payload).unwrap();
        assert!(packet.args.is_empty());
    }

    #[test]
    fn test_response_constructors() {
        let ok = ResponsePacket::success("a".into(), json!("done"));
        assert!(ok.status);
        assert_eq!(ok.error, None);
        assert_eq!(ok.result, Some(json!("done")));

        let failed = ResponsePacket::failure("a".into(), "boom");
        assert!(!failed.status);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(failed.result, None);
    }

    #[test]
    fn test_response_from_request_shaped_payload_is_malformed() {
        let (_, packet) = new_request(Role::Client, "x", vec![]);
        let err = ResponsePacket::from_payload(packet.to_payload().unwrap()).unwrap_err();
        assert!(matches!(err, RpcError::MalformedPacket { .. }));
    }

    #[test]
    fn test_role_routing() {
        assert_eq!(Role::Client.remote(), Role::Server);
        assert_eq!(Role::Client.packet_event(), CLIENT_PACKET);
        assert_eq!(Role::Server.packet_event(), SERVER_PACKET);
    }
}
