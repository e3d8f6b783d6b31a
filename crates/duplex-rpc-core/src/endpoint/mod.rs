//! Endpoint core shared by the client and server roles.
//!
//! The caller side (`fire_on`) builds a request, threads it through
//! `BEFORE_FIRE`, emits it, and races the response against the call timeout.
//! The responder side (`attach` / `handle_inbound`) answers every inbound
//! request with exactly one response.

mod handlers;
mod pending;

pub use handlers::{Handler, HandlerFuture, HandlerTable};

use crate::channel::Channel;
use crate::config::{EndpointConfig, FireOptions, RpcConfig};
use crate::middleware::{ConnectionEvent, Flow, Middleware, MiddlewareStack, Registration};
use crate::packet::{self, CorrelationId, RequestPacket, ResponsePacket, Role};
use crate::{Result, RpcError};
use futures::FutureExt;
use pending::PendingCall;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One side of the protocol: a role, its handlers and its middleware.
pub struct Endpoint {
    role: Role,
    config: EndpointConfig,
    handlers: HandlerTable,
    middleware: MiddlewareStack,
}

impl Endpoint {
    pub fn new(role: Role, config: EndpointConfig) -> Self {
        Self {
            role,
            config,
            handlers: HandlerTable::new(),
            middleware: MiddlewareStack::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn use_middleware(&self, middleware: Middleware) {
        self.middleware.push(middleware);
    }

    pub fn use_first(&self, middleware: Middleware) {
        self.middleware.push_front(middleware);
    }

    /// Register the handler for `event_name` after `ON_REGISTER` has had a
    /// chance to substitute either.
    ///
    /// Fails with `DuplicateRegistration` if the resulting name is taken; the
    /// existing handler stays active.
    pub fn register(&self, event_name: impl Into<String>, handler: Handler) -> Result<()> {
        let registration = Registration {
            event_name: event_name.into(),
            handler,
        };
        match self.middleware.on_register().apply(registration) {
            Flow::Continue(registration) => {
                debug!(role = %self.role, event = %registration.event_name, "Handler registered");
                self.handlers
                    .insert(registration.event_name, registration.handler)
            }
            Flow::Break(()) => {
                debug!(role = %self.role, "Registration skipped by middleware");
                Ok(())
            }
        }
    }

    /// Issue one call over `channel` and wait for its result.
    pub async fn fire_on(
        &self,
        channel: &Arc<dyn Channel>,
        options: FireOptions,
        args: Vec<Value>,
    ) -> Result<Value> {
        let (id, packet) = packet::new_request(self.role, options.event_name.clone(), args);

        let packet = match self.middleware.before_fire().run(packet).await {
            Flow::Continue(packet) => packet,
            Flow::Break(value) => {
                debug!(event = %options.event_name, id = %id, "Call short-circuited before fire");
                return Ok(value);
            }
        };
        let payload = packet.to_payload()?;

        let pending = PendingCall::arm(channel.clone(), id.clone());
        channel.emit(self.role.packet_event(), payload)?;
        debug!(event = %options.event_name, id = %id, peer = channel.id(), "Request emitted");

        let response = pending
            .settle(options.fail_timeout, &options.event_name)
            .await?;

        if !response.status {
            return Err(RpcError::Remote {
                message: response.error.unwrap_or_default(),
            });
        }
        if response.id != id {
            return Err(RpcError::CorrelationMismatch {
                expected: id.to_string(),
                actual: response.id.to_string(),
            });
        }

        let result = response.result.unwrap_or(Value::Null);
        match self.middleware.after_fire().run(result).await {
            Flow::Continue(result) | Flow::Break(result) => Ok(result),
        }
    }

    /// Answer requests from the remote role arriving on `channel`.
    ///
    /// Each inbound packet is handled on its own task, so a slow handler does
    /// not delay other calls on the same channel.
    pub fn attach(self: &Arc<Self>, channel: &Arc<dyn Channel>) {
        let endpoint = Arc::downgrade(self);
        let weak_channel = Arc::downgrade(channel);
        channel.on(
            self.role.remote().packet_event(),
            Arc::new(move |payload| {
                let (Some(endpoint), Some(channel)) = (endpoint.upgrade(), weak_channel.upgrade())
                else {
                    return;
                };
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            endpoint.handle_inbound(&channel, payload).await;
                        });
                    }
                    Err(_) => warn!("Inbound packet dropped: no async runtime on delivery thread"),
                }
            }),
        );
    }

    /// Run `ON_CONNECTION` for a newly connected peer on a background task.
    ///
    /// A break closes `channel`.
    pub(crate) fn connection_opened(self: &Arc<Self>, channel: &Arc<dyn Channel>, peer: String) {
        let endpoint = self.clone();
        let channel = Arc::downgrade(channel);
        spawn_detached(async move {
            let event = ConnectionEvent { peer };
            match endpoint.middleware.on_connection().run(event.clone()).await {
                Flow::Continue(_) => debug!(role = %endpoint.role, peer = %event.peer, "Peer connected"),
                Flow::Break(()) => {
                    info!(role = %endpoint.role, peer = %event.peer, "Connection rejected by middleware");
                    if let Some(channel) = channel.upgrade() {
                        channel.close();
                    }
                }
            }
        });
    }

    /// Run `ON_DISCONNECTION` for a departed peer on a background task.
    pub(crate) fn connection_closed(self: &Arc<Self>, peer: String) {
        let endpoint = self.clone();
        spawn_detached(async move {
            debug!(role = %endpoint.role, peer = %peer, "Peer disconnected");
            let _ = endpoint
                .middleware
                .on_disconnection()
                .run(ConnectionEvent { peer })
                .await;
        });
    }

    /// Run the responder for one inbound payload.
    ///
    /// A panic anywhere between `ON_RECEIVE` and the handler still answers
    /// the call with a failure response.
    pub async fn handle_inbound(&self, channel: &Arc<dyn Channel>, payload: Value) {
        let packet = match RequestPacket::from_payload(payload.clone()) {
            Ok(packet) => packet,
            Err(e) => {
                match packet::peek_id(&payload) {
                    Some(id) => {
                        warn!(id = %id, error = %e, "Malformed inbound packet");
                        let response =
                            ResponsePacket::failure(id.clone(), RpcConfig::PROTOCOL_ERROR_CODE);
                        self.respond(channel, &id, response).await;
                    }
                    None => warn!(error = %e, "Dropping inbound packet without correlation id"),
                }
                return;
            }
        };
        let id = packet.id.clone();
        let event_name = packet.event_name.clone();

        let reply = AssertUnwindSafe(self.resolve(packet))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!(id = %id, event = %event_name, "Responder panicked");
                Reply::Respond(ResponsePacket::failure(
                    id.clone(),
                    RpcConfig::HANDLER_PANIC_MESSAGE,
                ))
            });

        match reply {
            Reply::Respond(response) => self.respond(channel, &id, response).await,
            Reply::Echo(current) => {
                debug!(id = %id, "Inbound packet echoed by middleware");
                let echoed = current
                    .to_payload()
                    .and_then(|payload| channel.emit(id.as_str(), payload));
                if let Err(e) = echoed {
                    warn!(id = %id, error = %e, "Failed to echo packet");
                }
            }
        }
    }

    /// Decide what goes back for `packet`: `ON_RECEIVE`, origin check,
    /// handler lookup and the handler call.
    async fn resolve(&self, packet: RequestPacket) -> Reply {
        let id = packet.id.clone();

        let packet = match self.middleware.on_receive().run_tracked(packet).await {
            Flow::Continue(packet) => packet,
            Flow::Break((_, Some(response))) => {
                debug!(id = %id, "Inbound packet answered by middleware");
                return Reply::Respond(response);
            }
            Flow::Break((current, None)) => return Reply::Echo(current),
        };

        let expected = self.role.remote();
        if packet.from != expected {
            let error = RpcError::MalformedOrigin {
                expected: expected.to_string(),
                actual: packet.from.to_string(),
            };
            warn!(id = %id, error = %error, "Rejecting inbound packet");
            return Reply::Respond(ResponsePacket::failure(id, RpcConfig::PROTOCOL_ERROR_CODE));
        }

        let Some(handler) = self.handlers.get(&packet.event_name) else {
            let error = RpcError::UnregisteredEvent {
                event_name: packet.event_name,
            };
            return Reply::Respond(ResponsePacket::failure(id, error.wire_message()));
        };

        match handler.call(packet.args).await {
            Ok(result) => Reply::Respond(ResponsePacket::success(id, result)),
            Err(e) => Reply::Respond(ResponsePacket::failure(id, e.to_string())),
        }
    }

    /// Emit `response` under `id`, then run `AFTER_RECEIVE_CALLBACK` whether
    /// or not the emission succeeded.
    async fn respond(&self, channel: &Arc<dyn Channel>, id: &CorrelationId, response: ResponsePacket) {
        let emitted = response
            .to_payload()
            .and_then(|payload| channel.emit(id.as_str(), payload));
        match emitted {
            Ok(()) => debug!(id = %id, status = response.status, "Response emitted"),
            Err(e) => warn!(id = %id, error = %e, "Failed to emit response"),
        }
        let observed = AssertUnwindSafe(self.middleware.after_receive_callback().run(response))
            .catch_unwind()
            .await;
        if observed.is_err() {
            warn!(id = %id, "AFTER_RECEIVE_CALLBACK middleware panicked");
        }
    }
}

/// What the responder sends back for one request.
enum Reply {
    Respond(ResponsePacket),
    /// The request as `ON_RECEIVE` left it, returned under its own id.
    Echo(RequestPacket),
}

fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(future);
        }
        Err(_) => warn!("Connection middleware skipped: no async runtime on notifying thread"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryChannel;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn endpoint(role: Role) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(role, EndpointConfig::default()))
    }

    /// Capture payloads emitted under `event` on `channel`.
    fn capture(channel: &Arc<MemoryChannel>, event: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.on(
            event,
            Arc::new(move |payload| sink.lock().unwrap().push(payload)),
        );
        seen
    }

    fn request(from: Role, event_name: &str, args: Vec<Value>) -> RequestPacket {
        packet::new_request(from, event_name, args).1
    }

    #[tokio::test]
    async fn test_handler_success_response() {
        let server = endpoint(Role::Server);
        server
            .register(
                "sum",
                Handler::new(|args: Vec<Value>| async move {
                    Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
                }),
            )
            .unwrap();

        let (server_side, client_side) = MemoryChannel::pair("s", "c");
        let packet = request(Role::Client, "sum", vec![json!(2), json!(3)]);
        let seen = capture(&client_side, packet.id.as_str());

        let channel: Arc<dyn Channel> = server_side;
        server
            .handle_inbound(&channel, packet.to_payload().unwrap())
            .await;

        let response = ResponsePacket::from_payload(seen.lock().unwrap()[0].clone()).unwrap();
        assert_eq!(response, ResponsePacket::success(packet.id, json!(5)));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure_response() {
        let server = endpoint(Role::Server);
        server
            .register(
                "fail",
                Handler::new(|_| async { Err(anyhow::anyhow!("disk full")) }),
            )
            .unwrap();

        let (server_side, client_side) = MemoryChannel::pair("s", "c");
        let packet = request(Role::Client, "fail", vec![]);
        let seen = capture(&client_side, packet.id.as_str());

        let channel: Arc<dyn Channel> = server_side;
        server
            .handle_inbound(&channel, packet.to_payload().unwrap())
            .await;

        let response = ResponsePacket::from_payload(seen.lock().unwrap()[0].clone()).unwrap();
        assert!(!response.status);
        assert_eq!(response.error.as_deref(), Some("disk full"));
        assert_eq!(response.result, None);
    }

    #[tokio::test]
    async fn test_handler_panic_is_answered() {
        let server = endpoint(Role::Server);
        server
            .register(
                "explode",
                Handler::new(|args: Vec<Value>| async move {
                    if args.is_empty() {
                        panic!("boom");
                    }
                    Ok(Value::Null)
                }),
            )
            .unwrap();

        let (server_side, client_side) = MemoryChannel::pair("s", "c");
        let packet = request(Role::Client, "explode", vec![]);
        let seen = capture(&client_side, packet.id.as_str());

        let channel: Arc<dyn Channel> = server_side;
        server
            .handle_inbound(&channel, packet.to_payload().unwrap())
            .await;

        let response = ResponsePacket::from_payload(seen.lock().unwrap()[0].clone()).unwrap();
        assert_eq!(
            response.error.as_deref(),
            Some(RpcConfig::HANDLER_PANIC_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_on_receive_panic_is_answered() {
        let server = endpoint(Role::Server);
        server
            .register("sum", Handler::new(|_| async { Ok(json!(0)) }))
            .unwrap();
        server.use_middleware(Middleware::on_receive(|packet| async move {
            if packet.args.is_empty() {
                panic!("interceptor bug");
            }
            Flow::Continue(packet)
        }));

        let (server_side, client_side) = MemoryChannel::pair("s", "c");
        let packet = request(Role::Client, "sum", vec![]);
        let seen = capture(&client_side, packet.id.as_str());

        let channel: Arc<dyn Channel> = server_side;
        server
            .handle_inbound(&channel, packet.to_payload().unwrap())
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let response = ResponsePacket::from_payload(seen[0].clone()).unwrap();
        assert_eq!(
            response,
            ResponsePacket::failure(packet.id, RpcConfig::HANDLER_PANIC_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_after_receive_callback_panic_keeps_single_response() {
        let server = endpoint(Role::Server);
        server
            .register("sum", Handler::new(|_| async { Ok(json!(3)) }))
            .unwrap();
        server.use_middleware(Middleware::after_receive_callback(|response| async move {
            if response.status {
                panic!("observer bug");
            }
            Flow::Continue(response)
        }));

        let (server_side, client_side) = MemoryChannel::pair("s", "c");
        let packet = request(Role::Client, "sum", vec![]);
        let seen = capture(&client_side, packet.id.as_str());

        let channel: Arc<dyn Channel> = server_side;
        server
            .handle_inbound(&channel, packet.to_payload().unwrap())
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let response = ResponsePacket::from_payload(seen[0].clone()).unwrap();
        assert_eq!(response, ResponsePacket::success(packet.id, json!(3)));
    }

    #[tokio::test]
    async fn test_unregistered_event_names_missing_handler() {
        let server = endpoint(Role::Server);
        let (server_side, client_side) = MemoryChannel::pair("s", "c");
        let packet = request(Role::Client, "nothing", vec![]);
        let seen = capture(&client_side, packet.id.as_str());

        let channel: Arc<dyn Channel> = server_side;
        server
            .handle_inbound(&channel, packet.to_payload().unwrap())
            .await;

        let response = ResponsePacket::from_payload(seen.lock().unwrap()[0].clone()).unwrap();
        assert_eq!(
            response.error.as_deref(),
            Some("There is no nothing handler")
        );
    }

    #[tokio::test]
    async fn test_wrong_origin_gets_protocol_error() {
        let server = endpoint(Role::Server);
        server
            .register("sum", Handler::new(|_| async { Ok(json!(0)) }))
            .unwrap();

        let (server_side, client_side) = MemoryChannel::pair("s", "c");
        // A server-tagged packet arriving at a server is rejected.
        let packet = request(Role::Server, "sum", vec![]);
        let seen = capture(&client_side, packet.id.as_str());

        let channel: Arc<dyn Channel> = server_side;
        server
            .handle_inbound(&channel, packet.to_payload().unwrap())
            .await;

        let response = ResponsePacket::from_payload(seen.lock().unwrap()[0].clone()).unwrap();
        assert_eq!(response, ResponsePacket::failure(packet.id, "500"));
    }

    #[tokio::test]
    async fn test_after_receive_callback_sees_failures() {
        let server = endpoint(Role::Server);
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = observed.clone();
        server.use_middleware(Middleware::after_receive_callback(move |response| {
            let counter = counter.clone();
            async move {
                if !response.status {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Flow::Continue(response)
            }
        }));
        server
            .register(
                "fail",
                Handler::new(|_| async { Err(anyhow::anyhow!("nope")) }),
            )
            .unwrap();

        let (server_side, _client_side) = MemoryChannel::pair("s", "c");
        let channel: Arc<dyn Channel> = server_side;
        let packet = request(Role::Client, "fail", vec![]);
        server
            .handle_inbound(&channel, packet.to_payload().unwrap())
            .await;

        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_register_can_rename_event() {
        let server = endpoint(Role::Server);
        server.use_middleware(Middleware::on_register(|mut registration| {
            registration.event_name = format!("v1.{}", registration.event_name);
            Flow::Continue(registration)
        }));
        server
            .register("status", Handler::new(|_| async { Ok(json!("up")) }))
            .unwrap();

        assert!(server.handlers().contains("v1.status"));
        assert!(!server.handlers().contains("status"));
    }

    #[tokio::test]
    async fn test_on_register_break_skips_insertion() {
        let server = endpoint(Role::Server);
        server.use_middleware(Middleware::on_register(|_| Flow::Break(())));
        server
            .register("status", Handler::new(|_| async { Ok(json!("up")) }))
            .unwrap();

        assert!(server.handlers().event_names().is_empty());
    }

    #[tokio::test]
    async fn test_before_fire_break_skips_emit() {
        let client = endpoint(Role::Client);
        client.use_middleware(Middleware::before_fire(|_| async move {
            Flow::Break(json!("from-cache"))
        }));

        let (client_side, server_side) = MemoryChannel::pair("c", "s");
        let emitted = capture(&server_side, Role::Client.packet_event());

        let channel: Arc<dyn Channel> = client_side;
        let result = client
            .fire_on(
                &channel,
                FireOptions::new("lookup", Duration::from_secs(1)),
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(result, json!("from-cache"));
        assert!(emitted.lock().unwrap().is_empty());
    }
}
