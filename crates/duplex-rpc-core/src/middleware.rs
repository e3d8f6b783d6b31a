//! Interceptor pipeline.
//!
//! Each of the seven stages owns an ordered, append-only chain of
//! interceptors. An interceptor receives the artifact flowing through the
//! stage and returns [`Flow::Continue`] with the (possibly replaced) artifact
//! for the next interceptor, or [`Flow::Break`] to stop the chain and skip the
//! stage's default action.
//!
//! | Stage                    | Artifact          | Break value               | Effect of break                         |
//! |--------------------------|-------------------|---------------------------|-----------------------------------------|
//! | `BeforeFire`             | `RequestPacket`   | `Value`                   | value returned by `fire`, nothing sent  |
//! | `AfterFire`              | `Value`           | `Value`                   | value returned by `fire`                |
//! | `OnReceive`              | `RequestPacket`   | `Option<ResponsePacket>`  | echo packet (or send given response)    |
//! | `AfterReceiveCallback`   | `ResponsePacket`  | `()`                      | remaining observers skipped             |
//! | `OnConnection`           | `ConnectionEvent` | `()`                      | channel closed                          |
//! | `OnDisconnection`        | `ConnectionEvent` | `()`                      | remaining observers skipped             |
//! | `OnRegister`             | `Registration`    | `()`                      | handler not inserted                    |

use crate::endpoint::Handler;
use crate::packet::{RequestPacket, ResponsePacket};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// Outcome of one interceptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow<T, B = T> {
    /// Hand the artifact to the next interceptor.
    Continue(T),
    /// Stop the chain.
    Break(B),
}

/// Pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    BeforeFire,
    AfterFire,
    OnReceive,
    AfterReceiveCallback,
    OnConnection,
    OnDisconnection,
    OnRegister,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::BeforeFire => "BEFORE_FIRE",
            Stage::AfterFire => "AFTER_FIRE",
            Stage::OnReceive => "ON_RECEIVE",
            Stage::AfterReceiveCallback => "AFTER_RECEIVE_CALLBACK",
            Stage::OnConnection => "ON_CONNECTION",
            Stage::OnDisconnection => "ON_DISCONNECTION",
            Stage::OnRegister => "ON_REGISTER",
        };
        f.write_str(name)
    }
}

/// Peer identity handed to connection-stage interceptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Pool key on the server role, channel id on the client role.
    pub peer: String,
}

/// Event name and handler pair flowing through `OnRegister`.
#[derive(Clone)]
pub struct Registration {
    pub event_name: String,
    pub handler: Handler,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("event_name", &self.event_name)
            .finish_non_exhaustive()
    }
}

pub type AsyncInterceptor<T, B> = dyn Fn(T) -> BoxFuture<'static, Flow<T, B>> + Send + Sync;
pub type SyncInterceptor<T, B> = dyn Fn(T) -> Flow<T, B> + Send + Sync;

/// Ordered interceptor list for one stage.
pub struct Chain<I: ?Sized> {
    entries: RwLock<Vec<Arc<I>>>,
}

impl<I: ?Sized> Default for Chain<I> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<I: ?Sized> Chain<I> {
    fn push(&self, interceptor: Arc<I>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    fn push_front(&self, interceptor: Arc<I>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(0, interceptor);
    }

    fn snapshot(&self) -> Vec<Arc<I>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static, B: Send + 'static> Chain<AsyncInterceptor<T, B>> {
    /// Run the chain sequentially, awaiting each interceptor before the next.
    pub async fn run(&self, artifact: T) -> Flow<T, B> {
        let mut artifact = artifact;
        for interceptor in self.snapshot() {
            match interceptor(artifact).await {
                Flow::Continue(next) => artifact = next,
                Flow::Break(value) => return Flow::Break(value),
            }
        }
        Flow::Continue(artifact)
    }
}

impl<T: Clone + Send + 'static, B: Send + 'static> Chain<AsyncInterceptor<T, B>> {
    /// Like [`Chain::run`], but a break also carries the artifact the
    /// breaking interceptor was handed, including earlier replacements.
    pub async fn run_tracked(&self, artifact: T) -> Flow<T, (T, B)> {
        let mut artifact = artifact;
        for interceptor in self.snapshot() {
            match interceptor(artifact.clone()).await {
                Flow::Continue(next) => artifact = next,
                Flow::Break(value) => return Flow::Break((artifact, value)),
            }
        }
        Flow::Continue(artifact)
    }
}

impl<T, B> Chain<SyncInterceptor<T, B>> {
    /// Run the chain synchronously.
    pub fn apply(&self, artifact: T) -> Flow<T, B> {
        let mut artifact = artifact;
        for interceptor in self.snapshot() {
            match interceptor(artifact) {
                Flow::Continue(next) => artifact = next,
                Flow::Break(value) => return Flow::Break(value),
            }
        }
        Flow::Continue(artifact)
    }
}

fn boxed<T, B, F, Fut>(f: F) -> Arc<AsyncInterceptor<T, B>>
where
    T: Send + 'static,
    B: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Flow<T, B>> + Send + 'static,
{
    let interceptor: Arc<AsyncInterceptor<T, B>> = Arc::new(move |artifact: T| f(artifact).boxed());
    interceptor
}

/// An interceptor tagged with the stage it belongs to.
#[derive(Clone)]
pub enum Middleware {
    BeforeFire(Arc<AsyncInterceptor<RequestPacket, Value>>),
    AfterFire(Arc<AsyncInterceptor<Value, Value>>),
    OnReceive(Arc<AsyncInterceptor<RequestPacket, Option<ResponsePacket>>>),
    AfterReceiveCallback(Arc<AsyncInterceptor<ResponsePacket, ()>>),
    OnConnection(Arc<AsyncInterceptor<ConnectionEvent, ()>>),
    OnDisconnection(Arc<AsyncInterceptor<ConnectionEvent, ()>>),
    OnRegister(Arc<SyncInterceptor<Registration, ()>>),
}

impl Middleware {
    pub fn before_fire<F, Fut>(f: F) -> Self
    where
        F: Fn(RequestPacket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Flow<RequestPacket, Value>> + Send + 'static,
    {
        Middleware::BeforeFire(boxed(f))
    }

    pub fn after_fire<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Flow<Value, Value>> + Send + 'static,
    {
        Middleware::AfterFire(boxed(f))
    }

    pub fn on_receive<F, Fut>(f: F) -> Self
    where
        F: Fn(RequestPacket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Flow<RequestPacket, Option<ResponsePacket>>> + Send + 'static,
    {
        Middleware::OnReceive(boxed(f))
    }

    pub fn after_receive_callback<F, Fut>(f: F) -> Self
    where
        F: Fn(ResponsePacket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Flow<ResponsePacket, ()>> + Send + 'static,
    {
        Middleware::AfterReceiveCallback(boxed(f))
    }

    pub fn on_connection<F, Fut>(f: F) -> Self
    where
        F: Fn(ConnectionEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Flow<ConnectionEvent, ()>> + Send + 'static,
    {
        Middleware::OnConnection(boxed(f))
    }

    pub fn on_disconnection<F, Fut>(f: F) -> Self
    where
        F: Fn(ConnectionEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Flow<ConnectionEvent, ()>> + Send + 'static,
    {
        Middleware::OnDisconnection(boxed(f))
    }

    /// Registration interceptors run synchronously at configuration time.
    pub fn on_register<F>(f: F) -> Self
    where
        F: Fn(Registration) -> Flow<Registration, ()> + Send + Sync + 'static,
    {
        Middleware::OnRegister(Arc::new(f))
    }

    pub fn stage(&self) -> Stage {
        match self {
            Middleware::BeforeFire(_) => Stage::BeforeFire,
            Middleware::AfterFire(_) => Stage::AfterFire,
            Middleware::OnReceive(_) => Stage::OnReceive,
            Middleware::AfterReceiveCallback(_) => Stage::AfterReceiveCallback,
            Middleware::OnConnection(_) => Stage::OnConnection,
            Middleware::OnDisconnection(_) => Stage::OnDisconnection,
            Middleware::OnRegister(_) => Stage::OnRegister,
        }
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Middleware({})", self.stage())
    }
}

/// The seven chains owned by one endpoint.
#[derive(Default)]
pub struct MiddlewareStack {
    before_fire: Chain<AsyncInterceptor<RequestPacket, Value>>,
    after_fire: Chain<AsyncInterceptor<Value, Value>>,
    on_receive: Chain<AsyncInterceptor<RequestPacket, Option<ResponsePacket>>>,
    after_receive_callback: Chain<AsyncInterceptor<ResponsePacket, ()>>,
    on_connection: Chain<AsyncInterceptor<ConnectionEvent, ()>>,
    on_disconnection: Chain<AsyncInterceptor<ConnectionEvent, ()>>,
    on_register: Chain<SyncInterceptor<Registration, ()>>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the end of the middleware's stage.
    pub fn push(&self, middleware: Middleware) {
        match middleware {
            Middleware::BeforeFire(i) => self.before_fire.push(i),
            Middleware::AfterFire(i) => self.after_fire.push(i),
            Middleware::OnReceive(i) => self.on_receive.push(i),
            Middleware::AfterReceiveCallback(i) => self.after_receive_callback.push(i),
            Middleware::OnConnection(i) => self.on_connection.push(i),
            Middleware::OnDisconnection(i) => self.on_disconnection.push(i),
            Middleware::OnRegister(i) => self.on_register.push(i),
        }
    }

    /// Prepend to the front of the middleware's stage.
    pub fn push_front(&self, middleware: Middleware) {
        match middleware {
            Middleware::BeforeFire(i) => self.before_fire.push_front(i),
            Middleware::AfterFire(i) => self.after_fire.push_front(i),
            Middleware::OnReceive(i) => self.on_receive.push_front(i),
            Middleware::AfterReceiveCallback(i) => self.after_receive_callback.push_front(i),
            Middleware::OnConnection(i) => self.on_connection.push_front(i),
            Middleware::OnDisconnection(i) => self.on_disconnection.push_front(i),
            Middleware::OnRegister(i) => self.on_register.push_front(i),
        }
    }

    pub fn before_fire(&self) -> &Chain<AsyncInterceptor<RequestPacket, Value>> {
        &self.before_fire
    }

    pub fn after_fire(&self) -> &Chain<AsyncInterceptor<Value, Value>> {
        &self.after_fire
    }

    pub fn on_receive(&self) -> &Chain<AsyncInterceptor<RequestPacket, Option<ResponsePacket>>> {
        &self.on_receive
    }

    pub fn after_receive_callback(&self) -> &Chain<AsyncInterceptor<ResponsePacket, ()>> {
        &self.after_receive_callback
    }

    pub fn on_connection(&self) -> &Chain<AsyncInterceptor<ConnectionEvent, ()>> {
        &self.on_connection
    }

    pub fn on_disconnection(&self) -> &Chain<AsyncInterceptor<ConnectionEvent, ()>> {
        &self.on_disconnection
    }

    pub fn on_register(&self) -> &Chain<SyncInterceptor<Registration, ()>> {
        &self.on_register
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn tracing_after_fire(log: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Middleware {
        Middleware::after_fire(move |value| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
                Flow::Continue(value)
            }
        })
    }

    #[tokio::test]
    async fn test_chain_runs_in_registration_order() {
        let stack = MiddlewareStack::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        stack.push(tracing_after_fire(log.clone(), "second"));
        stack.push(tracing_after_fire(log.clone(), "third"));
        stack.push_front(tracing_after_fire(log.clone(), "first"));

        let flow = stack.after_fire().run(json!(1)).await;
        assert_eq!(flow, Flow::Continue(json!(1)));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_replacement_propagates_to_next_interceptor() {
        let stack = MiddlewareStack::new();
        stack.push(Middleware::after_fire(|value| async move {
            Flow::Continue(json!(value.as_i64().unwrap_or(0) + 1))
        }));
        stack.push(Middleware::after_fire(|value| async move {
            Flow::Continue(json!(value.as_i64().unwrap_or(0) * 10))
        }));

        let flow = stack.after_fire().run(json!(1)).await;
        assert_eq!(flow, Flow::Continue(json!(20)));
    }

    #[tokio::test]
    async fn test_break_stops_remaining_interceptors() {
        let stack = MiddlewareStack::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        stack.push(Middleware::after_fire(|_| async move { Flow::Break(json!("cached")) }));
        stack.push(tracing_after_fire(log.clone(), "never"));

        let flow = stack.after_fire().run(json!(1)).await;
        assert_eq!(flow, Flow::Break(json!("cached")));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tracked_break_carries_replaced_artifact() {
        let stack = MiddlewareStack::new();
        stack.push(Middleware::on_receive(|mut packet| async move {
            packet.args = vec![json!(99)];
            Flow::Continue(packet)
        }));
        stack.push(Middleware::on_receive(|_| async move { Flow::Break(None) }));

        let (_, packet) = crate::packet::new_request(crate::packet::Role::Client, "sum", vec![json!(1)]);
        match stack.on_receive().run_tracked(packet).await {
            Flow::Break((current, None)) => assert_eq!(current.args, vec![json!(99)]),
            other => panic!("unexpected flow: {other:?}"),
        }
    }

    #[test]
    fn test_stage_routing() {
        let stack = MiddlewareStack::new();
        stack.push(Middleware::on_connection(|event| async move { Flow::Continue(event) }));
        stack.push(Middleware::on_register(Flow::Continue));

        assert_eq!(stack.on_connection().len(), 1);
        assert_eq!(stack.on_register().len(), 1);
        assert!(stack.before_fire().is_empty());
        assert!(stack.on_disconnection().is_empty());
    }

    #[test]
    fn test_stage_names() {
        let middleware = Middleware::on_receive(|packet| async move { Flow::Continue(packet) });
        assert_eq!(middleware.stage(), Stage::OnReceive);
        assert_eq!(middleware.stage().to_string(), "ON_RECEIVE");
    }
}
