//! TCP transport.
//!
//! Every [`TcpChannel`] owns two background tasks: a reader that decodes
//! framed [`EventEnvelope`]s and dispatches them to local handlers, and a
//! writer that drains an outbound queue so `emit` never blocks. Either side
//! ending (EOF, I/O error, `close`) disconnects the channel once.
//!
//! [`TcpChannelListener`] accepts inbound connections and hands each one to
//! its connect handlers as a server-side channel whose id is the peer's
//! socket address.

use super::frame::{read_frame, write_frame, EventEnvelope};
use crate::channel::{
    Channel, ConnectHandler, EventHandler, EventListeners, LifecycleHandler, Listener,
};
use crate::config::TransportConfig;
use crate::{Result, RpcError};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// A duplex channel over one TCP connection.
pub struct TcpChannel {
    id: String,
    listeners: EventListeners,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpChannel {
    /// Connect to a listening peer.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Transport {
                message: format!(
                    "connect timed out after {:?}",
                    TransportConfig::CONNECT_TIMEOUT
                ),
            })??;
        let peer_addr = stream.peer_addr()?;
        debug!("Connected to {}", peer_addr);
        Ok(Self::spawn(stream, peer_addr.to_string()))
    }

    /// Build the channel without starting its I/O tasks, so that handlers
    /// can be attached before the first inbound frame is dispatched.
    fn open(stream: TcpStream, id: String, stop: Option<watch::Receiver<bool>>) -> (Arc<Self>, Pump) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", id, e);
        }
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let channel = Arc::new(Self {
            id,
            listeners: EventListeners::new(),
            outbound,
            shutdown_tx,
        });
        channel.listeners.notify_connect();

        let pump = Pump {
            reader,
            writer,
            outbound_rx,
            shutdown_rx,
            stop,
            channel: Arc::downgrade(&channel),
        };
        (channel, pump)
    }

    fn spawn(stream: TcpStream, id: String) -> Arc<Self> {
        let (channel, pump) = Self::open(stream, id, None);
        pump.start();
        channel
    }

    /// Number of handlers subscribed to `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.listener_count(event)
    }

    pub fn is_closed(&self) -> bool {
        self.listeners.is_closed()
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        mut shutdown_rx: watch::Receiver<bool>,
        mut stop: Option<watch::Receiver<bool>>,
        channel: Weak<TcpChannel>,
    ) {
        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => result,
                _ = stopped(&mut shutdown_rx) => return,
                _ = listener_stopped(&mut stop) => break,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!("TCP channel read ended: {}", e);
                    break;
                }
            };

            let Some(channel) = channel.upgrade() else {
                return;
            };
            match EventEnvelope::decode(&frame) {
                Ok(envelope) => {
                    if channel.listeners.dispatch(&envelope.event, envelope.payload) == 0 {
                        debug!(channel = %channel.id, event = %envelope.event, "No listener, event dropped");
                    }
                }
                Err(e) => warn!(channel = %channel.id, error = %e, "Dropping undecodable frame"),
            }
        }

        if let Some(channel) = channel.upgrade() {
            channel.close();
        }
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut shutdown_rx: watch::Receiver<bool>,
        channel: Weak<TcpChannel>,
    ) {
        loop {
            let bytes = tokio::select! {
                bytes = outbound_rx.recv() => bytes,
                _ = stopped(&mut shutdown_rx) => return,
            };
            let Some(bytes) = bytes else {
                return;
            };
            if let Err(e) = write_frame(&mut writer, &bytes).await {
                debug!("TCP channel write failed: {}", e);
                break;
            }
        }

        if let Some(channel) = channel.upgrade() {
            channel.close();
        }
    }
}

/// I/O halves of a channel whose tasks have not started yet.
struct Pump {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown_rx: watch::Receiver<bool>,
    stop: Option<watch::Receiver<bool>>,
    channel: Weak<TcpChannel>,
}

impl Pump {
    fn start(self) {
        tokio::spawn(TcpChannel::write_loop(
            self.writer,
            self.outbound_rx,
            self.shutdown_rx.clone(),
            self.channel.clone(),
        ));
        tokio::spawn(TcpChannel::read_loop(
            self.reader,
            self.shutdown_rx,
            self.stop,
            self.channel,
        ));
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn emit(&self, event: &str, payload: Value) -> Result<()> {
        if self.listeners.is_closed() {
            return Err(RpcError::ChannelClosed);
        }
        let bytes = EventEnvelope::new(event, payload).encode()?;
        self.outbound
            .send(bytes)
            .map_err(|_| RpcError::ChannelClosed)
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
            debug!("TCP channel {} closed", self.id);
            self.shutdown_tx.send_replace(true);
        }
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn listener_stopped(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => stopped(rx).await,
        None => std::future::pending::<()>().await,
    }
}

/// Accepts TCP connections and exposes them as server-side channels.
///
/// The accept loop starts with the first connect handler. Dropping the
/// listener stops accepting and closes every channel it produced.
pub struct TcpChannelListener {
    local_addr: SocketAddr,
    runtime: Handle,
    pending: Mutex<Option<TcpListener>>,
    handlers: Arc<Mutex<Vec<ConnectHandler>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TcpChannelListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening for channels on {}", local_addr);

        let (conn_shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            local_addr,
            runtime: Handle::current(),
            pending: Mutex::new(Some(listener)),
            handlers: Arc::new(Mutex::new(Vec::new())),
            shutdown_tx: Mutex::new(None),
            conn_shutdown_tx,
            task_handle: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every accepted channel.
    pub fn shutdown(&self) {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
        self.conn_shutdown_tx.send_replace(true);
    }

    fn start(&self) {
        let Some(listener) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);

        let task = self.runtime.spawn(Self::accept_loop(
            listener,
            self.handlers.clone(),
            shutdown_rx,
            self.conn_shutdown_tx.subscribe(),
            Arc::new(AtomicUsize::new(0)),
        ));
        *self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    async fn accept_loop(
        listener: TcpListener,
        handlers: Arc<Mutex<Vec<ConnectHandler>>>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Channel listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= TransportConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    TransportConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let (channel, pump) = TcpChannel::open(
                                stream,
                                peer_addr.to_string(),
                                Some(conn_shutdown_rx.clone()),
                            );
                            let conns = active_connections.clone();
                            channel.on_disconnect(Arc::new(move || {
                                conns.fetch_sub(1, Ordering::Relaxed);
                            }));

                            debug!("Accepted channel from {}", peer_addr);
                            let handlers = handlers
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .clone();
                            for handler in &handlers {
                                handler(channel.clone());
                            }
                            pump.start();
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

impl Listener for TcpChannelListener {
    fn on_client_connect(&self, handler: ConnectHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
        self.start();
    }
}

impl Drop for TcpChannelListener {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
