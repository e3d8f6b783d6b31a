//! duplex-rpc - Bidirectional request/response RPC over duplex event channels.
//!
//! Either side of a connection can call into the other and await a
//! correlated reply. Each call carries a fresh correlation id, races its
//! response against a timeout, and passes through an ordered middleware
//! pipeline. The server role additionally tracks every connected peer and can
//! broadcast a call to all of them.
//!
//! # Example
//!
//! ```rust,ignore
//! use duplex_rpc::transport::{TcpChannel, TcpChannelListener};
//! use duplex_rpc::{Client, Handler, Server};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> duplex_rpc::Result<()> {
//!     let listener = TcpChannelListener::bind("127.0.0.1:0").await?;
//!     let server = Server::new();
//!     server.register("sum", Handler::new(|args| async move {
//!         Ok(json!(args.iter().filter_map(|v| v.as_i64()).sum::<i64>()))
//!     }))?;
//!     server.listen(&listener);
//!
//!     let client = Client::new(TcpChannel::connect(listener.local_addr()).await?);
//!     let total = client.fire("sum", vec![json!(2), json!(3)]).await?;
//!     assert_eq!(total, json!(5));
//!
//!     let answers = server.broadcast_wait_all("status", vec![]).await;
//!     println!("{} peers answered", answers.len());
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod middleware;
pub mod packet;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use channel::{Channel, Listener};
pub use client::Client;
pub use config::{EndpointConfig, FireOptions, RpcConfig, TransportConfig};
pub use endpoint::{Endpoint, Handler};
pub use error::{Result, RpcError};
pub use middleware::{ConnectionEvent, Flow, Middleware, Registration, Stage};
pub use packet::{CorrelationId, RequestPacket, ResponsePacket, Role};
pub use server::{BroadcastResult, BroadcastStrategy, ConnectionPool, PeerOutcome, Server};
