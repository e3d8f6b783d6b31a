//! `serve` subcommand.

use crate::handlers;
use anyhow::Result;
use clap::{Args, ValueEnum};
use duplex_rpc::transport::TcpChannelListener;
use duplex_rpc::{BroadcastStrategy, Flow, Middleware, Server};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Event to broadcast to every peer on an interval
    #[arg(long)]
    broadcast: Option<String>,

    /// How broadcast answers are combined
    #[arg(long, value_enum, default_value_t = Strategy::WaitAll)]
    strategy: Strategy,

    /// Broadcast interval in milliseconds
    #[arg(long, default_value = "5000")]
    interval_ms: u64,

    /// Per-peer broadcast timeout in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    /// Every peer's answer, failures as null
    WaitAll,
    /// Truthy answers only
    WaitNotNull,
    /// First truthy answer
    Race,
}

impl From<Strategy> for BroadcastStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::WaitAll => BroadcastStrategy::WaitAll,
            Strategy::WaitNotNull => BroadcastStrategy::WaitAllExceptUndefined,
            Strategy::Race => BroadcastStrategy::Race,
        }
    }
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let listener = TcpChannelListener::bind((args.host.as_str(), args.port)).await?;
    let addr = listener.local_addr();

    let server = Server::new();
    server.register("ping", handlers::ping())?;
    server.register("echo", handlers::echo())?;
    server.use_middleware(Middleware::on_connection(|event| async move {
        info!("Peer connected: {}", event.peer);
        Flow::Continue(event)
    }));
    server.use_middleware(Middleware::on_disconnection(|event| async move {
        info!("Peer disconnected: {}", event.peer);
        Flow::Continue(event)
    }));
    server.listen(&listener);
    info!(
        "Handlers: {}",
        server.endpoint().handlers().event_names().join(", ")
    );

    // Print port for scripts to read (intentional stdout)
    println!("RPC_PORT={}", addr.port());
    info!("Server running on {}", addr);

    match args.broadcast {
        Some(event) => {
            let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if server.peers().is_empty() {
                            continue;
                        }
                        let strategy = BroadcastStrategy::from(args.strategy);
                        let timeout = Duration::from_millis(args.timeout_ms);
                        match server.broadcast(event.as_str(), strategy, timeout, vec![]).await {
                            Ok(result) => match serde_json::to_string(&result.into_values()) {
                                Ok(json) => info!("Broadcast {} ({}) -> {}", event, strategy, json),
                                Err(e) => warn!("Broadcast {} result not printable: {}", event, e),
                            },
                            Err(e) => warn!("Broadcast {} ({}) failed: {}", event, strategy, e),
                        }
                    }
                    result = tokio::signal::ctrl_c() => {
                        result?;
                        break;
                    }
                }
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("Shutdown signal received, exiting");
    listener.shutdown();
    Ok(())
}
