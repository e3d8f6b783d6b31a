//! duplex-rpc - command-line server and client for duplex-rpc over TCP.
//!
//! `serve` runs a server that answers `ping` and `echo` and can broadcast to
//! its peers on an interval. `call` connects as a client, fires one event and
//! prints the JSON result.

mod call;
mod handlers;
mod serve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "duplex-rpc")]
#[command(about = "Bidirectional RPC over TCP")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept peers and answer their calls
    Serve(serve::ServeArgs),
    /// Connect to a server and fire one call
    Call(call::CallArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve(serve_args) => serve::run(serve_args).await,
        Command::Call(call_args) => call::run(call_args).await,
    }
}
