//! `call` subcommand.

use crate::handlers;
use anyhow::{bail, Context, Result};
use clap::Args;
use duplex_rpc::transport::TcpChannel;
use duplex_rpc::{Client, FireOptions};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Server address, e.g. 127.0.0.1:4000
    #[arg(long)]
    addr: String,

    /// Event name to call
    #[arg(short, long)]
    event: String,

    /// Positional arguments as a JSON array
    #[arg(long, default_value = "[]")]
    args: String,

    /// Call timeout in milliseconds
    #[arg(long, default_value = "60000")]
    timeout_ms: u64,
}

/// Parse `--args` into positional call arguments.
fn parse_args(raw: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).context("--args must be valid JSON")?;
    match value {
        Value::Array(args) => Ok(args),
        other => bail!("--args must be a JSON array, got {}", other),
    }
}

pub async fn run(args: CallArgs) -> Result<()> {
    let call_args = parse_args(&args.args)?;

    let channel = TcpChannel::connect(args.addr.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.addr))?;
    let client = Client::new(channel);
    client.register("ping", handlers::ping())?;

    let options = FireOptions::new(args.event.as_str(), Duration::from_millis(args.timeout_ms));
    debug!("Calling {} on {}", args.event, args.addr);
    let outcome = client.fire_with(options, call_args).await;
    client.close();

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) if e.is_peer_gone() => {
            error!("Server went away before answering");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
