//! Handlers registered by both subcommands.

use duplex_rpc::Handler;
use serde_json::{json, Value};

/// Answers `"pong"` with the caller's first argument, if any.
pub fn ping() -> Handler {
    Handler::new(|args: Vec<Value>| async move {
        Ok(match args.into_iter().next() {
            Some(tag) => json!({ "pong": tag }),
            None => json!("pong"),
        })
    })
}

/// Returns the arguments unchanged as an array.
pub fn echo() -> Handler {
    Handler::new(|args: Vec<Value>| async move { Ok(Value::Array(args)) })
}
