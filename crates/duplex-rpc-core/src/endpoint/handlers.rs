//! Registered handler table.

use crate::{Result, RpcError};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Callable invoked with the positional arguments of an inbound request.
///
/// An `Err` is answered with a failure Response carrying the error's message.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>);

impl Handler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self(Arc::new(move |args| f(args).boxed()))
    }

    pub fn call(&self, args: Vec<Value>) -> HandlerFuture {
        (self.0)(args)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler")
    }
}

/// Event name to handler mapping. Each event name maps to exactly one handler.
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handler, refusing to replace an existing one.
    pub fn insert(&self, event_name: String, handler: Handler) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&event_name) {
            return Err(RpcError::DuplicateRegistration { event_name });
        }
        handlers.insert(event_name, handler);
        Ok(())
    }

    pub fn get(&self, event_name: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .cloned()
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(event_name)
    }

    /// Registered event names, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_duplicate_insert_keeps_first_handler() {
        let table = HandlerTable::new();
        table
            .insert("who".into(), Handler::new(|_| async { Ok(json!("first")) }))
            .unwrap();

        let err = table
            .insert("who".into(), Handler::new(|_| async { Ok(json!("second")) }))
            .unwrap_err();
        assert!(matches!(err, RpcError::DuplicateRegistration { .. }));

        let handler = table.get("who").unwrap();
        assert_eq!(handler.call(vec![]).await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn test_handler_receives_positional_args() {
        let handler = Handler::new(|args: Vec<Value>| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        });
        assert_eq!(
            handler.call(vec![json!(1), json!(2), json!(3)]).await.unwrap(),
            json!(6)
        );
    }

    #[test]
    fn test_event_names_sorted() {
        let table = HandlerTable::new();
        for name in ["b", "a", "c"] {
            table
                .insert(name.into(), Handler::new(|_| async { Ok(Value::Null) }))
                .unwrap();
        }
        assert_eq!(table.event_names(), vec!["a", "b", "c"]);
        assert!(table.contains("a"));
        assert!(!table.contains("z"));
    }
}
