//! Live peer channels across every listener a server accepts from.
//!
//! Entries are keyed `"<listenerId>::<peerId>"`. An entry exists from the
//! moment its peer connects until the peer's channel disconnects. Snapshots
//! list peers in connection order.

use crate::channel::{Channel, Listener};
use crate::endpoint::Endpoint;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PoolEntry {
    seq: u64,
    channel: Arc<dyn Channel>,
}

/// Server-side registry of connected peers.
///
/// Each accepted channel is answered by the server endpoint, and the
/// endpoint's `ON_CONNECTION` / `ON_DISCONNECTION` chains run from here.
pub struct ConnectionPool {
    endpoint: Arc<Endpoint>,
    entries: Mutex<HashMap<String, PoolEntry>>,
    next_seq: AtomicU64,
}

impl ConnectionPool {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            entries: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn key(listener_id: &str, peer_id: &str) -> String {
        format!("{}::{}", listener_id, peer_id)
    }

    /// Start tracking peers accepted by `listener`. Returns the listener id.
    pub fn add_listener(self: &Arc<Self>, listener: &dyn Listener) -> String {
        let listener_id = Uuid::new_v4().to_string();
        let pool = Arc::downgrade(self);
        let id = listener_id.clone();
        listener.on_client_connect(Arc::new(move |channel| {
            if let Some(pool) = pool.upgrade() {
                pool.insert(&id, channel);
            }
        }));

        info!(listener = %listener_id, "Listener added to connection pool");
        listener_id
    }

    fn insert(self: &Arc<Self>, listener_id: &str, channel: Arc<dyn Channel>) {
        let key = Self::key(listener_id, channel.id());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let replaced = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.clone(),
                PoolEntry {
                    seq,
                    channel: channel.clone(),
                },
            );
        if replaced.is_some() {
            warn!(peer = %key, "Peer reconnected under an existing key, replacing entry");
        }

        self.endpoint.attach(&channel);

        let pool: Weak<Self> = Arc::downgrade(self);
        let removed_key = key.clone();
        channel.on_disconnect(Arc::new(move || {
            if let Some(pool) = pool.upgrade() {
                pool.remove(&removed_key, seq);
            }
        }));

        debug!(peer = %key, "Peer added to pool");
        self.endpoint.connection_opened(&channel, key);
    }

    fn remove(&self, key: &str, seq: u64) {
        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some(entry) if entry.seq == seq => entries.remove(key).is_some(),
                _ => false,
            }
        };
        if removed {
            debug!(peer = %key, "Peer removed from pool");
            self.endpoint.connection_closed(key.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Channel>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|entry| entry.channel.clone())
    }

    /// Keys of every connected peer at call time, in connection order.
    pub fn list_all(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|(key, _)| key).collect()
    }

    /// Keys and channels of every connected peer at call time, in
    /// connection order.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn Channel>)> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut peers: Vec<(u64, String, Arc<dyn Channel>)> = entries
            .iter()
            .map(|(key, entry)| (entry.seq, key.clone(), entry.channel.clone()))
            .collect();
        drop(entries);
        peers.sort_by_key(|(seq, _, _)| *seq);
        peers
            .into_iter()
            .map(|(_, key, channel)| (key, channel))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::packet::Role;
    use crate::transport::memory::MemoryListener;

    fn pool() -> Arc<ConnectionPool> {
        let endpoint = Arc::new(Endpoint::new(Role::Server, EndpointConfig::default()));
        Arc::new(ConnectionPool::new(endpoint))
    }

    #[tokio::test]
    async fn test_keys_are_listener_scoped() {
        let pool = pool();
        let first = MemoryListener::new();
        let second = MemoryListener::new();
        let first_id = pool.add_listener(&first);
        let second_id = pool.add_listener(&second);
        assert_ne!(first_id, second_id);

        let _a = first.connect("peer");
        let _b = second.connect("peer");

        assert_eq!(
            pool.list_all(),
            vec![
                ConnectionPool::key(&first_id, "peer"),
                ConnectionPool::key(&second_id, "peer"),
            ]
        );
        assert!(pool.get(&ConnectionPool::key(&first_id, "peer")).is_some());
        assert!(pool.get(&ConnectionPool::key(&first_id, "ghost")).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_removes_entry() {
        let pool = pool();
        let listener = MemoryListener::new();
        let listener_id = pool.add_listener(&listener);

        let a = listener.connect("a");
        let _b = listener.connect("b");
        assert_eq!(pool.len(), 2);

        a.close();
        assert_eq!(pool.list_all(), vec![ConnectionPool::key(&listener_id, "b")]);
    }

    #[tokio::test]
    async fn test_snapshot_is_not_a_live_view() {
        let pool = pool();
        let listener = MemoryListener::new();
        pool.add_listener(&listener);

        let a = listener.connect("a");
        let before = pool.list_all();
        a.close();

        assert_eq!(before.len(), 1);
        assert!(pool.is_empty());
        assert!(pool.get(&before[0]).is_none());
    }
}
