use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Weak},
};

use tokio::sync::Mutex;
use tracing::debug;

use crate::{mux::ClientMux, Result};

/// Shares client connections between callers by key, typically the server
/// URL.
///
/// The pool only holds weak references: a connection lives as long as some
/// caller keeps its `Arc`. Closed or dropped connections are replaced on the
/// next lookup.
pub struct ClientPool<K> {
    clients: Mutex<HashMap<K, Weak<ClientMux>>>,
}

impl<K> Default for ClientPool<K> {
    fn default() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> ClientPool<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live connection for `key`, or create one with `connect`.
    ///
    /// The lock is held while connecting, so concurrent lookups of a missing
    /// key share a single connection attempt.
    pub async fn get_or_connect<F, Fut>(&self, key: K, connect: F) -> Result<Arc<ClientMux>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ClientMux>>,
    {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key).and_then(Weak::upgrade) {
            if !client.is_closed() {
                return Ok(client);
            }
        }

        debug!("creating pooled wisp connection");
        let client = Arc::new(connect().await?);
        clients.insert(key, Arc::downgrade(&client));
        Ok(client)
    }

    /// Forget the connection for `key`. Existing holders keep it alive.
    pub async fn remove(&self, key: &K) {
        self.clients.lock().await.remove(key);
    }

    /// Number of live connections, pruning dead entries.
    pub async fn len(&self) -> usize {
        let mut clients = self.clients.lock().await;
        clients.retain(|_, client| client.upgrade().is_some_and(|c| !c.is_closed()));
        clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
