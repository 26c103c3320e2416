// ABOUTME: Connection pool keyed by endpoint with reference counting and idle eviction.
// ABOUTME: Unusable connections (closed transport or failed keepalive) are invalidated on acquire.

use super::connection::Connection;
use super::endpoint::Endpoint;
use super::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// A connection the pool can hand out and retire.
#[async_trait]
pub trait Poolable: Send + Sync + 'static {
    fn is_usable(&self) -> bool;
    async fn close(&self);
}

#[async_trait]
impl Poolable for Connection {
    fn is_usable(&self) -> bool {
        Connection::is_usable(self)
    }

    async fn close(&self) {
        if let Err(e) = Connection::close(self).await {
            tracing::debug!(endpoint = %self.endpoint(), error = %e, "error closing pooled connection");
        }
    }
}

struct PoolEntry<C> {
    connection: Arc<C>,
    last_used: Instant,
}

/// Shares one connection per endpoint between callers.
pub struct ConnectionPool<C: Poolable = Connection> {
    entries: Mutex<HashMap<Endpoint, PoolEntry<C>>>,
    idle_timeout: Duration,
}

impl<C: Poolable> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl<C: Poolable> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl<C: Poolable> ConnectionPool<C> {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Reuse the pooled connection for `endpoint`, or establish a new one with `connect`.
    ///
    /// Every acquisition first evicts idle and unusable entries, so a pool
    /// that keeps being used never holds expired connections.
    ///
    /// Concurrent first acquisitions for the same endpoint may each connect;
    /// the last one to finish is kept and the others stay with their callers.
    pub async fn acquire<F, Fut>(&self, endpoint: &Endpoint, connect: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        self.evict_idle().await;

        let stale = {
            let mut entries = self.entries.lock();
            match entries.get_mut(endpoint) {
                Some(entry) if entry.connection.is_usable() => {
                    entry.last_used = Instant::now();
                    tracing::trace!(endpoint = %endpoint, "reusing pooled connection");
                    return Ok(Arc::clone(&entry.connection));
                }
                Some(_) => entries.remove(endpoint).map(|entry| entry.connection),
                None => None,
            }
        };

        if let Some(stale) = stale {
            tracing::debug!(endpoint = %endpoint, "discarding unusable pooled connection");
            stale.close().await;
        }

        let connection = Arc::new(connect().await?);
        let replaced = self.entries.lock().insert(
            endpoint.clone(),
            PoolEntry {
                connection: Arc::clone(&connection),
                last_used: Instant::now(),
            },
        );
        if let Some(replaced) = replaced {
            if Arc::strong_count(&replaced.connection) == 1 {
                replaced.connection.close().await;
            }
        }
        Ok(connection)
    }

    /// Mark the connection for `endpoint` as recently used.
    pub fn release(&self, endpoint: &Endpoint) {
        if let Some(entry) = self.entries.lock().get_mut(endpoint) {
            entry.last_used = Instant::now();
        }
    }

    /// Remove and close the connection for `endpoint`.
    pub async fn invalidate(&self, endpoint: &Endpoint) {
        let removed = self.entries.lock().remove(endpoint);
        if let Some(entry) = removed {
            tracing::debug!(endpoint = %endpoint, "invalidating pooled connection");
            entry.connection.close().await;
        }
    }

    /// Drop `connection` after it failed. The pool entry for `endpoint` is
    /// removed only if it still refers to that same connection, so a late
    /// report about a replaced connection leaves its successor alone.
    pub async fn invalidate_connection(&self, endpoint: &Endpoint, connection: &Arc<C>) {
        let removed = {
            let mut entries = self.entries.lock();
            let current = entries
                .get(endpoint)
                .is_some_and(|entry| Arc::ptr_eq(&entry.connection, connection));
            if current { entries.remove(endpoint) } else { None }
        };

        match removed {
            Some(entry) => {
                tracing::debug!(endpoint = %endpoint, "invalidating failed pooled connection");
                drop(entry);
                connection.close().await;
            }
            None if Arc::strong_count(connection) == 1 => connection.close().await,
            None => {}
        }
    }

    /// Close connections idle past the timeout that no caller holds,
    /// plus any that became unusable. Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<Arc<C>> = {
            let mut entries = self.entries.lock();
            let doomed: Vec<Endpoint> = entries
                .iter()
                .filter(|(_, entry)| {
                    let idle = now.saturating_duration_since(entry.last_used) >= self.idle_timeout;
                    let unheld = Arc::strong_count(&entry.connection) == 1;
                    (idle && unheld) || !entry.connection.is_usable()
                })
                .map(|(endpoint, _)| endpoint.clone())
                .collect();
            doomed
                .iter()
                .filter_map(|endpoint| entries.remove(endpoint))
                .map(|entry| entry.connection)
                .collect()
        };

        for connection in &evicted {
            connection.close().await;
        }
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted pooled connections");
        }
        evicted.len()
    }

    /// Close every pooled connection.
    pub async fn close_all(&self) {
        let drained: Vec<PoolEntry<C>> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.connection.close().await;
        }
    }
}
