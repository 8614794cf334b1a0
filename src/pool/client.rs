//! Per-URL connection pool: the client-side multiplexer in front of the
//! generic engine in [`super::engine`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::TcpStream;

use crate::errors::{Error, PoolError};
use crate::wire::envelope::WriteLock;

use super::engine::{Connection, EngineConfig, EngineError, Manager, Pool};

/// One authenticated wire channel to a remote server URL. Carries its own
/// write lock since a channel, once handed out, may be driven
/// concurrently by request and housekeeping tasks.
pub struct Channel {
    url: String,
    stream: BufStream<TcpStream>,
    write_lock: WriteLock,
    connected: AtomicBool,
    /// Weak back-reference so a channel can signal its owning pool on
    /// close without creating a reference cycle.
    owner: Weak<ConnectionPoolInner>,
}

impl Channel {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn write_lock(&self) -> &WriteLock {
        &self.write_lock
    }

    pub fn stream_mut(&mut self) -> &mut (impl AsyncRead + AsyncWrite + Unpin) {
        &mut self.stream
    }

    /// Invoked when the transport layer observes the peer closed the
    /// socket; notifies the owning pool so it can evict and decrement its
    /// counters.
    fn notify_closed(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(owner) = self.owner.upgrade() {
            owner.on_channel_closed();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.is_connected() {
            self.notify_closed();
        }
    }
}

struct ServerManager {
    url: String,
    pool_owner: Weak<ConnectionPoolInner>,
    connect_timeout: Duration,
}

#[async_trait::async_trait]
impl Manager for ServerManager {
    type Connection = Channel;
    type Error = Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.url))
            .await
            .map_err(|_| Error::Pool(PoolError::Timeout))?
            .map_err(Error::Io)?;
        Ok(Channel {
            url: self.url.clone(),
            stream: BufStream::new(stream),
            write_lock: WriteLock::new(),
            connected: AtomicBool::new(true),
            owner: self.pool_owner.clone(),
        })
    }

    async fn check(&self, conn: Self::Connection) -> Result<Self::Connection, Self::Error> {
        if conn.is_connected() {
            Ok(conn)
        } else {
            Err(Error::Pool(PoolError::BadConnection))
        }
    }

    fn validate(&self, conn: &mut Self::Connection) -> bool {
        conn.is_connected()
    }
}

struct ConnectionPoolInner {
    closed: AtomicBool,
}

impl ConnectionPoolInner {
    fn on_channel_closed(&self) {
        // The engine's own idle-list bookkeeping already drops the entry
        // the next time it is popped and fails `check`; this hook exists so
        // external observers (stats, reconnect logic) have a single place
        // to react to a closed back-channel without reaching into the engine.
    }
}

/// Per-URL bounded pool of authenticated channels.
#[derive(Clone)]
pub struct ConnectionPool {
    url: String,
    engine: Pool<ServerManager>,
    inner: Arc<ConnectionPoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionPool({})", self.url)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u64,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    pub max_lifetime: Option<Duration>,
    pub max_idle_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
            max_idle_lifetime: Some(Duration::from_secs(10 * 60)),
        }
    }
}

impl ConnectionPool {
    fn new(url: &str, cfg: &PoolConfig) -> Self {
        let inner = Arc::new(ConnectionPoolInner {
            closed: AtomicBool::new(false),
        });
        let manager = ServerManager {
            url: url.to_string(),
            pool_owner: Arc::downgrade(&inner),
            connect_timeout: cfg.connect_timeout,
        };
        let engine = Pool::new(
            manager,
            EngineConfig {
                max_open: cfg.max_connections,
                max_idle: cfg.max_connections,
                max_lifetime: cfg.max_lifetime,
                max_idle_lifetime: cfg.max_idle_lifetime,
                get_timeout: Some(cfg.acquire_timeout),
                ..Default::default()
            },
        );
        ConnectionPool {
            url: url.to_string(),
            engine,
            inner,
        }
    }

    pub async fn acquire(&self) -> Result<Connection<ServerManager>, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Pool(PoolError::Closed));
        }
        self.engine.get().await.map_err(engine_error_to_crate_error)
    }

    /// A channel observed disconnected on release is discarded, not
    /// returned to the pool.
    pub fn release(&self, channel: Connection<ServerManager>) {
        if !channel.is_connected() {
            self.engine.discard_on_release(channel);
        }
        // otherwise: dropping the guard triggers the engine's own recycle.
    }

    /// `remove` tries to unlock then close the channel and always evicts it,
    /// since the engine drops (and thus closes) a discarded connection
    /// immediately, remove and a failed release share the same path here.
    pub fn remove(&self, channel: Connection<ServerManager>) {
        self.engine.discard_on_release(channel);
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub async fn max_resources(&self) -> u64 {
        self.engine.state().await.max_open
    }

    pub async fn available(&self) -> u64 {
        self.engine.state().await.idle
    }

    pub async fn created(&self) -> u64 {
        self.engine.state().await.connections
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn engine_error_to_crate_error(err: EngineError<Error>) -> Error {
    match err {
        EngineError::PoolClosed => Error::Pool(PoolError::Closed),
        EngineError::BadConn => Error::Pool(PoolError::BadConnection),
        EngineError::Timeout => Error::Pool(PoolError::Timeout),
        EngineError::Inner(inner) => inner,
    }
}

pub type PoolMap = HashMap<String, ConnectionPool>;

/// Globally accessible url → pool map, read-optimized and swapped wholesale
/// on reconfiguration.
pub static POOLS: Lazy<ArcSwap<PoolMap>> = Lazy::new(|| ArcSwap::from_pointee(HashMap::new()));

/// Race-safe "create the pool for this URL if absent"; the loser's freshly
/// built pool is simply dropped.
pub fn get_or_create_pool(url: &str, cfg: &PoolConfig) -> ConnectionPool {
    if let Some(existing) = POOLS.load().get(url) {
        return existing.clone();
    }
    let candidate = ConnectionPool::new(url, cfg);
    loop {
        let current = POOLS.load();
        if let Some(existing) = current.get(url) {
            return existing.clone();
        }
        let mut next = (**current).clone();
        next.insert(url.to_string(), candidate.clone());
        let next = Arc::new(next);
        let prev = POOLS.compare_and_swap(&current, next.clone());
        if Arc::ptr_eq(&prev, &current) {
            return candidate;
        }
        // lost the race; loop and re-check whether someone else inserted
        // this URL in the meantime.
    }
}

pub fn get_pool(url: &str) -> Option<ConnectionPool> {
    POOLS.load().get(url).cloned()
}

pub fn get_all_pools() -> Vec<ConnectionPool> {
    POOLS.load().values().cloned().collect()
}

/// Remove a URL's entry outright; used when pool creation/retrieval hits an
/// unrecoverable error so the next caller reconstructs it from scratch.
pub fn drop_pool(url: &str) {
    loop {
        let current = POOLS.load();
        if !current.contains_key(url) {
            return;
        }
        let mut next = (**current).clone();
        next.remove(url);
        let next = Arc::new(next);
        let prev = POOLS.compare_and_swap(&current, next);
        if Arc::ptr_eq(&prev, &current) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_defaults_are_sane() {
        let cfg = PoolConfig::default();
        assert!(cfg.max_connections > 0);
        assert!(cfg.acquire_timeout > Duration::from_secs(0));
    }

    #[test]
    fn get_pool_misses_for_unknown_url() {
        assert!(get_pool("tcp://does-not-exist:0").is_none());
    }
}
