//! Redis-backed [`KeyValueCache`].
//!
//! The client connects lazily on first use. If that connect fails the client
//! enters a degraded state for the rest of the process lifetime: every
//! operation reports [`CacheUnavailable::NotConnected`] and callers serve
//! from the origin. There is no reconnect loop.

use std::time::Duration;

use async_trait::async_trait;
use marquee_core::{CacheConnectionConfig, CacheKey, CacheSetName};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;

use super::traits::{ttl_seconds, CacheOutcome, CacheUnavailable, KeyValueCache, ScanPage};

enum ConnState {
    Idle,
    Connected(ConnectionManager),
    Degraded(String),
    Closed,
}

impl std::fmt::Debug for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Idle => f.write_str("Idle"),
            ConnState::Connected(_) => f.write_str("Connected"),
            ConnState::Degraded(reason) => f.debug_tuple("Degraded").field(reason).finish(),
            ConnState::Closed => f.write_str("Closed"),
        }
    }
}

/// Connection status as seen by health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No command has been issued yet.
    Idle,
    Connected,
    /// The initial connect failed; the cache is bypassed.
    Degraded { reason: String },
    Closed,
}

/// Process-wide Redis client.
#[derive(Debug)]
pub struct RedisKeyValueCache {
    config: CacheConnectionConfig,
    state: RwLock<ConnState>,
}

impl RedisKeyValueCache {
    /// Create a client. No network I/O happens until the first command.
    pub fn new(config: CacheConnectionConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ConnState::Idle),
        }
    }

    /// Connect eagerly so startup logs show the outcome. Failure leaves the
    /// client degraded and is not returned as an error.
    pub async fn connect(&self) -> ConnectionStatus {
        let _ = self.connection().await;
        self.status().await
    }

    pub async fn status(&self) -> ConnectionStatus {
        match &*self.state.read().await {
            ConnState::Idle => ConnectionStatus::Idle,
            ConnState::Connected(_) => ConnectionStatus::Connected,
            ConnState::Degraded(reason) => ConnectionStatus::Degraded {
                reason: reason.clone(),
            },
            ConnState::Closed => ConnectionStatus::Closed,
        }
    }

    /// A handle to the shared connection, connecting once if needed.
    async fn connection(&self) -> CacheOutcome<ConnectionManager> {
        {
            let state = self.state.read().await;
            match &*state {
                ConnState::Connected(conn) => return Ok(conn.clone()),
                ConnState::Degraded(reason) => {
                    return Err(CacheUnavailable::NotConnected {
                        reason: reason.clone(),
                    })
                }
                ConnState::Closed => return Err(CacheUnavailable::Closed),
                ConnState::Idle => {}
            }
        }

        let mut state = self.state.write().await;
        // Another task may have connected while we waited for the write lock.
        match &*state {
            ConnState::Connected(conn) => return Ok(conn.clone()),
            ConnState::Degraded(reason) => {
                return Err(CacheUnavailable::NotConnected {
                    reason: reason.clone(),
                })
            }
            ConnState::Closed => return Err(CacheUnavailable::Closed),
            ConnState::Idle => {}
        }

        match self.open().await {
            Ok(conn) => {
                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    db = self.config.db,
                    "Connected to cache"
                );
                *state = ConnState::Connected(conn.clone());
                Ok(conn)
            }
            Err(reason) => {
                tracing::warn!(
                    host = %self.config.host,
                    port = self.config.port,
                    error = %reason,
                    "Cache connection failed, continuing without cache"
                );
                *state = ConnState::Degraded(reason.clone());
                Err(CacheUnavailable::NotConnected { reason })
            }
        }
    }

    async fn open(&self) -> Result<ConnectionManager, String> {
        let client = redis::Client::open(self.config.url()).map_err(|e| e.to_string())?;
        match tokio::time::timeout(self.config.connect_timeout, ConnectionManager::new(client)).await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            )),
        }
    }

    /// Run one command against the shared connection with the response timeout.
    async fn run<T, F, Fut>(&self, op: F) -> CacheOutcome<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.config.response_timeout, op(conn)).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(CacheUnavailable::Unreachable {
                reason: format!("no response within {:?}", self.config.response_timeout),
            }),
        }
    }
}

/// Map a client error onto the outcome type: transport problems are
/// `Unreachable`, anything the server answered is `Command`.
fn classify(err: redis::RedisError) -> CacheUnavailable {
    let reason = err.to_string();
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        CacheUnavailable::Unreachable { reason }
    } else {
        CacheUnavailable::Command { reason }
    }
}

#[async_trait]
impl KeyValueCache for RedisKeyValueCache {
    async fn get(&self, key: &CacheKey) -> CacheOutcome<Option<Vec<u8>>> {
        let key = key.as_str().to_string();
        self.run(|mut conn| async move { conn.get::<_, Option<Vec<u8>>>(key).await })
            .await
    }

    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> CacheOutcome<()> {
        let key = key.as_str().to_string();
        let value = value.to_vec();
        let seconds = ttl_seconds(ttl);
        self.run(|mut conn| async move { conn.set_ex::<_, _, ()>(key, value, seconds).await })
            .await
    }

    async fn delete(&self, keys: &[CacheKey]) -> CacheOutcome<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        self.run(|mut conn| async move { conn.del::<_, u64>(keys).await })
            .await
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> CacheOutcome<ScanPage> {
        let pattern = pattern.to_string();
        let (cursor, keys) = self
            .run(|mut conn| async move {
                let reply: (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(count)
                    .query_async(&mut conn)
                    .await?;
                Ok(reply)
            })
            .await?;
        Ok(ScanPage {
            cursor,
            keys: keys.into_iter().map(CacheKey::from_raw).collect(),
        })
    }

    async fn add_to_set(&self, set: &CacheSetName, key: &CacheKey, ttl: Duration) -> CacheOutcome<()> {
        let set = set.as_str().to_string();
        let key = key.as_str().to_string();
        let seconds = i64::try_from(ttl_seconds(ttl)).unwrap_or(i64::MAX);
        self.run(|mut conn| async move {
            let _: () = redis::pipe()
                .atomic()
                .sadd(&set, key)
                .ignore()
                .expire(&set, seconds)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn set_members(&self, set: &CacheSetName) -> CacheOutcome<Vec<CacheKey>> {
        let set = set.as_str().to_string();
        let members = self
            .run(|mut conn| async move { conn.smembers::<_, Vec<String>>(set).await })
            .await?;
        Ok(members.into_iter().map(CacheKey::from_raw).collect())
    }

    async fn close(&self) -> bool {
        let mut state = self.state.write().await;
        if matches!(*state, ConnState::Closed) {
            return false;
        }
        // Dropping the last ConnectionManager handle closes the socket.
        *state = ConnState::Closed;
        tracing::info!("Cache connection closed");
        true
    }
}
