//! PostgreSQL Document Store
//!
//! Each [`Collection`] is a table of `(id uuid primary key, doc jsonb)`.
//! Unique indexes are real expression indexes over the document fields, so
//! the `(season_id, episode_number)` rule holds even across concurrent
//! transactions. Counter and id-list updates are single `UPDATE` statements
//! built on `jsonb_set`, never read-modify-write in Rust.

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime};
use marquee_core::{ConfigError, EntityId, MarqueeError, MarqueeResult, StorageError};
use marquee_storage::{Collection, DocumentStore, FieldFilter, StoreSession};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;

use crate::error::{CatalogError, CatalogResult};

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait/create timeout for a pooled connection
    pub timeout: Duration,
    /// Server-side limit on any single statement
    pub statement_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "marquee".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
            statement_timeout: Duration::from_secs(15),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from `MARQUEE_DB_*` variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            host: lookup("MARQUEE_DB_HOST").unwrap_or(defaults.host),
            port: lookup("MARQUEE_DB_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: lookup("MARQUEE_DB_NAME").unwrap_or(defaults.dbname),
            user: lookup("MARQUEE_DB_USER").unwrap_or(defaults.user),
            password: lookup("MARQUEE_DB_PASSWORD").unwrap_or_default(),
            max_size: lookup("MARQUEE_DB_POOL_SIZE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            timeout: lookup("MARQUEE_DB_TIMEOUT")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            statement_timeout: lookup("MARQUEE_DB_STATEMENT_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.statement_timeout),
        }
    }

    pub fn validate(&self) -> MarqueeResult<()> {
        if self.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_size".to_string(),
                value: "0".to_string(),
                reason: "pool needs at least one connection".to_string(),
            }
            .into());
        }
        if self.statement_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "statement_timeout".to_string(),
                value: "0".to_string(),
                reason: "zero disables the server-side limit".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Create a connection pool from this configuration.
    ///
    /// No connection is opened here; the first checkout does that.
    pub fn create_pool(&self) -> CatalogResult<Pool> {
        self.pool_config()
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| CatalogError::Pool(e.to_string()))
    }

    fn pool_config(&self) -> Config {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.options = Some(format!(
            "-c statement_timeout={}",
            self.statement_timeout.as_millis()
        ));

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_cfg = deadpool_postgres::PoolConfig::new(self.max_size);
        pool_cfg.timeouts.wait = Some(self.timeout);
        pool_cfg.timeouts.create = Some(self.timeout);
        cfg.pool = Some(pool_cfg);
        cfg
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// DDL for one collection: the table plus its unique expression indexes.
pub fn collection_ddl(collection: Collection) -> String {
    let table = collection.name();
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (id uuid PRIMARY KEY, doc jsonb NOT NULL);"
    );
    for index in collection.unique_indexes() {
        let columns = index
            .fields
            .iter()
            .map(|field| format!("(doc->>'{field}')"))
            .collect::<Vec<_>>()
            .join(", ");
        ddl.push_str(&format!(
            "\nCREATE UNIQUE INDEX IF NOT EXISTS {} ON {table} ({columns});",
            index.name
        ));
    }
    ddl
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

/// Map a driver error onto the storage taxonomy.
///
/// Unique violations become [`StorageError::DuplicateKey`] so the write
/// coordinator can turn them into a business conflict. Anything that looks
/// like a lost connection is [`StorageError::ConnectionReset`], the only
/// storage error the retry executor will replay.
pub fn map_pg_error(collection: Option<Collection>, err: tokio_postgres::Error) -> MarqueeError {
    if let Some(db_err) = err.as_db_error() {
        if db_err.code() == &SqlState::UNIQUE_VIOLATION {
            return StorageError::DuplicateKey {
                collection: collection.map(|c| c.name().to_string()).unwrap_or_default(),
                index: db_err.constraint().unwrap_or("primary key").to_string(),
                value: db_err.detail().unwrap_or_default().to_string(),
            }
            .into();
        }
        if db_err.code() == &SqlState::T_R_SERIALIZATION_FAILURE
            || db_err.code() == &SqlState::T_R_DEADLOCK_DETECTED
        {
            return StorageError::TransactionFailed {
                reason: db_err.message().to_string(),
            }
            .into();
        }
        return StorageError::Backend {
            reason: db_err.message().to_string(),
        }
        .into();
    }

    let io_failure = std::error::Error::source(&err).is_some_and(|s| s.is::<std::io::Error>());
    if err.is_closed() || io_failure {
        return StorageError::ConnectionReset {
            reason: err.to_string(),
        }
        .into();
    }
    StorageError::Backend {
        reason: err.to_string(),
    }
    .into()
}

fn map_pool_error(err: PoolError) -> MarqueeError {
    match err {
        PoolError::Backend(e) => map_pg_error(None, e),
        PoolError::Timeout(_) => StorageError::ConnectionReset {
            reason: "timed out waiting for a pooled connection".to_string(),
        }
        .into(),
        other => StorageError::Backend {
            reason: other.to_string(),
        }
        .into(),
    }
}

fn require_transaction(in_transaction: bool, operation: &str) -> MarqueeResult<()> {
    if in_transaction {
        Ok(())
    } else {
        Err(StorageError::TransactionFailed {
            reason: format!("{operation} requires an active transaction"),
        }
        .into())
    }
}

// ============================================================================
// STORE
// ============================================================================

/// [`DocumentStore`] over a deadpool-postgres pool.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: Pool,
}

impl PgDocumentStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> CatalogResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Create every collection table and unique index if missing.
    pub async fn ensure_schema(&self) -> MarqueeResult<()> {
        let conn = self.pool.get().await.map_err(map_pool_error)?;
        for collection in Collection::ALL {
            conn.batch_execute(&collection_ddl(collection))
                .await
                .map_err(|e| map_pg_error(Some(collection), e))?;
        }
        tracing::info!(collections = Collection::ALL.len(), "Document schema ready");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    type Session = PgSession;

    async fn start_session(&self) -> MarqueeResult<PgSession> {
        let conn = self.pool.get().await.map_err(map_pool_error)?;
        Ok(PgSession {
            conn: Some(conn),
            in_transaction: false,
        })
    }
}

/// One pooled connection.
///
/// Dropping a session returns its connection to the pool, unless a
/// transaction is still open. Fast recycling does not roll back, so that
/// connection is detached from the pool and closed instead.
pub struct PgSession {
    conn: Option<Object>,
    in_transaction: bool,
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        if let Some(conn) = self.conn.take() {
            tracing::warn!("Session dropped inside a transaction, discarding its connection");
            let _detached = Object::take(conn);
        }
    }
}

impl PgSession {
    fn client(&self) -> MarqueeResult<&Object> {
        self.conn.as_ref().ok_or_else(|| {
            StorageError::ConnectionReset {
                reason: "session connection was released".to_string(),
            }
            .into()
        })
    }

    async fn update(
        &mut self,
        collection: Collection,
        operation: &str,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> MarqueeResult<bool> {
        require_transaction(self.in_transaction, operation)?;
        let rows = self
            .client()?
            .execute(sql, params)
            .await
            .map_err(|e| map_pg_error(Some(collection), e))?;
        Ok(rows > 0)
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn start_transaction(&mut self) -> MarqueeResult<()> {
        if self.in_transaction {
            return Err(StorageError::TransactionFailed {
                reason: "transaction already started".to_string(),
            }
            .into());
        }
        self.client()?
            .batch_execute("BEGIN")
            .await
            .map_err(|e| map_pg_error(None, e))?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> MarqueeResult<()> {
        require_transaction(self.in_transaction, "commit")?;
        // Postgres ends the transaction whether COMMIT succeeds or not.
        self.in_transaction = false;
        self.client()?
            .batch_execute("COMMIT")
            .await
            .map_err(|e| map_pg_error(None, e))
    }

    async fn abort_transaction(&mut self) -> MarqueeResult<()> {
        require_transaction(self.in_transaction, "abort")?;
        self.in_transaction = false;
        self.client()?
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| map_pg_error(None, e))
    }

    async fn end_session(&mut self) -> MarqueeResult<()> {
        if self.in_transaction {
            self.abort_transaction().await?;
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn find_raw(
        &mut self,
        collection: Collection,
        id: EntityId,
    ) -> MarqueeResult<Option<JsonValue>> {
        let sql = format!("SELECT doc FROM {} WHERE id = $1", collection.name());
        let row = self
            .client()?
            .query_opt(&sql, &[&id])
            .await
            .map_err(|e| map_pg_error(Some(collection), e))?;
        Ok(row.map(|r| r.get::<_, JsonValue>(0)))
    }

    async fn find_raw_by_fields(
        &mut self,
        collection: Collection,
        filter: &FieldFilter,
    ) -> MarqueeResult<Vec<JsonValue>> {
        // Containment against scalar field values is field equality.
        let sql = format!(
            "SELECT doc FROM {} WHERE doc @> $1 ORDER BY id",
            collection.name()
        );
        let filter = JsonValue::Object(filter.clone());
        let rows = self
            .client()?
            .query(&sql, &[&filter])
            .await
            .map_err(|e| map_pg_error(Some(collection), e))?;
        Ok(rows.into_iter().map(|r| r.get::<_, JsonValue>(0)).collect())
    }

    async fn insert_raw(
        &mut self,
        collection: Collection,
        id: EntityId,
        doc: JsonValue,
    ) -> MarqueeResult<()> {
        let sql = format!("INSERT INTO {} (id, doc) VALUES ($1, $2)", collection.name());
        self.update(collection, "insert", &sql, &[&id, &doc]).await?;
        Ok(())
    }

    async fn delete_raw(&mut self, collection: Collection, id: EntityId) -> MarqueeResult<bool> {
        let sql = format!("DELETE FROM {} WHERE id = $1", collection.name());
        self.update(collection, "delete", &sql, &[&id]).await
    }

    async fn set_fields(
        &mut self,
        collection: Collection,
        id: EntityId,
        fields: FieldFilter,
    ) -> MarqueeResult<bool> {
        let sql = format!("UPDATE {} SET doc = doc || $2 WHERE id = $1", collection.name());
        let patch = JsonValue::Object(fields);
        self.update(collection, "set_fields", &sql, &[&id, &patch]).await
    }

    async fn push_id(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        value: EntityId,
    ) -> MarqueeResult<bool> {
        let sql = format!(
            "UPDATE {} SET doc = jsonb_set(doc, ARRAY[$2::text], \
             COALESCE(doc->$2::text, '[]'::jsonb) || to_jsonb($3::text)) WHERE id = $1",
            collection.name()
        );
        let value = value.to_string();
        self.update(collection, "push_id", &sql, &[&id, &field, &value]).await
    }

    async fn pull_id(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        value: EntityId,
    ) -> MarqueeResult<bool> {
        let sql = format!(
            "UPDATE {} SET doc = jsonb_set(doc, ARRAY[$2::text], COALESCE(\
             (SELECT jsonb_agg(e) FROM jsonb_array_elements(doc->$2::text) e \
              WHERE e <> to_jsonb($3::text)), '[]'::jsonb)) WHERE id = $1",
            collection.name()
        );
        let value = value.to_string();
        self.update(collection, "pull_id", &sql, &[&id, &field, &value]).await
    }

    async fn increment(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        by: i64,
    ) -> MarqueeResult<bool> {
        let sql = format!(
            "UPDATE {} SET doc = jsonb_set(doc, ARRAY[$2::text], \
             to_jsonb(COALESCE((doc->>$2::text)::bigint, 0) + $3::bigint)) WHERE id = $1",
            collection.name()
        );
        self.update(collection, "increment", &sql, &[&id, &field, &by]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_db_config_defaults_and_overrides() {
        let defaults = DbConfig::from_lookup(|_| None);
        assert_eq!(defaults, DbConfig::default());

        let env: HashMap<&str, &str> = [
            ("MARQUEE_DB_HOST", "db.internal"),
            ("MARQUEE_DB_PORT", "6543"),
            ("MARQUEE_DB_POOL_SIZE", "4"),
            ("MARQUEE_DB_TIMEOUT", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = DbConfig::from_lookup(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 6543);
        assert_eq!(config.max_size, 4);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.statement_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_statement_timeout_reaches_connection_options() {
        let config = DbConfig::from_lookup(|name| {
            (name == "MARQUEE_DB_STATEMENT_TIMEOUT_MS").then(|| "2500".to_string())
        });
        assert_eq!(config.statement_timeout, Duration::from_millis(2500));

        let pool_config = config.pool_config();
        assert_eq!(
            pool_config.options.as_deref(),
            Some("-c statement_timeout=2500")
        );
        assert_eq!(
            pool_config.pool.map(|p| p.timeouts.wait),
            Some(Some(Duration::from_secs(30)))
        );

        let disabled = DbConfig {
            statement_timeout: Duration::ZERO,
            ..DbConfig::default()
        };
        assert!(disabled.validate().is_err());
    }

    /// Needs a reachable PostgreSQL configured through `MARQUEE_DB_*`.
    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn test_dropped_transaction_does_not_leak_into_the_pool() {
        let config = DbConfig {
            max_size: 1,
            ..DbConfig::from_env()
        };
        let store = PgDocumentStore::from_config(&config).unwrap();
        store.ensure_schema().await.unwrap();

        let id = marquee_core::new_entity_id();
        {
            let mut session = store.start_session().await.unwrap();
            session.start_transaction().await.unwrap();
            session
                .insert_raw(Collection::TvShows, id, serde_json::json!({"title": "Abandoned"}))
                .await
                .unwrap();
            // Dropped without commit, abort or end_session.
        }

        // The pool holds one connection; reusing the old one would expose
        // the uncommitted insert.
        let mut next = store.start_session().await.unwrap();
        assert!(next.find_raw(Collection::TvShows, id).await.unwrap().is_none());
        next.start_transaction().await.unwrap();
        next.abort_transaction().await.unwrap();
    }

    #[test]
    fn test_zero_pool_rejected() {
        let config = DbConfig {
            max_size: 0,
            ..DbConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_collection_ddl_has_unique_indexes() {
        let ddl = collection_ddl(Collection::Episodes);
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS episodes"));
        assert!(ddl.contains(
            "CREATE UNIQUE INDEX IF NOT EXISTS episodes_season_number_key ON episodes ((doc->>'season_id'), (doc->>'episode_number'));"
        ));

        let shows = collection_ddl(Collection::TvShows);
        assert!(!shows.contains("UNIQUE INDEX"));
    }

    #[tokio::test]
    async fn test_create_pool_is_lazy() {
        let config = DbConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..DbConfig::default()
        };
        let store = PgDocumentStore::from_config(&config).unwrap();
        assert_eq!(store.pool_size(), 0);
    }
}
