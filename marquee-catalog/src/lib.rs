//! Marquee Catalog - Process Edge
//!
//! Environment configuration, tracing setup, the PostgreSQL document store
//! and the catalog read services that feed origin fetches into the
//! cache-aside layer. The `marquee-catalog` binary wires these together.

pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod telemetry;

pub use config::{CacheBackend, CatalogConfig};
pub use db::{collection_ddl, map_pg_error, DbConfig, PgDocumentStore, PgSession};
pub use error::{CatalogError, CatalogResult};
pub use services::{CatalogService, EpisodeQuery, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use telemetry::{init_tracing, TelemetryConfig};
