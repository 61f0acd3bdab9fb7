//! Cache-accelerated access layer for relational entities.
//!
//! Models are registered once, queries are declared through a
//! [`QueryConfigFactory`], and all reads and writes go through a
//! [`SchedulerModelManager`] that keeps the cache consistent with the
//! durable store.

pub mod config;
pub mod core;
pub mod logging;
pub mod model;
pub mod persistence;
pub mod query;

// Re-export commonly used types
pub use config::{CacheStoreConfig, EngineConfig, LoggingConfig, RelCacheConfig};
pub use core::{
    CacheConfig, CacheMode, Entity, ErrorKind, Id, PersistencyOptions, Record, RelCacheError,
    Result, Row, Value,
};
pub use model::{
    AutoGenerationStrategy, Column, ColumnDefinition, Model, ModelDefinition, ModelRegistry,
    Reference, SqlType,
};
pub use persistence::{
    CachePrimaryModelManager, CacheStore, EngineCapabilities, MemoryStore, PrimaryModelManager,
    SchedulerModelManager, SecondaryEntityManager, SqlEngine, SqlStore, SqliteStore, TableSchema,
};
pub use query::{KeyGenOptions, QueryConfig, QueryConfigFactory, QueryParams, QueryResult, RangeOptions};
