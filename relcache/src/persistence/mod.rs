//! Storage layers behind a model.
//!
//! - `secondary`: durable SQL store, reached through the [`SqlStore`] seam
//! - `primary`: cache layer holding entity records and query results
//! - `scheduler`: orders writes across both layers

pub mod cache_store;
pub mod engine;
pub mod memory_store;
pub mod primary;
pub mod scheduler;
pub mod secondary;
pub mod sqlite_store;
pub mod store;

pub use cache_store::CacheStore;
pub use engine::{EngineCapabilities, SqlEngine};
pub use memory_store::{MemoryStore, MemoryStoreStats, TableSchema};
pub use primary::{CachePrimaryModelManager, PrimaryModelManager};
pub use scheduler::SchedulerModelManager;
pub use secondary::SecondaryEntityManager;
pub use sqlite_store::SqliteStore;
pub use store::{Order, Predicate, SqlStore, Statement, StatementOutcome, StoreTransaction};
