pub mod error;
pub mod types;
pub mod value;

pub use error::{ErrorKind, RelCacheError, Result};
pub use types::{CacheConfig, CacheMode, CacheStats, PersistencyOptions, StoredValue};
pub use value::{Entity, Id, Record, Row, Value};
