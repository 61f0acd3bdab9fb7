//! Cache-addressable predicate queries and the batched executor

pub mod config;
pub mod factory;

pub use config::{EntityKeyGen, KeyGenOptions, QueryConfig, QueryKeyGen, QueryParams, QueryResult};
pub use factory::{QueryConfigFactory, RangeOptions};
