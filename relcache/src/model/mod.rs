pub mod column;
pub mod convert;
pub mod reference;
pub mod registry;
pub mod sql_model;

pub use column::{AutoGenerationStrategy, Column, ColumnDefinition, SqlType};
pub use reference::Reference;
pub use registry::ModelRegistry;
pub use sql_model::{Model, ModelDefinition};
