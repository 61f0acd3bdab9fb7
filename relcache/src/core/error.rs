use thiserror::Error;

/// Main error type for relcache operations
#[derive(Debug, Error)]
pub enum RelCacheError {
    #[error("Duplicate model alias: {0}")]
    DuplicateAlias(String),

    #[error("Model for table {table} declares id field \"{id}\" but has no column with that alias")]
    MissingIdColumn { table: String, id: String },

    #[error("Model for table {table} declares column {column} more than once")]
    DuplicateColumn { table: String, column: String },

    #[error("Model for table {0} declares more than one auto generated column")]
    MultipleAutoGeneratedColumns(String),

    #[error("A numeric column is expected, got column {0}")]
    NonNumericRangeColumn(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Unknown SQL engine: {0}")]
    UnknownEngine(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing query parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid query parameters: {0}")]
    InvalidQueryParameters(String),

    #[error("Query {0} does not support batched execution")]
    BatchQueryUnsupported(String),

    #[error("An entity was expected")]
    EmptyReferenceEntity,

    #[error("Reference to model alias {0} is not resolved yet")]
    UnresolvedReference(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Constraint violation on {table}.{column}: {value}")]
    ConstraintViolation {
        table: String,
        column: String,
        value: String,
    },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Error classes, used to decide how a failure is surfaced and whether it may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    InvalidQueryParameters,
    Reference,
    Conversion,
    DurableStore,
    Cache,
}

impl RelCacheError {
    /// Get the error class
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateAlias(_)
            | Self::MissingIdColumn { .. }
            | Self::DuplicateColumn { .. }
            | Self::MultipleAutoGeneratedColumns(_)
            | Self::NonNumericRangeColumn(_)
            | Self::UnknownColumn(_)
            | Self::UnknownEngine(_)
            | Self::InvalidConfig(_) => ErrorKind::Configuration,
            Self::MissingParameter(_)
            | Self::InvalidQueryParameters(_)
            | Self::BatchQueryUnsupported(_) => ErrorKind::InvalidQueryParameters,
            Self::EmptyReferenceEntity | Self::UnresolvedReference(_) => ErrorKind::Reference,
            Self::InvalidValue(_) => ErrorKind::Conversion,
            Self::Store(_)
            | Self::Transaction(_)
            | Self::ConstraintViolation { .. }
            | Self::UnknownTable(_) => ErrorKind::DurableStore,
            Self::Cache(_) | Self::MemoryLimitExceeded | Self::SerializationError(_) => {
                ErrorKind::Cache
            }
        }
    }

    /// Configuration and parameter errors must be fixed by the caller, never retried
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::DurableStore | ErrorKind::Cache)
    }
}

impl From<serde_json::Error> for RelCacheError {
    fn from(e: serde_json::Error) -> Self {
        RelCacheError::SerializationError(e.to_string())
    }
}

/// Result type alias for relcache operations
pub type Result<T> = std::result::Result<T, RelCacheError>;
