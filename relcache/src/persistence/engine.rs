use crate::core::error::{RelCacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// SQL engine behind the durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlEngine {
    #[serde(alias = "pg", alias = "postgresql")]
    Postgres,
    #[serde(alias = "mysql2")]
    MySql,
    MsSql,
    #[serde(alias = "sqlite3")]
    Sqlite,
    #[serde(alias = "oracledb")]
    Oracle,
}

/// Static capabilities of an engine, fixed when the store adapter is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// A multi-row INSERT returns every generated key (class A)
    pub multi_row_returning: bool,
    /// Statements of one transaction may be in flight at the same time
    pub concurrent_transaction_statements: bool,
}

impl EngineCapabilities {
    /// Engine returning all generated keys from one multi-row insert
    pub const CLASS_A: Self = Self {
        multi_row_returning: true,
        concurrent_transaction_statements: true,
    };

    /// Engine returning at most one generated key per insert statement
    pub const CLASS_B: Self = Self {
        multi_row_returning: false,
        concurrent_transaction_statements: true,
    };
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self::CLASS_A
    }
}

impl SqlEngine {
    /// Map a driver name (`pg`, `mysql2`, `sqlite3`, ...) to an engine
    pub fn from_driver_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pg" | "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mysql2" => Ok(Self::MySql),
            "mssql" => Ok(Self::MsSql),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "oracle" | "oracledb" => Ok(Self::Oracle),
            other => Err(RelCacheError::UnknownEngine(other.to_string())),
        }
    }

    /// The one place engines are mapped to capabilities
    pub fn capabilities(&self) -> EngineCapabilities {
        match self {
            Self::Postgres | Self::Oracle => EngineCapabilities::CLASS_A,
            // A single connection per transaction: statements must not overlap
            Self::MsSql => EngineCapabilities {
                multi_row_returning: true,
                concurrent_transaction_statements: false,
            },
            Self::MySql | Self::Sqlite => EngineCapabilities::CLASS_B,
        }
    }

    /// Quote an identifier the way the engine expects
    pub fn quote_identifier(&self, identifier: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", identifier.replace('`', "``")),
            Self::MsSql => format!("[{}]", identifier.replace(']', "]]")),
            Self::Postgres | Self::Sqlite | Self::Oracle => {
                format!("\"{}\"", identifier.replace('"', "\"\""))
            }
        }
    }

    /// Bind placeholder for the n-th parameter (1-based)
    pub fn placeholder(&self, position: usize) -> String {
        match self {
            Self::Postgres => format!("${position}"),
            Self::Oracle => format!(":{position}"),
            Self::MsSql => format!("@p{position}"),
            Self::MySql | Self::Sqlite => "?".to_string(),
        }
    }
}

impl FromStr for SqlEngine {
    type Err = RelCacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_driver_name(s)
    }
}

impl fmt::Display for SqlEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::MsSql => "mssql",
            Self::Sqlite => "sqlite",
            Self::Oracle => "oracle",
        };
        f.write_str(name)
    }
}
