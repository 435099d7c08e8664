use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum TickError {
    #[error("No such query with id: {0}")]
    UnknownQuery(String),

    #[error("Query {query} is missing argument `{argument}`")]
    MissingArgument { query: String, argument: String },

    #[error("Table {table} already has primary key {existing}; cannot add {duplicate}")]
    DuplicatePrimaryKey {
        table: String,
        existing: String,
        duplicate: String,
    },

    #[error("Table {table} already has a column named {column}")]
    DuplicateColumn { table: String, column: String },

    #[error("Mapped table {0} must declare a primary key field")]
    MissingPrimaryKey(String),

    #[error("Type {0} is not mapped")]
    NotMapped(&'static str),

    #[error(
        "Table {table} is stored at version {stored} but mapped at {current}, and no migrator is configured"
    )]
    MissingMigrator {
        table: String,
        stored: String,
        current: String,
    },

    #[error("Reconciliation of table {table} failed: {reason}")]
    ReconciliationFailed { table: String, reason: String },

    #[error("Table {0} is already being reconciled")]
    ReconcileInProgress(String),

    #[error("Gave up waiting {waited:?} for table {table} to finish reconciling")]
    ReconcileTimeout { table: String, waited: Duration },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Unsupported database kind: {0}")]
    UnsupportedDatabaseKind(String),

    #[error("Database credentials are missing `{0}`")]
    MissingCredential(&'static str),

    #[error("Invalid value for column {column}: {reason}")]
    InvalidValue { column: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Blob encoding error: {0}")]
    Blob(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ractor error: {0}")]
    RactorError(String),
}

impl TickError {
    pub fn invalid_value(column: impl Into<String>, reason: impl Into<String>) -> Self {
        TickError::InvalidValue {
            column: column.into(),
            reason: reason.into(),
        }
    }
}

/// Failure raised while a unit of work ran against the database.
///
/// This is the only error shape that crosses from a worker back to the host;
/// it is plain data so it can be cloned into every interested callback.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{message}")]
pub struct DatabaseError {
    pub message: String,
    /// Vendor error code (SQLSTATE on MySQL, extended result code on SQLite).
    pub vendor_code: Option<String>,
    /// Vendor supplied message, when the driver reported one.
    pub vendor_info: Option<String>,
    /// The statement that failed, when known.
    pub sql: Option<String>,
}

impl DatabaseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            vendor_code: None,
            vendor_info: None,
            sql: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn from_sqlx(err: &sqlx::Error, sql: Option<&str>) -> Self {
        let (vendor_code, vendor_info) = match err.as_database_error() {
            Some(db) => (
                db.code().map(|code| code.into_owned()),
                Some(db.message().to_string()),
            ),
            None => (None, None),
        };
        Self {
            message: err.to_string(),
            vendor_code,
            vendor_info,
            sql: sql.map(str::to_owned),
        }
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::from_sqlx(&err, None)
    }
}

/// Whether an error is worth retrying (transient connectivity) or final.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for sqlx::Error {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_error_keeps_offending_sql() {
        let err = DatabaseError::new("no such table: players").with_sql("SELECT * FROM players");
        assert_eq!(err.to_string(), "no such table: players");
        assert_eq!(err.sql.as_deref(), Some("SELECT * FROM players"));
        assert!(err.vendor_code.is_none());
    }

    #[test]
    fn io_errors_are_retryable() {
        let err = sqlx::Error::Io(std::io::Error::other("connection reset"));
        assert!(err.is_retryable());
        assert!(!sqlx::Error::RowNotFound.is_retryable());
    }
}
