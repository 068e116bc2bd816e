//! Errors raised by storage backends

use std::fmt;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug)]
pub enum StorageError {
    /// The database could not be opened at `path`
    Open { path: String, reason: String },

    /// Schema migrations did not apply
    Migration(String),

    /// A read or write against an open database failed
    Query(String),

    /// The configured backend is not compiled in
    Unavailable(&'static str),

    /// A stored column holds a value no record can carry
    CorruptRow { column: &'static str, value: String },

    Io(std::io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Open { path, reason } => {
                write!(f, "failed to open database {path}: {reason}")
            }
            StorageError::Migration(msg) => write!(f, "database migration failed: {msg}"),
            StorageError::Query(msg) => write!(f, "storage query failed: {msg}"),
            StorageError::Unavailable(backend) => {
                write!(f, "storage backend '{backend}' is not available in this build")
            }
            StorageError::CorruptRow { column, value } => {
                write!(f, "corrupt stored row: {column} = '{value}'")
            }
            StorageError::Io(err) => write!(f, "storage I/O error: {err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => StorageError::Io(io_err),
            sqlx::Error::ColumnDecode { index, source } => StorageError::CorruptRow {
                column: "decode",
                value: format!("{index}: {source}"),
            },
            other => StorageError::Query(other.to_string()),
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::Migration(err.to_string())
    }
}
