//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for buildq_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => buildq_core::Error::NotFound(what),
            DbError::InvalidData(msg) => buildq_core::Error::InvalidInput(msg),
            other => buildq_core::Error::Store(other.to_string()),
        }
    }
}
