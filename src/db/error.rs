use thiserror::Error;

use crate::identity::EmbeddingError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(postgres::Error),
    #[cfg(feature = "postgres")]
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    /// Another writer holds or invalidated the rows this unit of work touched.
    #[error("write conflict with a concurrent transaction")]
    Conflict,
    #[error("database connection lock poisoned")]
    Poisoned,
    #[error("corrupt {table} row {id}: {source}")]
    Corrupt {
        table: &'static str,
        id: i64,
        source: EmbeddingError,
    },
    #[error("{table} row {id} not found")]
    MissingRow { table: &'static str, id: i64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether retrying the whole unit of work may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StoreError::Conflict;
            }
        }
        StoreError::Sqlite(err)
    }
}

#[cfg(feature = "postgres")]
impl From<postgres::Error> for StoreError {
    fn from(err: postgres::Error) -> Self {
        use postgres::error::SqlState;

        if let Some(code) = err.code() {
            if *code == SqlState::T_R_SERIALIZATION_FAILURE || *code == SqlState::T_R_DEADLOCK_DETECTED {
                return StoreError::Conflict;
            }
        }
        StoreError::Postgres(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_conflict() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::from(busy).is_conflict());

        let other = rusqlite::Error::QueryReturnedNoRows;
        assert!(!StoreError::from(other).is_conflict());
    }
}
