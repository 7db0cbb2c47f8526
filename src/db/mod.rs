mod backend;
mod error;
mod identities;
mod schema;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
mod postgres_schema;

use anyhow::Result;
use chrono::NaiveDate;

pub use backend::IdentityStore;
pub use error::StoreError;
pub use identities::{DailyAnalytics, Identity, IdentityUpdate, NewIdentity, Visit, DEFAULT_LABEL};

use crate::config::DatabaseConfig;
#[cfg(feature = "postgres")]
use crate::config::DatabaseType;

/// Macro to dispatch a method call to the active backend variant.
macro_rules! dispatch {
    // No arguments beyond self
    ($self:expr, $method:ident()) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method(),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method(),
        }
    };
    // With arguments
    ($self:expr, $method:ident($($arg:expr),+ $(,)?)) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method($($arg),+),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method($($arg),+),
        }
    };
}

enum DatabaseInner {
    Sqlite(sqlite::SqliteDb),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgDb),
}

pub struct Database {
    inner: DatabaseInner,
}

impl Database {
    /// Open a database connection based on the provided configuration.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        #[cfg(feature = "postgres")]
        {
            if config.backend == DatabaseType::Postgresql {
                let url = config.postgresql_url.as_deref()
                    .ok_or_else(|| anyhow::anyhow!("PostgreSQL URL not configured"))?;
                let pool_size = config.pool_size.unwrap_or(10);
                let pg = postgres::PgDb::open(url, pool_size)?;
                return Ok(Self { inner: DatabaseInner::Postgres(pg) });
            }
        }

        let db = sqlite::SqliteDb::open(&config.sqlite_path)?;
        Ok(Self { inner: DatabaseInner::Sqlite(db) })
    }

    /// Private SQLite database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = sqlite::SqliteDb::open_in_memory()?;
        Ok(Self { inner: DatabaseInner::Sqlite(db) })
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        dispatch!(self, initialize())
    }

    /// Run `f` as one atomic unit of work against the identity store.
    ///
    /// Everything `f` writes commits together when it returns `Ok` and is
    /// rolled back when it returns `Err`.
    pub fn unit_of_work<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn IdentityStore) -> Result<T, E>,
        E: From<StoreError>,
    {
        dispatch!(self, unit_of_work(f))
    }

    // ========================================================================
    // Reporting operations
    // ========================================================================

    pub fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        dispatch!(self, list_identities())
    }

    pub fn get_identity(&self, id: i64) -> Result<Option<Identity>, StoreError> {
        dispatch!(self, get_identity(id))
    }

    pub fn count_identities(&self) -> Result<i64, StoreError> {
        dispatch!(self, count_identities())
    }

    /// Returns false when no identity has this id.
    pub fn set_identity_label(&self, id: i64, label: &str) -> Result<bool, StoreError> {
        dispatch!(self, set_identity_label(id, label))
    }

    pub fn get_visits_for_identity(&self, identity_id: i64) -> Result<Vec<Visit>, StoreError> {
        dispatch!(self, get_visits_for_identity(identity_id))
    }

    /// Day records between `from` and `to` inclusive, oldest first.
    pub fn get_daily_analytics(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<DailyAnalytics>, StoreError> {
        dispatch!(self, get_daily_analytics(from, to))
    }

    /// Rebuild identity counters from visit history. Returns the number of
    /// identities rewritten.
    pub fn repair_counters(&self) -> Result<usize, StoreError> {
        dispatch!(self, repair_counters())
    }
}
