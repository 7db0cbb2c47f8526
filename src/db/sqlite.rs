//! SQLite backend implementation.
//!
//! A single connection sits behind a mutex and every unit of work is a
//! `BEGIN IMMEDIATE` transaction, so resolutions touching the same identity
//! are applied one after another.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::backend::IdentityStore;
use super::error::StoreError;
use super::identities::{DailyAnalytics, Identity, IdentityUpdate, NewIdentity, Visit};
use super::schema::SCHEMA;
use crate::identity::Embedding;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const IDENTITY_COLUMNS: &str =
    "id, embedding, label, first_seen, last_seen, visit_count, daily_visit_count, last_visit_date";

pub struct SqliteDb {
    conn: Mutex<Connection>,
}

impl SqliteDb {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run `f` inside one write transaction.
    ///
    /// Commits when `f` returns `Ok`; any error drops the transaction,
    /// which rolls it back.
    pub fn unit_of_work<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn IdentityStore) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let out = f(&mut SqliteStore { conn: &tx })?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    pub fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.lock()?;
        SqliteStore { conn: &conn }.list_identities()
    }

    pub fn get_identity(&self, id: i64) -> Result<Option<Identity>, StoreError> {
        let conn = self.lock()?;
        SqliteStore { conn: &conn }.lock_identity(id)
    }

    pub fn count_identities(&self) -> Result<i64, StoreError> {
        let count = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn set_identity_label(&self, id: i64, label: &str) -> Result<bool, StoreError> {
        let changed = self.lock()?.execute(
            "UPDATE identities SET label = ?1 WHERE id = ?2",
            params![label, id],
        )?;
        Ok(changed > 0)
    }

    pub fn get_visits_for_identity(&self, identity_id: i64) -> Result<Vec<Visit>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, identity_id, start_time, end_time
            FROM visits
            WHERE identity_id = ?1
            ORDER BY start_time, id
            "#,
        )?;
        let visits = stmt
            .query_map([identity_id], row_to_visit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(visits)
    }

    pub fn get_daily_analytics(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<DailyAnalytics>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT day, total_flow, unique_count
            FROM daily_analytics
            WHERE (?1 IS NULL OR day >= ?1) AND (?2 IS NULL OR day <= ?2)
            ORDER BY day
            "#,
        )?;
        let days = stmt
            .query_map(params![from, to], row_to_daily)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(days)
    }

    /// Recompute identity counters and timestamps from the visits table.
    ///
    /// The daily count is taken relative to the day of the latest visit
    /// start. Identities without visits are left untouched.
    pub fn repair_counters(&self) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            r#"
            UPDATE identities SET
                visit_count = (SELECT COUNT(*) FROM visits v WHERE v.identity_id = identities.id),
                first_seen = (SELECT MIN(start_time) FROM visits v WHERE v.identity_id = identities.id),
                last_seen = (SELECT MAX(end_time) FROM visits v WHERE v.identity_id = identities.id),
                last_visit_date = (
                    SELECT date(MAX(start_time)) FROM visits v WHERE v.identity_id = identities.id
                ),
                daily_visit_count = (
                    SELECT COUNT(*) FROM visits v
                    WHERE v.identity_id = identities.id
                      AND date(v.start_time) = (
                          SELECT date(MAX(w.start_time)) FROM visits w WHERE w.identity_id = identities.id
                      )
                )
            WHERE EXISTS (SELECT 1 FROM visits v WHERE v.identity_id = identities.id)
            "#,
            [],
        )?;
        tx.commit()?;
        Ok(updated)
    }
}

/// Repository operations over a connection or an open transaction.
struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl IdentityStore for SqliteStore<'_> {
    fn list_identities(&mut self) -> Result<Vec<Identity>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY id"))?;
        let rows = stmt
            .query_map([], RawIdentity::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawIdentity::decode).collect()
    }

    fn lock_identity(&mut self, id: i64) -> Result<Option<Identity>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
                [id],
                RawIdentity::from_row,
            )
            .optional()?;
        row.map(RawIdentity::decode).transpose()
    }

    fn create_identity(&mut self, identity: &NewIdentity) -> Result<i64, StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO identities
                (embedding, embedding_dim, label, first_seen, last_seen,
                 visit_count, daily_visit_count, last_visit_date)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                identity.embedding.to_bytes(),
                identity.embedding.len() as i64,
                identity.label,
                identity.first_seen,
                identity.last_seen,
                identity.visit_count,
                identity.daily_visit_count,
                identity.last_visit_date,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_identity(&mut self, id: i64, update: &IdentityUpdate) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            r#"
            UPDATE identities
            SET last_seen = ?1, visit_count = ?2, daily_visit_count = ?3, last_visit_date = ?4
            WHERE id = ?5
            "#,
            params![
                update.last_seen,
                update.visit_count,
                update.daily_visit_count,
                update.last_visit_date,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::MissingRow { table: "identities", id });
        }
        Ok(())
    }

    fn create_visit(
        &mut self,
        identity_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO visits (identity_id, start_time, end_time) VALUES (?1, ?2, ?3)",
            params![identity_id, start, end],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_visit(&mut self, id: i64, end: DateTime<Utc>) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute("UPDATE visits SET end_time = ?1 WHERE id = ?2", params![end, id])?;
        if changed == 0 {
            return Err(StoreError::MissingRow { table: "visits", id });
        }
        Ok(())
    }

    fn get_latest_visit(&mut self, identity_id: i64) -> Result<Option<Visit>, StoreError> {
        let visit = self
            .conn
            .query_row(
                r#"
                SELECT id, identity_id, start_time, end_time
                FROM visits
                WHERE identity_id = ?1
                ORDER BY end_time DESC, id DESC
                LIMIT 1
                "#,
                [identity_id],
                row_to_visit,
            )
            .optional()?;
        Ok(visit)
    }

    fn get_or_create_daily(&mut self, day: NaiveDate) -> Result<DailyAnalytics, StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO daily_analytics (day) VALUES (?1)",
            [day],
        )?;
        let daily = self.conn.query_row(
            "SELECT day, total_flow, unique_count FROM daily_analytics WHERE day = ?1",
            [day],
            row_to_daily,
        )?;
        Ok(daily)
    }

    fn increment_daily(
        &mut self,
        day: NaiveDate,
        total_delta: i64,
        unique_delta: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO daily_analytics (day, total_flow, unique_count)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(day) DO UPDATE SET
                total_flow = total_flow + excluded.total_flow,
                unique_count = unique_count + excluded.unique_count
            "#,
            params![day, total_delta, unique_delta],
        )?;
        Ok(())
    }
}

struct RawIdentity {
    id: i64,
    embedding: Vec<u8>,
    label: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    visit_count: i64,
    daily_visit_count: i64,
    last_visit_date: NaiveDate,
}

impl RawIdentity {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            embedding: row.get(1)?,
            label: row.get(2)?,
            first_seen: row.get(3)?,
            last_seen: row.get(4)?,
            visit_count: row.get(5)?,
            daily_visit_count: row.get(6)?,
            last_visit_date: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Identity, StoreError> {
        let embedding = Embedding::from_bytes(&self.embedding).map_err(|source| StoreError::Corrupt {
            table: "identities",
            id: self.id,
            source,
        })?;
        Ok(Identity {
            id: self.id,
            embedding,
            label: self.label,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            visit_count: self.visit_count,
            daily_visit_count: self.daily_visit_count,
            last_visit_date: self.last_visit_date,
        })
    }
}

fn row_to_visit(row: &Row) -> rusqlite::Result<Visit> {
    Ok(Visit {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
    })
}

fn row_to_daily(row: &Row) -> rusqlite::Result<DailyAnalytics> {
    Ok(DailyAnalytics {
        day: row.get(0)?,
        total_flow: row.get(1)?,
        unique_count: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::testing::axis;
    use chrono::{Duration, TimeZone};

    fn setup() -> SqliteDb {
        let db = SqliteDb::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_identity_round_trip() {
        let db = setup();
        let id = db
            .unit_of_work(|store| store.create_identity(&NewIdentity::first_sighting(axis(4), at(10, 0))))
            .unwrap();

        let identity = db.get_identity(id).unwrap().unwrap();
        assert_eq!(identity.label, "unknown");
        assert_eq!(identity.first_seen, at(10, 0));
        assert_eq!(identity.visit_count, 1);
        assert_eq!(identity.last_visit_date, at(10, 0).date_naive());
        assert!((identity.embedding.similarity(&axis(4)) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_identities_listed_in_id_order() {
        let db = setup();
        let ids: Vec<i64> = db
            .unit_of_work(|store| {
                (0..3)
                    .map(|i| store.create_identity(&NewIdentity::first_sighting(axis(i), at(10, 0))))
                    .collect::<Result<Vec<_>, StoreError>>()
            })
            .unwrap();

        let listed: Vec<i64> = db.list_identities().unwrap().iter().map(|i| i.id).collect();
        assert_eq!(listed, ids);
        assert_eq!(db.count_identities().unwrap(), 3);
    }

    #[test]
    fn test_latest_visit_is_by_end_time() {
        let db = setup();
        let latest = db
            .unit_of_work(|store| {
                let id = store.create_identity(&NewIdentity::first_sighting(axis(0), at(9, 0)))?;
                store.create_visit(id, at(9, 0), at(9, 30))?;
                let second = store.create_visit(id, at(11, 0), at(11, 0))?;
                store.update_visit(second, at(11, 15))?;
                store.get_latest_visit(id)
            })
            .unwrap()
            .unwrap();

        assert_eq!(latest.start_time, at(11, 0));
        assert_eq!(latest.end_time, at(11, 15));
    }

    #[test]
    fn test_failed_unit_of_work_rolls_back() {
        let db = setup();
        let result: Result<(), StoreError> = db.unit_of_work(|store| {
            store.create_identity(&NewIdentity::first_sighting(axis(0), at(10, 0)))?;
            store.increment_daily(at(10, 0).date_naive(), 1, 1)?;
            store.update_visit(999, at(10, 1))
        });

        assert!(matches!(result, Err(StoreError::MissingRow { table: "visits", id: 999 })));
        assert_eq!(db.count_identities().unwrap(), 0);
        assert!(db.get_daily_analytics(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_daily_upsert_and_range() {
        let db = setup();
        let day1 = at(10, 0).date_naive();
        let day2 = day1 + Duration::days(1);
        db.unit_of_work(|store| {
            assert_eq!(store.get_or_create_daily(day1)?, DailyAnalytics::empty(day1));
            store.increment_daily(day1, 1, 1)?;
            store.increment_daily(day1, 1, 0)?;
            store.increment_daily(day2, 1, 1)
        })
        .unwrap();

        let all = db.get_daily_analytics(None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!((all[0].total_flow, all[0].unique_count), (2, 1));

        let only_second = db.get_daily_analytics(Some(day2), None).unwrap();
        assert_eq!(only_second, vec![DailyAnalytics { day: day2, total_flow: 1, unique_count: 1 }]);
    }

    #[test]
    fn test_label_update() {
        let db = setup();
        let id = db
            .unit_of_work(|store| store.create_identity(&NewIdentity::first_sighting(axis(0), at(10, 0))))
            .unwrap();
        assert!(db.set_identity_label(id, "Ram").unwrap());
        assert!(!db.set_identity_label(id + 100, "Shyam").unwrap());
        assert_eq!(db.get_identity(id).unwrap().unwrap().label, "Ram");
    }

    #[test]
    fn test_repair_counters_from_visits() {
        let db = setup();
        let next_day = |h, m| at(h, m) + Duration::days(1);
        let id = db
            .unit_of_work(|store| {
                let mut stale = NewIdentity::first_sighting(axis(0), at(12, 0));
                stale.visit_count = 9;
                stale.daily_visit_count = 9;
                let id = store.create_identity(&stale)?;
                store.create_visit(id, at(8, 0), at(8, 30))?;
                store.create_visit(id, next_day(9, 0), next_day(9, 10))?;
                store.create_visit(id, next_day(14, 0), next_day(14, 45))?;
                Ok::<_, StoreError>(id)
            })
            .unwrap();

        assert_eq!(db.repair_counters().unwrap(), 1);

        let identity = db.get_identity(id).unwrap().unwrap();
        assert_eq!(identity.visit_count, 3);
        assert_eq!(identity.daily_visit_count, 2);
        assert_eq!(identity.last_visit_date, next_day(0, 0).date_naive());
        assert_eq!(identity.first_seen, at(8, 0));
        assert_eq!(identity.last_seen, next_day(14, 45));
    }
}
