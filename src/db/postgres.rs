//! PostgreSQL backend implementation.
//!
//! Units of work run at SERIALIZABLE isolation and lock the matched
//! identity row with `SELECT ... FOR UPDATE`. Serialization failures surface
//! as [`StoreError::Conflict`] and are retried by the resolver.

use chrono::{DateTime, NaiveDate, Utc};
use postgres::{GenericClient, IsolationLevel, NoTls};
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;

use super::backend::IdentityStore;
use super::error::StoreError;
use super::identities::{DailyAnalytics, Identity, IdentityUpdate, NewIdentity, Visit};
use super::postgres_schema::POSTGRES_SCHEMA;
use crate::identity::Embedding;

const IDENTITY_COLUMNS: &str =
    "id, embedding, label, first_seen, last_seen, visit_count, daily_visit_count, last_visit_date";

pub struct PgDb {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl PgDb {
    pub fn open(url: &str, pool_size: u32) -> Result<Self, StoreError> {
        let manager = PostgresConnectionManager::new(url.parse()?, NoTls);
        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        Ok(Self { pool })
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        let mut client = self.pool.get()?;
        client.batch_execute(POSTGRES_SCHEMA)?;
        Ok(())
    }

    pub fn unit_of_work<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn IdentityStore) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut client = self.pool.get().map_err(StoreError::from)?;
        let mut tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .map_err(StoreError::from)?;
        let out = f(&mut PgStore { client: &mut tx })?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    pub fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let mut client = self.pool.get()?;
        PgStore { client: &mut *client }.list_identities()
    }

    pub fn get_identity(&self, id: i64) -> Result<Option<Identity>, StoreError> {
        let mut client = self.pool.get()?;
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let row = client.query_opt(sql.as_str(), &[&id])?;
        row.as_ref().map(row_to_identity).transpose()
    }

    pub fn count_identities(&self) -> Result<i64, StoreError> {
        let mut client = self.pool.get()?;
        let row = client.query_one("SELECT COUNT(*) FROM identities", &[])?;
        Ok(row.get(0))
    }

    pub fn set_identity_label(&self, id: i64, label: &str) -> Result<bool, StoreError> {
        let mut client = self.pool.get()?;
        let changed = client.execute(
            "UPDATE identities SET label = $1 WHERE id = $2",
            &[&label, &id],
        )?;
        Ok(changed > 0)
    }

    pub fn get_visits_for_identity(&self, identity_id: i64) -> Result<Vec<Visit>, StoreError> {
        let mut client = self.pool.get()?;
        let rows = client.query(
            r#"
            SELECT id, identity_id, start_time, end_time
            FROM visits
            WHERE identity_id = $1
            ORDER BY start_time, id
            "#,
            &[&identity_id],
        )?;
        Ok(rows.iter().map(row_to_visit).collect())
    }

    pub fn get_daily_analytics(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<DailyAnalytics>, StoreError> {
        let mut client = self.pool.get()?;
        let rows = client.query(
            r#"
            SELECT day, total_flow, unique_count
            FROM daily_analytics
            WHERE ($1::date IS NULL OR day >= $1) AND ($2::date IS NULL OR day <= $2)
            ORDER BY day
            "#,
            &[&from, &to],
        )?;
        Ok(rows.iter().map(row_to_daily).collect())
    }

    pub fn repair_counters(&self) -> Result<usize, StoreError> {
        let mut client = self.pool.get()?;
        let updated = client.execute(
            r#"
            WITH stats AS (
                SELECT identity_id,
                       COUNT(*) AS visits,
                       MIN(start_time) AS first_start,
                       MAX(end_time) AS last_end,
                       (MAX(start_time) AT TIME ZONE 'UTC')::date AS last_day
                FROM visits
                GROUP BY identity_id
            ), same_day AS (
                SELECT v.identity_id, COUNT(*) AS visits
                FROM visits v
                JOIN stats s ON s.identity_id = v.identity_id
                WHERE (v.start_time AT TIME ZONE 'UTC')::date = s.last_day
                GROUP BY v.identity_id
            )
            UPDATE identities i SET
                visit_count = s.visits,
                first_seen = s.first_start,
                last_seen = s.last_end,
                last_visit_date = s.last_day,
                daily_visit_count = COALESCE(d.visits, 0)
            FROM stats s
            LEFT JOIN same_day d ON d.identity_id = s.identity_id
            WHERE i.id = s.identity_id
            "#,
            &[],
        )?;
        Ok(updated as usize)
    }
}

/// Repository operations over a pooled client or an open transaction.
struct PgStore<'a, C: GenericClient> {
    client: &'a mut C,
}

impl<C: GenericClient> IdentityStore for PgStore<'_, C> {
    fn list_identities(&mut self) -> Result<Vec<Identity>, StoreError> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY id");
        let rows = self.client.query(sql.as_str(), &[])?;
        rows.iter().map(row_to_identity).collect()
    }

    fn lock_identity(&mut self, id: i64) -> Result<Option<Identity>, StoreError> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1 FOR UPDATE");
        let row = self.client.query_opt(sql.as_str(), &[&id])?;
        row.as_ref().map(row_to_identity).transpose()
    }

    fn create_identity(&mut self, identity: &NewIdentity) -> Result<i64, StoreError> {
        let bytes = identity.embedding.to_bytes();
        let dim = identity.embedding.len() as i32;
        let row = self.client.query_one(
            r#"
            INSERT INTO identities
                (embedding, embedding_dim, label, first_seen, last_seen,
                 visit_count, daily_visit_count, last_visit_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
            &[
                &bytes,
                &dim,
                &identity.label,
                &identity.first_seen,
                &identity.last_seen,
                &identity.visit_count,
                &identity.daily_visit_count,
                &identity.last_visit_date,
            ],
        )?;
        Ok(row.get(0))
    }

    fn update_identity(&mut self, id: i64, update: &IdentityUpdate) -> Result<(), StoreError> {
        let changed = self.client.execute(
            r#"
            UPDATE identities
            SET last_seen = $1, visit_count = $2, daily_visit_count = $3, last_visit_date = $4
            WHERE id = $5
            "#,
            &[
                &update.last_seen,
                &update.visit_count,
                &update.daily_visit_count,
                &update.last_visit_date,
                &id,
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
        let row = self.client.query_one(
            "INSERT INTO visits (identity_id, start_time, end_time) VALUES ($1, $2, $3) RETURNING id",
            &[&identity_id, &start, &end],
        )?;
        Ok(row.get(0))
    }

    fn update_visit(&mut self, id: i64, end: DateTime<Utc>) -> Result<(), StoreError> {
        let changed = self
            .client
            .execute("UPDATE visits SET end_time = $1 WHERE id = $2", &[&end, &id])?;
        if changed == 0 {
            return Err(StoreError::MissingRow { table: "visits", id });
        }
        Ok(())
    }

    fn get_latest_visit(&mut self, identity_id: i64) -> Result<Option<Visit>, StoreError> {
        let row = self.client.query_opt(
            r#"
            SELECT id, identity_id, start_time, end_time
            FROM visits
            WHERE identity_id = $1
            ORDER BY end_time DESC, id DESC
            LIMIT 1
            "#,
            &[&identity_id],
        )?;
        Ok(row.as_ref().map(row_to_visit))
    }

    fn get_or_create_daily(&mut self, day: NaiveDate) -> Result<DailyAnalytics, StoreError> {
        self.client.execute(
            "INSERT INTO daily_analytics (day) VALUES ($1) ON CONFLICT (day) DO NOTHING",
            &[&day],
        )?;
        let row = self.client.query_one(
            "SELECT day, total_flow, unique_count FROM daily_analytics WHERE day = $1",
            &[&day],
        )?;
        Ok(row_to_daily(&row))
    }

    fn increment_daily(
        &mut self,
        day: NaiveDate,
        total_delta: i64,
        unique_delta: i64,
    ) -> Result<(), StoreError> {
        self.client.execute(
            r#"
            INSERT INTO daily_analytics (day, total_flow, unique_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (day) DO UPDATE SET
                total_flow = daily_analytics.total_flow + EXCLUDED.total_flow,
                unique_count = daily_analytics.unique_count + EXCLUDED.unique_count
            "#,
            &[&day, &total_delta, &unique_delta],
        )?;
        Ok(())
    }
}

fn row_to_identity(row: &postgres::Row) -> Result<Identity, StoreError> {
    let id: i64 = row.get(0);
    let bytes: Vec<u8> = row.get(1);
    let embedding = Embedding::from_bytes(&bytes).map_err(|source| StoreError::Corrupt {
        table: "identities",
        id,
        source,
    })?;
    Ok(Identity {
        id,
        embedding,
        label: row.get(2),
        first_seen: row.get(3),
        last_seen: row.get(4),
        visit_count: row.get(5),
        daily_visit_count: row.get(6),
        last_visit_date: row.get(7),
    })
}

fn row_to_visit(row: &postgres::Row) -> Visit {
    Visit {
        id: row.get(0),
        identity_id: row.get(1),
        start_time: row.get(2),
        end_time: row.get(3),
    }
}

fn row_to_daily(row: &postgres::Row) -> DailyAnalytics {
    DailyAnalytics {
        day: row.get(0),
        total_flow: row.get(1),
        unique_count: row.get(2),
    }
}
