//! Identity, visit and daily analytics rows.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::identity::Embedding;

/// Label given to identities nobody has named yet.
pub const DEFAULT_LABEL: &str = "unknown";

/// A durable person record
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: i64,
    pub embedding: Embedding,
    pub label: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Lifetime number of visits
    pub visit_count: i64,
    /// Visits started on `last_visit_date`
    pub daily_visit_count: i64,
    pub last_visit_date: NaiveDate,
}

impl Identity {
    pub fn counters(&self) -> IdentityUpdate {
        IdentityUpdate {
            last_seen: self.last_seen,
            visit_count: self.visit_count,
            daily_visit_count: self.daily_visit_count,
            last_visit_date: self.last_visit_date,
        }
    }
}

/// Fields for inserting an identity
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub embedding: Embedding,
    pub label: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub visit_count: i64,
    pub daily_visit_count: i64,
    pub last_visit_date: NaiveDate,
}

impl NewIdentity {
    /// An identity seen for the very first time at `now`.
    pub fn first_sighting(embedding: Embedding, now: DateTime<Utc>) -> Self {
        Self {
            embedding,
            label: DEFAULT_LABEL.to_string(),
            first_seen: now,
            last_seen: now,
            visit_count: 1,
            daily_visit_count: 1,
            last_visit_date: now.date_naive(),
        }
    }
}

/// Mutable counters of an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityUpdate {
    pub last_seen: DateTime<Utc>,
    pub visit_count: i64,
    pub daily_visit_count: i64,
    pub last_visit_date: NaiveDate,
}

/// A contiguous span of presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Visit {
    pub id: i64,
    pub identity_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Per-day running totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyAnalytics {
    pub day: NaiveDate,
    /// Every resolved detection
    pub total_flow: i64,
    /// New identities plus re-entries
    pub unique_count: i64,
}

impl DailyAnalytics {
    pub fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            total_flow: 0,
            unique_count: 0,
        }
    }
}
