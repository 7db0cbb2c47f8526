//! Repository interface consumed by identity resolution.
//!
//! Every method runs inside the unit of work opened by
//! [`Database::unit_of_work`](super::Database::unit_of_work); nothing is
//! visible to other writers until that unit commits.

use chrono::{DateTime, NaiveDate, Utc};

use super::error::StoreError;
use super::identities::{DailyAnalytics, Identity, IdentityUpdate, NewIdentity, Visit};

pub trait IdentityStore {
    /// All identities in ascending id order.
    fn list_identities(&mut self) -> Result<Vec<Identity>, StoreError>;

    /// Re-read one identity, locking its row until the unit of work ends.
    fn lock_identity(&mut self, id: i64) -> Result<Option<Identity>, StoreError>;

    /// Insert an identity and return its id
    fn create_identity(&mut self, identity: &NewIdentity) -> Result<i64, StoreError>;

    /// Overwrite the counters of an identity
    fn update_identity(&mut self, id: i64, update: &IdentityUpdate) -> Result<(), StoreError>;

    /// Insert a visit and return its id
    fn create_visit(
        &mut self,
        identity_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Move the end of a visit
    fn update_visit(&mut self, id: i64, end: DateTime<Utc>) -> Result<(), StoreError>;

    /// Visit with the latest end time for an identity
    fn get_latest_visit(&mut self, identity_id: i64) -> Result<Option<Visit>, StoreError>;

    /// Fetch the record for `day`, inserting an empty one if missing
    fn get_or_create_daily(&mut self, day: NaiveDate) -> Result<DailyAnalytics, StoreError>;

    /// Add to the totals of a day record, creating it when missing
    fn increment_daily(
        &mut self,
        day: NaiveDate,
        total_delta: i64,
        unique_delta: i64,
    ) -> Result<(), StoreError>;
}
