//! Per-day flow and unique-visitor totals.

use chrono::NaiveDate;

use crate::db::{DailyAnalytics, IdentityStore, StoreError};

#[derive(Debug, Default, Clone, Copy)]
pub struct AnalyticsAggregator;

impl AnalyticsAggregator {
    /// Count one resolved event against `day` and return the updated totals.
    ///
    /// Must run in the same unit of work as the session update it counts.
    pub fn record(
        &self,
        store: &mut dyn IdentityStore,
        day: NaiveDate,
        is_unique: bool,
    ) -> Result<DailyAnalytics, StoreError> {
        let mut daily = store.get_or_create_daily(day)?;
        let unique_delta = i64::from(is_unique);
        store.increment_daily(day, 1, unique_delta)?;
        daily.total_flow += 1;
        daily.unique_count += unique_delta;
        Ok(daily)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_counts_flow_and_unique() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let aggregator = AnalyticsAggregator;

        let events = [true, false, false, true, false];
        let mut last = DailyAnalytics::empty(day);
        for is_unique in events {
            last = db
                .unit_of_work(|store| aggregator.record(store, day, is_unique))
                .unwrap();
        }

        assert_eq!(last, DailyAnalytics { day, total_flow: 5, unique_count: 2 });
        assert_eq!(db.get_daily_analytics(Some(day), Some(day)).unwrap(), vec![last]);
    }
}
