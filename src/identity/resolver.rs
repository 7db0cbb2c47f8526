//! One resolution per emitted sample: match, update the visit history and
//! count the event, all inside a single unit of work.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::analytics::AnalyticsAggregator;
use super::matcher::{IdentityMatcher, DEFAULT_SIMILARITY_THRESHOLD};
use super::session::{SessionOutcome, SessionTracker, DEFAULT_REENTRY_WINDOW_MINUTES};
use super::Embedding;
use crate::config::IdentityConfig;
use crate::db::{DailyAnalytics, Database, IdentityStore, StoreError};
use crate::error::ResolveError;

const RETRY_BASE_DELAY_MS: u64 = 10;
const RETRY_MAX_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    pub similarity_threshold: f32,
    pub reentry_window: Duration,
    /// Extra attempts after a write conflict
    pub max_conflict_retries: u32,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            reentry_window: Duration::minutes(i64::from(DEFAULT_REENTRY_WINDOW_MINUTES)),
            max_conflict_retries: 3,
        }
    }
}

impl ResolverSettings {
    pub fn from_config(config: &IdentityConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            reentry_window: config.reentry_window(),
            max_conflict_retries: config.max_conflict_retries,
        }
    }
}

/// The committed result of resolving one sample
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub outcome: SessionOutcome,
    /// Best similarity against the population, `None` if it was empty
    pub similarity: Option<f32>,
    /// Totals for the event's day after this event
    pub daily: DailyAnalytics,
}

pub struct Resolver {
    db: Arc<Database>,
    matcher: IdentityMatcher,
    sessions: SessionTracker,
    analytics: AnalyticsAggregator,
    max_conflict_retries: u32,
}

impl Resolver {
    pub fn new(db: Arc<Database>, settings: ResolverSettings) -> Self {
        Self {
            db,
            matcher: IdentityMatcher::new(settings.similarity_threshold),
            sessions: SessionTracker::new(settings.reentry_window),
            analytics: AnalyticsAggregator,
            max_conflict_retries: settings.max_conflict_retries,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub fn resolve(&self, embedding: &Embedding, now: DateTime<Utc>) -> Result<Resolution, ResolveError> {
        self.resolve_cancellable(embedding, now, &AtomicBool::new(false))
    }

    /// Resolve `embedding` observed at `now`.
    ///
    /// `cancel` is checked just before commit; once set, the unit of work
    /// rolls back and [`ResolveError::Cancelled`] is returned. Write
    /// conflicts are retried with exponential backoff.
    pub fn resolve_cancellable(
        &self,
        embedding: &Embedding,
        now: DateTime<Utc>,
        cancel: &AtomicBool,
    ) -> Result<Resolution, ResolveError> {
        let mut retries = 0;
        loop {
            let result = self
                .db
                .unit_of_work(|store| self.resolve_once(store, embedding, now, cancel));

            match result {
                Err(ResolveError::Store(err)) if err.is_conflict() => {
                    if retries >= self.max_conflict_retries {
                        return Err(ResolveError::ConflictRetriesExhausted(retries + 1));
                    }
                    retries += 1;
                    let delay = retry_delay_ms(retries);
                    warn!(attempt = retries, delay_ms = delay, "Write conflict, retrying resolution");
                    std::thread::sleep(std::time::Duration::from_millis(delay));
                    if cancel.load(Ordering::Acquire) {
                        return Err(ResolveError::Cancelled);
                    }
                }
                other => return other,
            }
        }
    }

    fn resolve_once(
        &self,
        store: &mut dyn IdentityStore,
        embedding: &Embedding,
        now: DateTime<Utc>,
        cancel: &AtomicBool,
    ) -> Result<Resolution, ResolveError> {
        let population = store.list_identities()?;
        let found = self.matcher.find_best(embedding, &population);

        let outcome = match found.identity {
            Some(candidate) => {
                let fresh = store
                    .lock_identity(candidate.id)?
                    .ok_or(StoreError::MissingRow {
                        table: "identities",
                        id: candidate.id,
                    })?;
                self.sessions.observe(store, &fresh, now)?
            }
            None => self.sessions.start_identity(store, embedding, now)?,
        };

        let daily = self.analytics.record(store, now.date_naive(), outcome.is_unique())?;

        if cancel.load(Ordering::Acquire) {
            debug!(identity_id = outcome.identity_id(), "Resolution cancelled before commit");
            return Err(ResolveError::Cancelled);
        }

        Ok(Resolution {
            outcome,
            similarity: found.score,
            daily,
        })
    }
}

/// Backoff before retry `attempt`, doubling from the base up to the cap.
fn retry_delay_ms(attempt: u32) -> u64 {
    1u64.checked_shl(attempt)
        .map_or(RETRY_MAX_DELAY_MS, |factor| RETRY_BASE_DELAY_MS.saturating_mul(factor))
        .min(RETRY_MAX_DELAY_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::testing::{axis, blend};
    use chrono::TimeZone;

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, h, m, 0).unwrap()
    }

    fn resolver() -> Resolver {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        Resolver::new(Arc::new(db), ResolverSettings::default())
    }

    #[test]
    fn test_store_front_scenario() {
        let resolver = resolver();
        let x = axis(0);

        let a = resolver.resolve(&x, at(1, 10, 0)).unwrap();
        assert!(matches!(a.outcome, SessionOutcome::NewIdentity { .. }));
        assert_eq!(a.similarity, None);
        assert_eq!((a.daily.total_flow, a.daily.unique_count), (1, 1));
        let id = a.outcome.identity_id();

        let b = resolver.resolve(&blend(0, 1, 0.95), at(1, 10, 5)).unwrap();
        assert!(matches!(b.outcome, SessionOutcome::Continuation { .. }));
        assert_eq!(b.outcome.identity_id(), id);
        assert_eq!((b.daily.total_flow, b.daily.unique_count), (2, 1));

        let c = resolver.resolve(&x, at(1, 10, 40)).unwrap();
        assert!(matches!(c.outcome, SessionOutcome::ReEntry { .. }));
        assert_eq!((c.daily.total_flow, c.daily.unique_count), (3, 2));

        let db = resolver.database();
        let identity = db.get_identity(id).unwrap().unwrap();
        assert_eq!(identity.visit_count, 2);
        assert_eq!(identity.daily_visit_count, 2);

        let visits = db.get_visits_for_identity(id).unwrap();
        assert_eq!(visits.len(), 2);
        assert_eq!((visits[0].start_time, visits[0].end_time), (at(1, 10, 0), at(1, 10, 5)));
        assert_eq!((visits[1].start_time, visits[1].end_time), (at(1, 10, 40), at(1, 10, 40)));
    }

    #[test]
    fn test_dissimilar_faces_get_separate_identities() {
        let resolver = resolver();
        let first = resolver.resolve(&axis(0), at(1, 9, 0)).unwrap();
        let second = resolver.resolve(&blend(0, 1, 0.5), at(1, 9, 1)).unwrap();

        assert_ne!(first.outcome.identity_id(), second.outcome.identity_id());
        assert!(second.outcome.is_unique());
        assert!((second.similarity.unwrap() - 0.5).abs() < 1e-5);
        assert_eq!(resolver.database().count_identities().unwrap(), 2);
    }

    #[test]
    fn test_new_identity_matches_itself() {
        let resolver = resolver();
        let probe = blend(4, 5, 0.6);
        let id = resolver.resolve(&probe, at(1, 9, 0)).unwrap().outcome.identity_id();

        let again = resolver.resolve(&probe, at(1, 9, 1)).unwrap();
        assert_eq!(again.outcome.identity_id(), id);
        assert!((again.similarity.unwrap() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_day_boundary_counts_into_new_day() {
        let resolver = resolver();
        resolver.resolve(&axis(0), at(1, 23, 59)).unwrap();
        let next = resolver.resolve(&axis(0), at(2, 10, 0)).unwrap();

        assert!(matches!(next.outcome, SessionOutcome::ReEntry { .. }));
        assert_eq!(next.daily, DailyAnalytics { day: at(2, 0, 0).date_naive(), total_flow: 1, unique_count: 1 });

        let identity = resolver.database().get_identity(next.outcome.identity_id()).unwrap().unwrap();
        assert_eq!(identity.daily_visit_count, 1);
        assert_eq!(identity.visit_count, 2);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        assert_eq!(retry_delay_ms(1), 20);
        assert_eq!(retry_delay_ms(5), 320);
        assert_eq!(retry_delay_ms(6), RETRY_MAX_DELAY_MS);
        assert_eq!(retry_delay_ms(63), RETRY_MAX_DELAY_MS);
        assert_eq!(retry_delay_ms(64), RETRY_MAX_DELAY_MS);
        assert_eq!(retry_delay_ms(u32::MAX), RETRY_MAX_DELAY_MS);
    }

    #[test]
    fn test_cancelled_resolution_commits_nothing() {
        let resolver = resolver();
        let cancel = AtomicBool::new(true);

        let result = resolver.resolve_cancellable(&axis(0), at(1, 9, 0), &cancel);
        assert!(matches!(result, Err(ResolveError::Cancelled)));

        let db = resolver.database();
        assert_eq!(db.count_identities().unwrap(), 0);
        assert!(db.get_daily_analytics(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_resolutions_share_one_identity() {
        let resolver = Arc::new(resolver());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let resolver = Arc::clone(&resolver);
                std::thread::spawn(move || resolver.resolve(&axis(0), at(1, 12, i)).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let db = resolver.database();
        assert_eq!(db.count_identities().unwrap(), 1);
        let daily = db.get_daily_analytics(None, None).unwrap();
        assert_eq!((daily[0].total_flow, daily[0].unique_count), (4, 1));
    }
}
