//! Visit bookkeeping for resolved detections.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error};

use super::Embedding;
use crate::db::{Identity, IdentityStore, NewIdentity, StoreError, Visit};

pub const DEFAULT_REENTRY_WINDOW_MINUTES: u32 = 20;

/// What a resolved detection did to the visit history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// First sighting of a person
    NewIdentity { identity_id: i64, visit_id: i64 },
    /// A known person came back after the re-entry window
    ReEntry { identity_id: i64, visit_id: i64 },
    /// A known person is still within their current visit
    Continuation { identity_id: i64, visit_id: i64 },
}

impl SessionOutcome {
    /// New identities and re-entries count towards the daily unique total.
    pub fn is_unique(&self) -> bool {
        !matches!(self, SessionOutcome::Continuation { .. })
    }

    pub fn identity_id(&self) -> i64 {
        match *self {
            SessionOutcome::NewIdentity { identity_id, .. }
            | SessionOutcome::ReEntry { identity_id, .. }
            | SessionOutcome::Continuation { identity_id, .. } => identity_id,
        }
    }

    pub fn visit_id(&self) -> i64 {
        match *self {
            SessionOutcome::NewIdentity { visit_id, .. }
            | SessionOutcome::ReEntry { visit_id, .. }
            | SessionOutcome::Continuation { visit_id, .. } => visit_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Continue,
    ReEnter,
    /// A matched identity without any visit row
    Missing,
}

fn classify(last: Option<&Visit>, now: DateTime<Utc>, window: Duration) -> VisitState {
    match last {
        None => VisitState::Missing,
        Some(visit) if now - visit.end_time > window => VisitState::ReEnter,
        Some(_) => VisitState::Continue,
    }
}

#[derive(Debug)]
pub struct SessionTracker {
    reentry_window: Duration,
    invariant_violations: AtomicU64,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(Duration::minutes(i64::from(DEFAULT_REENTRY_WINDOW_MINUTES)))
    }
}

impl SessionTracker {
    pub fn new(reentry_window: Duration) -> Self {
        Self {
            reentry_window,
            invariant_violations: AtomicU64::new(0),
        }
    }

    pub fn reentry_window(&self) -> Duration {
        self.reentry_window
    }

    /// Matched identities found without any visit so far.
    pub fn invariant_violations(&self) -> u64 {
        self.invariant_violations.load(Ordering::Relaxed)
    }

    /// Create an identity for an unmatched embedding, with its first visit.
    pub fn start_identity(
        &self,
        store: &mut dyn IdentityStore,
        embedding: &Embedding,
        now: DateTime<Utc>,
    ) -> Result<SessionOutcome, StoreError> {
        let identity_id = store.create_identity(&NewIdentity::first_sighting(embedding.clone(), now))?;
        let visit_id = store.create_visit(identity_id, now, now)?;
        debug!(identity_id, visit_id, "Created identity");
        Ok(SessionOutcome::NewIdentity { identity_id, visit_id })
    }

    /// Record a sighting of an existing identity.
    ///
    /// `identity` must be a fresh read taken inside the current unit of work.
    pub fn observe(
        &self,
        store: &mut dyn IdentityStore,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<SessionOutcome, StoreError> {
        let identity_id = identity.id;
        let mut counters = identity.counters();
        // Late events never move last_seen backwards
        counters.last_seen = counters.last_seen.max(now);

        let last_visit = store.get_latest_visit(identity_id)?;
        let state = classify(last_visit.as_ref(), now, self.reentry_window);

        if let (VisitState::Continue, Some(visit)) = (state, last_visit) {
            if now > visit.end_time {
                store.update_visit(visit.id, now)?;
            }
            store.update_identity(identity_id, &counters)?;
            return Ok(SessionOutcome::Continuation {
                identity_id,
                visit_id: visit.id,
            });
        }

        if state == VisitState::Missing {
            self.invariant_violations.fetch_add(1, Ordering::Relaxed);
            error!(identity_id, "Matched identity has no visits, starting a new one");
        }

        let today = now.date_naive();
        if counters.last_visit_date != today {
            counters.daily_visit_count = 1;
            counters.last_visit_date = today;
        } else {
            counters.daily_visit_count += 1;
        }
        counters.visit_count += 1;

        let visit_id = store.create_visit(identity_id, now, now)?;
        store.update_identity(identity_id, &counters)?;
        debug!(identity_id, visit_id, visits = counters.visit_count, "Re-entry");
        Ok(SessionOutcome::ReEntry { identity_id, visit_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::identity::testing::axis;
    use chrono::TimeZone;

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, h, m, 0).unwrap()
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn sighting(db: &Database, tracker: &SessionTracker, id: i64, now: DateTime<Utc>) -> SessionOutcome {
        db.unit_of_work(|store| {
            let identity = store.lock_identity(id)?.unwrap();
            tracker.observe(store, &identity, now)
        })
        .unwrap()
    }

    #[test]
    fn test_classify_window_boundary() {
        let visit = Visit {
            id: 1,
            identity_id: 1,
            start_time: at(1, 10, 0),
            end_time: at(1, 10, 0),
        };
        let window = Duration::minutes(20);
        assert_eq!(classify(Some(&visit), at(1, 10, 20), window), VisitState::Continue);
        assert_eq!(classify(Some(&visit), at(1, 10, 21), window), VisitState::ReEnter);
        assert_eq!(classify(None, at(1, 10, 0), window), VisitState::Missing);
    }

    #[test]
    fn test_continuation_extends_visit() {
        let db = setup();
        let tracker = SessionTracker::default();
        let first = db
            .unit_of_work(|store| tracker.start_identity(store, &axis(0), at(1, 10, 0)))
            .unwrap();
        let id = first.identity_id();

        let second = sighting(&db, &tracker, id, at(1, 10, 5));
        assert_eq!(second, SessionOutcome::Continuation { identity_id: id, visit_id: first.visit_id() });
        assert!(!second.is_unique());

        let visits = db.get_visits_for_identity(id).unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].end_time, at(1, 10, 5));

        let identity = db.get_identity(id).unwrap().unwrap();
        assert_eq!(identity.visit_count, 1);
        assert_eq!(identity.daily_visit_count, 1);
        assert_eq!(identity.last_seen, at(1, 10, 5));
    }

    #[test]
    fn test_reentry_same_day() {
        let db = setup();
        let tracker = SessionTracker::default();
        let id = db
            .unit_of_work(|store| tracker.start_identity(store, &axis(0), at(1, 10, 0)))
            .unwrap()
            .identity_id();

        let outcome = sighting(&db, &tracker, id, at(1, 10, 40));
        assert!(matches!(outcome, SessionOutcome::ReEntry { .. }));
        assert!(outcome.is_unique());

        let identity = db.get_identity(id).unwrap().unwrap();
        assert_eq!(identity.visit_count, 2);
        assert_eq!(identity.daily_visit_count, 2);
        assert_eq!(db.get_visits_for_identity(id).unwrap().len(), 2);
    }

    #[test]
    fn test_reentry_next_day_resets_daily_count() {
        let db = setup();
        let tracker = SessionTracker::default();
        let id = db
            .unit_of_work(|store| tracker.start_identity(store, &axis(0), at(1, 23, 50)))
            .unwrap()
            .identity_id();
        sighting(&db, &tracker, id, at(1, 23, 55));

        let outcome = sighting(&db, &tracker, id, at(2, 9, 0));
        assert!(matches!(outcome, SessionOutcome::ReEntry { .. }));

        let identity = db.get_identity(id).unwrap().unwrap();
        assert_eq!(identity.visit_count, 2);
        assert_eq!(identity.daily_visit_count, 1);
        assert_eq!(identity.last_visit_date, at(2, 0, 0).date_naive());
    }

    #[test]
    fn test_late_event_does_not_rewind() {
        let db = setup();
        let tracker = SessionTracker::default();
        let id = db
            .unit_of_work(|store| tracker.start_identity(store, &axis(0), at(1, 10, 0)))
            .unwrap()
            .identity_id();
        sighting(&db, &tracker, id, at(1, 10, 10));
        sighting(&db, &tracker, id, at(1, 10, 5));

        let identity = db.get_identity(id).unwrap().unwrap();
        assert_eq!(identity.last_seen, at(1, 10, 10));
        assert_eq!(db.get_visits_for_identity(id).unwrap()[0].end_time, at(1, 10, 10));
    }

    #[test]
    fn test_missing_visit_falls_back_to_reentry() {
        let db = setup();
        let tracker = SessionTracker::default();
        let id = db
            .unit_of_work(|store| store.create_identity(&NewIdentity::first_sighting(axis(0), at(1, 10, 0))))
            .unwrap();

        let outcome = sighting(&db, &tracker, id, at(1, 10, 1));
        assert!(matches!(outcome, SessionOutcome::ReEntry { .. }));
        assert_eq!(tracker.invariant_violations(), 1);
        assert_eq!(db.get_visits_for_identity(id).unwrap().len(), 1);
    }
}
