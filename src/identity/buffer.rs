//! Per-track sample buffering.
//!
//! Each track accumulates candidate samples for an observation window and
//! emits its best-scoring sample exactly once. The outer map is locked only
//! to find or insert an entry; the entry itself has its own lock, so updates
//! for different tracks never wait on each other.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::TrackId;

/// Default observation window before a track's best sample is emitted.
pub const DEFAULT_OBSERVE_SECONDS: f64 = 2.0;

#[derive(Debug)]
struct TrackEntry<S> {
    window_start: DateTime<Utc>,
    last_update: DateTime<Utc>,
    best_score: f32,
    best: S,
    locked: bool,
}

pub struct SampleBuffer<S> {
    observe: Duration,
    entries: Mutex<HashMap<TrackId, Arc<Mutex<TrackEntry<S>>>>>,
}

impl<S: Clone> SampleBuffer<S> {
    pub fn new(observe: Duration) -> Self {
        Self {
            observe,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Offer a sample for `track_id` observed at `now`.
    ///
    /// Returns the best sample seen so far once the observation window has
    /// elapsed, and `None` otherwise. After an emission the entry is locked
    /// and every further update returns `None` until [`release`](Self::release).
    pub fn update(&self, track_id: TrackId, sample: S, score: f32, now: DateTime<Utc>) -> Option<S> {
        let score = if score.is_nan() { f32::NEG_INFINITY } else { score };

        let entry = {
            let mut entries = self.lock_entries();
            match entries.get(&track_id) {
                Some(entry) => Arc::clone(entry),
                None => {
                    entries.insert(
                        track_id,
                        Arc::new(Mutex::new(TrackEntry {
                            window_start: now,
                            last_update: now,
                            best_score: score,
                            best: sample,
                            locked: false,
                        })),
                    );
                    return None;
                }
            }
        };

        let mut entry = entry.lock().unwrap_or_else(PoisonError::into_inner);
        if now > entry.last_update {
            entry.last_update = now;
        }
        if entry.locked {
            return None;
        }

        if score > entry.best_score {
            entry.best = sample;
            entry.best_score = score;
        }

        if now - entry.window_start >= self.observe {
            entry.locked = true;
            return Some(entry.best.clone());
        }

        None
    }

    /// Record that `track_id` is still in view at `now` and report whether it
    /// has already emitted.
    ///
    /// Locked tracks skip extraction, so this is what keeps a track that
    /// stays on camera out of the idle sweep.
    pub fn touch(&self, track_id: &TrackId, now: DateTime<Utc>) -> bool {
        let entry = self.lock_entries().get(track_id).cloned();
        match entry {
            Some(entry) => {
                let mut entry = entry.lock().unwrap_or_else(PoisonError::into_inner);
                if now > entry.last_update {
                    entry.last_update = now;
                }
                entry.locked
            }
            None => false,
        }
    }

    /// Whether the track has already emitted its sample.
    pub fn is_locked(&self, track_id: &TrackId) -> bool {
        let entry = self.lock_entries().get(track_id).cloned();
        entry.is_some_and(|e| e.lock().unwrap_or_else(PoisonError::into_inner).locked)
    }

    /// Unlock a track whose emission could not be resolved.
    ///
    /// The best sample is kept and the window has already elapsed, so the
    /// next update for the track emits again.
    pub fn release(&self, track_id: &TrackId) -> bool {
        let entry = self.lock_entries().get(track_id).cloned();
        match entry {
            Some(entry) => {
                entry.lock().unwrap_or_else(PoisonError::into_inner).locked = false;
                true
            }
            None => false,
        }
    }

    /// Drop the entry of a track the tracker reported as gone.
    pub fn retire(&self, track_id: &TrackId) -> bool {
        self.lock_entries().remove(track_id).is_some()
    }

    /// Drop entries that have not been updated for longer than `max_idle`.
    pub fn evict_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            let entry = entry.lock().unwrap_or_else(PoisonError::into_inner);
            now - entry.last_update <= max_idle
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<TrackId, Arc<Mutex<TrackEntry<S>>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Clone> Default for SampleBuffer<S> {
    fn default() -> Self {
        Self::new(Duration::milliseconds((DEFAULT_OBSERVE_SECONDS * 1000.0) as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn buffer() -> SampleBuffer<&'static str> {
        SampleBuffer::new(Duration::seconds(2))
    }

    #[test]
    fn test_first_sample_never_emits() {
        let buf = buffer();
        assert_eq!(buf.update("1".into(), "a", 0.5, at(0)), None);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_emits_best_sample_once_window_elapses() {
        let buf = buffer();
        buf.update("1".into(), "a", 0.5, at(0));
        assert_eq!(buf.update("1".into(), "b", 0.9, at(500)), None);
        assert_eq!(buf.update("1".into(), "c", 0.7, at(1500)), None);
        assert_eq!(buf.update("1".into(), "d", 0.6, at(2000)), Some("b"));
    }

    #[test]
    fn test_sample_arriving_at_lock_time_competes() {
        let buf = buffer();
        buf.update("1".into(), "a", 0.5, at(0));
        assert_eq!(buf.update("1".into(), "late", 0.95, at(2500)), Some("late"));
    }

    #[test]
    fn test_equal_score_keeps_earlier_sample() {
        let buf = buffer();
        buf.update("1".into(), "first", 0.8, at(0));
        assert_eq!(buf.update("1".into(), "second", 0.8, at(2000)), Some("first"));
    }

    #[test]
    fn test_locked_track_emits_at_most_once() {
        let buf = buffer();
        buf.update("1".into(), "a", 0.5, at(0));
        assert!(buf.update("1".into(), "b", 0.6, at(2000)).is_some());
        assert!(buf.is_locked(&"1".into()));

        let later: Vec<_> = (0..20)
            .filter_map(|i| buf.update("1".into(), "x", 1.0, at(3000 + i * 100)))
            .collect();
        assert!(later.is_empty());
    }

    #[test]
    fn test_tracks_are_independent() {
        let buf = buffer();
        buf.update("1".into(), "a", 0.5, at(0));
        buf.update("2".into(), "b", 0.9, at(1000));
        assert_eq!(buf.update("1".into(), "c", 0.1, at(2000)), Some("a"));
        assert_eq!(buf.update("2".into(), "d", 0.1, at(2000)), None);
        assert_eq!(buf.update("2".into(), "e", 0.1, at(3000)), Some("b"));
    }

    #[test]
    fn test_release_allows_retry() {
        let buf = buffer();
        buf.update("1".into(), "a", 0.5, at(0));
        assert_eq!(buf.update("1".into(), "b", 0.4, at(2000)), Some("a"));

        assert!(buf.release(&"1".into()));
        assert!(!buf.is_locked(&"1".into()));
        assert_eq!(buf.update("1".into(), "c", 0.9, at(2100)), Some("c"));
        assert!(!buf.release(&"missing".into()));
    }

    #[test]
    fn test_retire_and_evict_idle() {
        let buf = buffer();
        buf.update("1".into(), "a", 0.5, at(0));
        buf.update("2".into(), "b", 0.5, at(0));
        buf.update("3".into(), "c", 0.5, at(50_000));

        assert!(buf.retire(&"1".into()));
        assert!(!buf.retire(&"1".into()));

        let evicted = buf.evict_idle(at(60_000), Duration::seconds(30));
        assert_eq!(evicted, 1);
        assert_eq!(buf.len(), 1);
        assert!(!buf.is_locked(&"2".into()));
    }

    #[test]
    fn test_touch_keeps_locked_track_out_of_idle_sweep() {
        let buf = buffer();
        buf.update("1".into(), "a", 0.5, at(0));
        assert!(buf.update("1".into(), "b", 0.5, at(2000)).is_some());

        assert!(buf.touch(&"1".into(), at(40_000)));
        assert_eq!(buf.evict_idle(at(60_000), Duration::seconds(30)), 0);
        assert!(buf.is_locked(&"1".into()));

        assert!(!buf.touch(&"missing".into(), at(60_000)));
        assert_eq!(buf.evict_idle(at(100_000), Duration::seconds(30)), 1);
    }

    #[test]
    fn test_retired_track_starts_a_fresh_window() {
        let buf = buffer();
        buf.update("1".into(), "a", 0.5, at(0));
        assert!(buf.update("1".into(), "b", 0.5, at(2000)).is_some());
        buf.retire(&"1".into());

        assert_eq!(buf.update("1".into(), "c", 0.5, at(2100)), None);
        assert_eq!(buf.update("1".into(), "d", 0.4, at(4100)), Some("c"));
    }
}
