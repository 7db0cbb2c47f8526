//! Identity resolution: sample buffering, matching, sessions and daily counts.

pub mod analytics;
pub mod buffer;
pub mod embedding;
pub mod matcher;
pub mod resolver;
pub mod session;

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub use analytics::AnalyticsAggregator;
pub use buffer::SampleBuffer;
pub use embedding::{Embedding, EmbeddingError, EMBEDDING_DIM};
pub use matcher::{IdentityMatcher, MatchResult};
pub use resolver::{Resolution, Resolver, ResolverSettings};
pub use session::{SessionOutcome, SessionTracker};

/// Opaque track identifier assigned by the upstream tracker.
///
/// Trackers emit either integers or strings; both deserialize into the
/// same textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TrackId(pub String);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        TrackId(value.to_string())
    }
}

impl From<u64> for TrackId {
    fn from(value: u64) -> Self {
        TrackId(value.to_string())
    }
}

impl<'de> Deserialize<'de> for TrackId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => TrackId::from(n),
            Raw::Text(s) => TrackId(s),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Embedding, EMBEDDING_DIM};
    use crate::db::{Identity, NewIdentity};
    use chrono::{TimeZone, Utc};

    /// Unit vector along `i`.
    pub fn axis(i: usize) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[i] = 1.0;
        Embedding::new(values).unwrap()
    }

    /// Unit vector whose cosine similarity with `axis(a)` is `cos`.
    pub fn blend(a: usize, b: usize, cos: f32) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[a] = cos;
        values[b] = (1.0 - cos * cos).sqrt();
        Embedding::new(values).unwrap()
    }

    /// A freshly created identity row with the given id.
    pub fn identity(id: i64, embedding: Embedding) -> Identity {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let new = NewIdentity::first_sighting(embedding, now);
        Identity {
            id,
            embedding: new.embedding,
            label: new.label,
            first_seen: new.first_seen,
            last_seen: new.last_seen,
            visit_count: new.visit_count,
            daily_visit_count: new.daily_visit_count,
            last_visit_date: new.last_visit_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_id_accepts_numbers_and_strings() {
        let ids: Vec<TrackId> = serde_json::from_str(r#"[7, "7", "cam1-12"]"#).unwrap();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[2].to_string(), "cam1-12");
    }
}
