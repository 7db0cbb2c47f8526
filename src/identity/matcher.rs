//! Nearest-identity search over a population snapshot.

use rayon::prelude::*;

use super::Embedding;
use crate::db::Identity;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.80;

/// Populations at least this large are scanned in parallel.
const PARALLEL_SCAN_MIN: usize = 4096;

/// Outcome of a population scan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult<'a> {
    /// The best identity when its score reached the threshold
    pub identity: Option<&'a Identity>,
    /// Best score seen, even below threshold; `None` for an empty population
    pub score: Option<f32>,
}

impl MatchResult<'_> {
    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdentityMatcher {
    threshold: f32,
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl IdentityMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Find the identity most similar to `embedding`.
    ///
    /// Ties go to the earliest identity in `population`, which callers pass in
    /// ascending id order. A best score equal to the threshold matches.
    pub fn find_best<'a>(&self, embedding: &Embedding, population: &'a [Identity]) -> MatchResult<'a> {
        let best = if population.len() >= PARALLEL_SCAN_MIN {
            population
                .par_iter()
                .enumerate()
                .map(|(idx, identity)| (idx, embedding.similarity(&identity.embedding)))
                .reduce_with(|a, b| if prefer(b, a) { b } else { a })
        } else {
            let mut best: Option<(usize, f32)> = None;
            for (idx, identity) in population.iter().enumerate() {
                let score = embedding.similarity(&identity.embedding);
                if best.map_or(true, |(_, best_score)| score > best_score) {
                    best = Some((idx, score));
                }
            }
            best
        };

        match best {
            Some((idx, score)) if score >= self.threshold => MatchResult {
                identity: Some(&population[idx]),
                score: Some(score),
            },
            Some((_, score)) => MatchResult {
                identity: None,
                score: Some(score),
            },
            None => MatchResult {
                identity: None,
                score: None,
            },
        }
    }
}

/// Whether `candidate` beats `current`: higher score, then lower index.
fn prefer(candidate: (usize, f32), current: (usize, f32)) -> bool {
    candidate.1 > current.1 || (candidate.1 == current.1 && candidate.0 < current.0)
}
