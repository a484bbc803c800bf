use crate::gallery::Gallery;
use crate::types::{Embedding, Outcome};

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub outcome: Outcome,
    /// Euclidean distance to the nearest entry (if the gallery was non-empty).
    pub distance: Option<f32>,
    /// Gallery index of the nearest entry.
    pub index: Option<usize>,
}

/// Strategy for comparing a probe embedding against the gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> MatchResult;
}

/// Linear-scan nearest neighbor by Euclidean distance.
///
/// Equidistant entries resolve to the earliest one in gallery order.
/// With `max_distance` unset the nearest entry is always returned; with a
/// cutoff, a nearest distance above it yields [`Outcome::Unknown`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher {
    pub max_distance: Option<f32>,
}

impl EuclideanMatcher {
    pub fn new(max_distance: Option<f32>) -> Self {
        Self { max_distance }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            let dist = probe.distance_to(&entry.embedding);
            // Strict comparison: ties keep the earlier entry, NaN never wins.
            if dist < best_dist || (best_idx.is_none() && dist == f32::INFINITY) {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        let Some(idx) = best_idx else {
            return MatchResult { outcome: Outcome::Unknown, distance: None, index: None };
        };

        tracing::debug!(index = idx, distance = best_dist, "nearest gallery entry");

        let within = self.max_distance.map_or(true, |max| best_dist <= max);
        let outcome = if within {
            Outcome::Identity(gallery.entries()[idx].label.clone())
        } else {
            Outcome::Unknown
        };

        MatchResult { outcome, distance: Some(best_dist), index: Some(idx) }
    }
}
