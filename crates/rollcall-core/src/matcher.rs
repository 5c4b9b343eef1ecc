//! Nearest-embedding matching against an enrolled gallery.

use crate::types::{Embedding, GalleryEntry, Label};

/// Default maximum Euclidean distance for a positive match.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 1.0;

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub label: Label,
    /// Distance to the nearest comparable gallery entry, matched or not.
    pub best_distance: Option<f32>,
}

impl MatchResult {
    pub fn matched(&self) -> bool {
        matches!(self.label, Label::Known(_))
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
///
/// Implementations must return [`Label::Unknown`] for an empty gallery and
/// must never report a match at or beyond `threshold`.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Linear-scan Euclidean matcher.
///
/// The first entry at the minimum distance wins ties, so the result is
/// deterministic for a gallery in a fixed order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let Some(dist) = probe.euclidean_distance(&entry.embedding) else {
                tracing::debug!(
                    identity = %entry.identity,
                    probe_dim = probe.dim(),
                    stored_dim = entry.embedding.dim(),
                    "skipping gallery entry with mismatched dimension"
                );
                continue;
            };
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((i, dist)),
            }
        }

        match best {
            Some((idx, dist)) if dist < threshold => MatchResult {
                label: Label::Known(gallery[idx].identity.clone()),
                best_distance: Some(dist),
            },
            _ => MatchResult {
                label: Label::Unknown,
                best_distance: best.map(|(_, d)| d),
            },
        }
    }
}
