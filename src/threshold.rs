//! Adaptive match threshold.
//!
//! The matcher accepts a candidate when the fraction of that person's stored
//! embeddings above the recognition threshold reaches a cutoff. The cutoff is a
//! weighted blend of three signals: how many embeddings the person has, how
//! good the current candidate matches look, and how clearly the best
//! candidate separates from the rest.

use crate::matcher::MatchCandidate;
use crate::utils::population_std;

const BASE_THRESHOLD: f32 = 0.20;

const EMBEDDING_WEIGHT: f32 = 0.3;
const QUALITY_WEIGHT: f32 = 0.4;
const CONFIDENCE_WEIGHT: f32 = 0.3;

pub const MIN_THRESHOLD: f32 = 0.15;
pub const MAX_THRESHOLD: f32 = 0.40;

/// The three components and their blend, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdBreakdown {
    pub embedding: f32,
    pub quality: f32,
    pub confidence: f32,
    pub combined: f32,
}

/// Fewer stored embeddings demand a larger matching fraction.
pub fn embedding_count_threshold(embedding_count: usize) -> f32 {
    if embedding_count < 5 {
        0.35
    } else if embedding_count < 15 {
        0.20
    } else {
        0.15
    }
}

/// Scale the base threshold up as candidate quality drops below 0.5.
pub fn quality_threshold(quality_scores: &[f32]) -> f32 {
    match crate::utils::mean(quality_scores) {
        Some(avg_quality) => BASE_THRESHOLD * (1.0 + (0.5 - avg_quality)),
        None => BASE_THRESHOLD,
    }
}

/// Loosen for a clear, consistent winner; tighten for a close or noisy field.
pub fn confidence_threshold(similarities: &[f32]) -> f32 {
    if similarities.len() < 2 {
        return BASE_THRESHOLD;
    }
    let mut sorted = similarities.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let gap = sorted[0] - sorted[1];

    let mut threshold = BASE_THRESHOLD;
    if gap > 0.15 {
        threshold *= 0.8;
    } else if gap < 0.05 {
        threshold *= 1.2;
    }

    match population_std(similarities) {
        Some(std) if std < 0.1 => threshold *= 0.9,
        _ => threshold *= 1.1,
    }
    threshold
}

pub fn adaptive_threshold_breakdown(
    candidates: &[MatchCandidate],
    embedding_count: usize,
    similarities: &[f32],
) -> ThresholdBreakdown {
    let qualities: Vec<f32> = candidates.iter().map(|c| c.quality_score).collect();
    let embedding = embedding_count_threshold(embedding_count);
    let quality = quality_threshold(&qualities);
    let confidence = confidence_threshold(similarities);

    let combined = EMBEDDING_WEIGHT * embedding + QUALITY_WEIGHT * quality + CONFIDENCE_WEIGHT * confidence;
    ThresholdBreakdown {
        embedding,
        quality,
        confidence,
        combined: combined.clamp(MIN_THRESHOLD, MAX_THRESHOLD),
    }
}

/// Required match fraction in [`MIN_THRESHOLD`, `MAX_THRESHOLD`].
pub fn adaptive_threshold(candidates: &[MatchCandidate], embedding_count: usize, similarities: &[f32]) -> f32 {
    adaptive_threshold_breakdown(candidates, embedding_count, similarities).combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PersonId;
    use approx::assert_relative_eq;

    fn candidate(avg: f32) -> MatchCandidate {
        MatchCandidate {
            person_id: PersonId(1),
            name: "Alice".into(),
            match_count: 3,
            avg_similarity: avg,
            max_similarity: avg,
            embedding_count: 10,
            quality_score: avg,
        }
    }

    #[test]
    fn test_embedding_count_tiers() {
        assert_eq!(embedding_count_threshold(0), 0.35);
        assert_eq!(embedding_count_threshold(4), 0.35);
        assert_eq!(embedding_count_threshold(5), 0.20);
        assert_eq!(embedding_count_threshold(14), 0.20);
        assert_eq!(embedding_count_threshold(15), 0.15);
        assert_eq!(embedding_count_threshold(100), 0.15);
    }

    #[test]
    fn test_quality_threshold() {
        assert_relative_eq!(quality_threshold(&[]), 0.20);
        assert_relative_eq!(quality_threshold(&[0.5]), 0.20);
        assert_relative_eq!(quality_threshold(&[0.9, 0.9]), 0.20 * 0.6, epsilon = 1e-6);
        assert_relative_eq!(quality_threshold(&[0.2]), 0.20 * 1.3, epsilon = 1e-6);
    }

    #[test]
    fn test_confidence_threshold() {
        assert_relative_eq!(confidence_threshold(&[0.9]), 0.20);
        // clear gap, but spread is wide: 0.2 * 0.8 * 1.1
        assert_relative_eq!(confidence_threshold(&[0.95, 0.60]), 0.176, epsilon = 1e-6);
        // close pair with low variance: 0.2 * 1.2 * 0.9
        assert_relative_eq!(confidence_threshold(&[0.90, 0.88]), 0.216, epsilon = 1e-6);
        // middle gap, low variance: 0.2 * 0.9
        assert_relative_eq!(confidence_threshold(&[0.90, 0.80]), 0.18, epsilon = 1e-6);
    }

    #[test]
    fn test_combined_is_clamped() {
        let t = adaptive_threshold(&[candidate(0.95)], 100, &[0.95]);
        assert!(t >= MIN_THRESHOLD && t <= MAX_THRESHOLD);

        let low = vec![candidate(-3.0)];
        assert_relative_eq!(adaptive_threshold(&low, 1, &[0.0, 0.0]), MAX_THRESHOLD);
    }

    #[test]
    fn test_breakdown_weights() {
        let b = adaptive_threshold_breakdown(&[candidate(0.5)], 10, &[0.9]);
        assert_relative_eq!(b.embedding, 0.20);
        assert_relative_eq!(b.quality, 0.20);
        assert_relative_eq!(b.confidence, 0.20);
        assert_relative_eq!(b.combined, 0.20, epsilon = 1e-6);
    }

    #[test]
    fn test_monotone_in_embedding_count() {
        let candidates = vec![candidate(0.9), candidate(0.87)];
        let sims = [0.9, 0.87];
        let t3 = adaptive_threshold(&candidates, 3, &sims);
        let t10 = adaptive_threshold(&candidates, 10, &sims);
        let t20 = adaptive_threshold(&candidates, 20, &sims);
        assert!(t3 >= t10, "{t3} < {t10}");
        assert!(t10 >= t20, "{t10} < {t20}");
    }
}
