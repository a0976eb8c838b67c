use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::{EmbeddingStore, PersonId, StoredEmbedding, StoredPerson};
use crate::threshold::{adaptive_threshold_breakdown, ThresholdBreakdown};
use crate::utils::{cosine_similarity, Embedding};

/// One stored person that had at least one embedding above the recognition
/// threshold for the current query.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub person_id: PersonId,
    pub name: String,
    /// Stored embeddings above the recognition threshold.
    pub match_count: usize,
    /// Mean similarity over those embeddings.
    pub avg_similarity: f32,
    pub max_similarity: f32,
    /// Total stored embeddings for this person.
    pub embedding_count: usize,
    pub quality_score: f32,
}

impl MatchCandidate {
    pub fn match_fraction(&self) -> f32 {
        if self.embedding_count == 0 {
            return 0.0;
        }
        self.match_count as f32 / self.embedding_count as f32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    /// The accepted candidate, if any.
    pub matched: Option<MatchCandidate>,
    /// Highest raw similarity seen across every stored person, match or not.
    pub best_raw_similarity: f32,
    pub threshold: Option<ThresholdBreakdown>,
    pub candidate_count: usize,
}

impl MatchOutcome {
    fn no_match(best_raw_similarity: f32) -> Self {
        MatchOutcome { matched: None, best_raw_similarity, threshold: None, candidate_count: 0 }
    }

    /// Similarity to report: the accepted candidate's average, otherwise the
    /// best raw similarity.
    pub fn similarity(&self) -> f32 {
        self.matched.as_ref().map_or(self.best_raw_similarity, |m| m.avg_similarity)
    }

    pub fn is_match(&self) -> bool {
        self.matched.is_some()
    }
}

/// Matches averaged query embeddings against every stored identity.
///
/// Keeps a read-through cache of the store, loaded on first use. New
/// registrations and learned embeddings are appended to the cache directly
/// instead of re-reading the store.
pub struct IdentityMatcher<S> {
    store: S,
    cache: Option<BTreeMap<PersonId, StoredPerson>>,
    recognition_threshold: f32,
}

impl<S: EmbeddingStore> IdentityMatcher<S> {
    pub fn new(store: S, recognition_threshold: f32) -> Self {
        Self { store, cache: None, recognition_threshold }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Drop the cache; the next query reloads from the store.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    fn people(&mut self) -> Result<&mut BTreeMap<PersonId, StoredPerson>> {
        if self.cache.is_none() {
            let loaded = self.store.load_all_embeddings()?;
            debug!(people = loaded.len(), "loaded face embeddings");
            self.cache = Some(loaded);
        }
        Ok(self.cache.get_or_insert_with(BTreeMap::new))
    }

    pub fn known_people(&mut self) -> Result<usize> {
        Ok(self.people()?.len())
    }

    pub fn embedding_count(&mut self, person: PersonId) -> Result<usize> {
        Ok(self.people()?.get(&person).map_or(0, StoredPerson::embedding_count))
    }

    pub fn has_name(&mut self, name: &str) -> Result<bool> {
        Ok(self.people()?.values().any(|p| p.name == name))
    }

    pub fn remember_embedding(&mut self, person: PersonId, embedding: Embedding, quality: f32) -> Result<()> {
        if let Some(p) = self.people()?.get_mut(&person) {
            p.embeddings.push(StoredEmbedding { vector: embedding, quality });
        }
        Ok(())
    }

    pub fn remember_person(&mut self, person: PersonId, name: &str, embedding: Embedding, quality: f32) -> Result<()> {
        self.people()?.insert(
            person,
            StoredPerson {
                name: name.to_string(),
                embeddings: vec![StoredEmbedding { vector: embedding, quality }],
            },
        );
        Ok(())
    }

    /// Find the best stored identity for `query`.
    ///
    /// An empty store is a no-match with similarity 0.0. Stored embeddings of
    /// a different length than the query are an error.
    pub fn match_embedding(&mut self, query: &Embedding) -> Result<MatchOutcome> {
        let recognition_threshold = self.recognition_threshold;
        let people = self.people()?;
        if people.is_empty() {
            debug!("no faces in store");
            return Ok(MatchOutcome::no_match(0.0));
        }

        let mut candidates = Vec::new();
        let mut best_raw = f32::MIN;

        for (&person_id, person) in people.iter() {
            if person.embeddings.is_empty() {
                continue;
            }
            let mut max_similarity = f32::MIN;
            let mut above = Vec::new();
            for stored in &person.embeddings {
                check_dims(query, &stored.vector)?;
                let s = cosine_similarity(query, &stored.vector);
                max_similarity = max_similarity.max(s);
                if s > recognition_threshold {
                    above.push(s);
                }
            }
            best_raw = best_raw.max(max_similarity);

            if let Some(avg) = crate::utils::mean(&above) {
                candidates.push(MatchCandidate {
                    person_id,
                    name: person.name.clone(),
                    match_count: above.len(),
                    avg_similarity: avg,
                    max_similarity,
                    embedding_count: person.embeddings.len(),
                    quality_score: avg,
                });
            }
        }

        let best_raw = if best_raw == f32::MIN { 0.0 } else { best_raw };
        candidates.sort_by(|a, b| b.avg_similarity.total_cmp(&a.avg_similarity));

        let Some(best) = candidates.first() else {
            debug!(best_raw, "no match found");
            return Ok(MatchOutcome::no_match(best_raw));
        };

        let similarities: Vec<f32> = candidates.iter().map(|c| c.avg_similarity).collect();
        let threshold = adaptive_threshold_breakdown(&candidates, best.embedding_count, &similarities);
        let fraction = best.match_fraction();
        debug!(
            person = %best.person_id,
            fraction,
            threshold = threshold.combined,
            embedding_part = threshold.embedding,
            quality_part = threshold.quality,
            confidence_part = threshold.confidence,
            "adaptive threshold"
        );

        let matched = if fraction >= threshold.combined {
            info!(
                person = %best.person_id,
                name = %best.name,
                similarity = best.avg_similarity,
                matched = best.match_count,
                stored = best.embedding_count,
                "match confirmed"
            );
            Some(best.clone())
        } else {
            debug!(person = %best.person_id, fraction, "best candidate below adaptive threshold");
            None
        };

        Ok(MatchOutcome {
            matched,
            best_raw_similarity: best_raw,
            threshold: Some(threshold),
            candidate_count: candidates.len(),
        })
    }

    /// Highest similarity between `query` and any stored embedding of any
    /// person, with that person's id and name.
    pub fn max_similarity_to_any(&mut self, query: &Embedding) -> Result<Option<(PersonId, String, f32)>> {
        let mut best: Option<(PersonId, String, f32)> = None;
        for (&person_id, person) in self.people()?.iter() {
            for stored in &person.embeddings {
                check_dims(query, &stored.vector)?;
                let s = cosine_similarity(query, &stored.vector);
                if best.as_ref().map_or(true, |(_, _, b)| s > *b) {
                    best = Some((person_id, person.name.clone(), s));
                }
            }
        }
        Ok(best)
    }
}

fn check_dims(query: &Embedding, stored: &Embedding) -> Result<()> {
    if query.len() != stored.len() {
        return Err(Error::DimensionMismatch { expected: stored.len(), actual: query.len() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use approx::assert_relative_eq;

    /// Unit vector whose cosine with e0 is `cos`, rotated towards `axis`.
    fn at_angle(cos: f32, axis: usize, dim: usize) -> Embedding {
        let mut v = Embedding::zeros(dim);
        v[0] = cos;
        v[axis] = (1.0 - cos * cos).sqrt();
        v
    }

    fn stored(v: Embedding) -> StoredEmbedding {
        StoredEmbedding { vector: v, quality: 0.5 }
    }

    #[test]
    fn test_empty_store_is_no_match() {
        let mut matcher = IdentityMatcher::new(MemoryStore::new(), 0.85);
        let outcome = matcher.match_embedding(&at_angle(1.0, 1, 8)).unwrap();
        assert!(!outcome.is_match());
        assert_eq!(outcome.similarity(), 0.0);
    }

    #[test]
    fn test_matches_best_person() {
        let mut store = MemoryStore::new();
        let alice = store.insert_person("Alice", (0..10).map(|_| stored(at_angle(1.0, 1, 8))).collect());
        let _bob = store.insert_person("Bob", (0..10).map(|_| stored(at_angle(0.2, 2, 8))).collect());

        let mut matcher = IdentityMatcher::new(store, 0.85);
        let outcome = matcher.match_embedding(&at_angle(0.95, 3, 8)).unwrap();
        let m = outcome.matched.expect("alice should match");
        assert_eq!(m.person_id, alice);
        assert_eq!(m.match_count, 10);
        assert_relative_eq!(m.avg_similarity, 0.95, epsilon = 1e-5);
        assert_relative_eq!(outcome.best_raw_similarity, 0.95, epsilon = 1e-5);
        assert_eq!(outcome.candidate_count, 1);
    }

    #[test]
    fn test_low_match_fraction_is_rejected() {
        // 1 of 10 stored embeddings close to the query: 10% < any threshold
        let mut embeddings: Vec<_> = (0..9).map(|i| stored(at_angle(0.1, 1 + i % 4, 8))).collect();
        embeddings.push(stored(at_angle(1.0, 1, 8)));
        let mut store = MemoryStore::new();
        store.insert_person("Alice", embeddings);

        let mut matcher = IdentityMatcher::new(store, 0.85);
        let outcome = matcher.match_embedding(&at_angle(1.0, 1, 8)).unwrap();
        assert!(!outcome.is_match());
        assert_relative_eq!(outcome.best_raw_similarity, 1.0, epsilon = 1e-5);
        assert!(outcome.threshold.is_some());
    }

    #[test]
    fn test_below_recognition_threshold_reports_raw_similarity() {
        let mut store = MemoryStore::new();
        store.insert_person("Alice", vec![stored(at_angle(1.0, 1, 8))]);
        store.insert_person("Empty", Vec::new());

        let mut matcher = IdentityMatcher::new(store, 0.85);
        let outcome = matcher.match_embedding(&at_angle(0.6, 2, 8)).unwrap();
        assert!(!outcome.is_match());
        assert_relative_eq!(outcome.similarity(), 0.6, epsilon = 1e-5);
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let mut store = MemoryStore::new();
        store.insert_person("Alice", vec![stored(at_angle(1.0, 1, 8))]);
        let mut matcher = IdentityMatcher::new(store, 0.85);
        assert!(matches!(
            matcher.match_embedding(&at_angle(1.0, 1, 4)),
            Err(Error::DimensionMismatch { expected: 8, actual: 4 })
        ));
    }

    #[test]
    fn test_cache_is_read_through() {
        let mut matcher = IdentityMatcher::new(MemoryStore::new(), 0.85);
        assert_eq!(matcher.known_people().unwrap(), 0);

        // written behind the cache's back: invisible until invalidated
        let id = matcher.store_mut().insert_person("Alice", vec![stored(at_angle(1.0, 1, 8))]);
        assert_eq!(matcher.known_people().unwrap(), 0);
        matcher.invalidate();
        assert_eq!(matcher.known_people().unwrap(), 1);

        matcher.remember_embedding(id, at_angle(0.9, 2, 8), 0.4).unwrap();
        assert_eq!(matcher.embedding_count(id).unwrap(), 2);

        matcher.remember_person(PersonId(7), "Bob", at_angle(0.0, 1, 8), 0.5).unwrap();
        let (who, name, sim) = matcher.max_similarity_to_any(&at_angle(0.0, 1, 8)).unwrap().unwrap();
        assert_eq!(who, PersonId(7));
        assert_eq!(name, "Bob");
        assert_relative_eq!(sim, 1.0, epsilon = 1e-5);
    }
}
