use nalgebra::SVector;
use std::collections::VecDeque;
use std::fmt;

use crate::quality::FaceCrop;
use crate::store::PersonId;
use crate::utils::{mean_embedding, Embedding};

/// Process-local track handle. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track_{}", self.0)
    }
}

/// Which embedding collection is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Recognition,
    Registration,
}

/// Outcome of the multi-frame consensus evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Matched,
    Unknown,
    Ambiguous,
}

pub const UNKNOWN: &str = "Unknown";
pub const AMBIGUOUS: &str = "Ambiguous";

/// A (person, name) pair observed in one evaluation step.
pub type MatchResult = Option<(PersonId, String)>;

/// One physically followed face.
#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: TrackId,
    /// Last bounding box as [x1, y1, x2, y2].
    pub tlbr: SVector<f32, 4>,
    pub frames_seen: u32,
    pub last_seen: f64,
    pub track_start: f64,
    pub crop: Option<FaceCrop>,
    pub phase: Phase,
    pub matched: bool,
    pub evaluated: bool,
    pub can_register: bool,
    pub verdict: Option<Verdict>,
    pub name: String,
    pub person_id: Option<PersonId>,
    pub similarity: f32,
    pub similarity_history: VecDeque<f32>,
    pub match_history: VecDeque<MatchResult>,
    pub recognition_embeddings: Vec<Embedding>,
    pub registration_embeddings: Vec<Embedding>,
    pub embedding_qualities: Vec<f32>,
    /// Full windows saved since registration.
    pub post_registration_collected: u32,
    pub needs_more_embeddings: bool,
    /// Recognition windows in the provisional band not yet persisted.
    pub provisional_windows: u32,
}

impl Track {
    pub fn new(track_id: TrackId, tlbr: SVector<f32, 4>, now: f64) -> Self {
        Track {
            track_id,
            tlbr,
            frames_seen: 1,
            last_seen: now,
            track_start: now,
            crop: None,
            phase: Phase::Recognition,
            matched: false,
            evaluated: false,
            can_register: false,
            verdict: None,
            name: UNKNOWN.to_string(),
            person_id: None,
            similarity: 0.0,
            similarity_history: VecDeque::new(),
            match_history: VecDeque::new(),
            recognition_embeddings: Vec::new(),
            registration_embeddings: Vec::new(),
            embedding_qualities: Vec::new(),
            post_registration_collected: 0,
            needs_more_embeddings: false,
            provisional_windows: 0,
        }
    }

    /// Continue the track with a new detection.
    pub fn update(&mut self, tlbr: SVector<f32, 4>, crop: FaceCrop, now: f64) {
        self.tlbr = tlbr;
        self.frames_seen += 1;
        self.last_seen = now;
        self.crop = Some(crop);
    }

    pub fn active_embeddings(&self) -> &[Embedding] {
        match self.phase {
            Phase::Recognition => &self.recognition_embeddings,
            Phase::Registration => &self.registration_embeddings,
        }
    }

    pub(crate) fn active_embeddings_mut(&mut self) -> &mut Vec<Embedding> {
        match self.phase {
            Phase::Recognition => &mut self.recognition_embeddings,
            Phase::Registration => &mut self.registration_embeddings,
        }
    }

    /// Mean of the active collection, re-normalized.
    pub fn average_embedding(&self) -> Option<Embedding> {
        mean_embedding(self.active_embeddings())
    }

    pub fn average_quality(&self) -> f32 {
        crate::utils::mean(&self.embedding_qualities).unwrap_or(0.0)
    }

    pub(crate) fn clear_embeddings(&mut self) {
        self.recognition_embeddings.clear();
        self.registration_embeddings.clear();
        self.embedding_qualities.clear();
    }

    /// Push one (similarity, match) step, keeping at most `window` entries.
    pub(crate) fn push_history(&mut self, similarity: f32, result: MatchResult, window: usize) {
        self.similarity_history.push_back(similarity);
        self.match_history.push_back(result);
        while self.similarity_history.len() > window {
            self.similarity_history.pop_front();
            self.match_history.pop_front();
        }
    }

    pub fn age(&self, now: f64) -> f64 {
        now - self.track_start
    }
}
