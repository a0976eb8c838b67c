//! Per-track identity state machine.
//!
//! A track starts in the recognition phase, collecting one embedding per good
//! frame. A full window is averaged and matched; strong matches commit, weak
//! ones feed a short consensus history, and misses move the track into the
//! registration phase. Registration collects a second, stricter window and,
//! once committed, a few reinforcement windows for the new identity.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use crate::config::Config;
use crate::detection::Detection;
use crate::error::{Error, Result};
use crate::store::PersonId;
use crate::track::{MatchResult, Phase, Track, TrackId, Verdict, AMBIGUOUS, UNKNOWN};
use crate::utils::{compute_iou, l2_normalize, Embedding};

pub struct FaceTracker {
    tracks: BTreeMap<TrackId, Track>,
    /// Detection index paired with each track touched by the last update.
    assignments: HashMap<TrackId, usize>,
    last_track_id: u64,
    last_person_number: u64,
    last_registration_time: Option<f64>,
    cfg: Config,
}

impl FaceTracker {
    pub fn new(cfg: Config) -> Self {
        FaceTracker {
            tracks: BTreeMap::new(),
            assignments: HashMap::new(),
            last_track_id: 0,
            last_person_number: 0,
            last_registration_time: None,
            cfg,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    fn track_mut(&mut self, id: TrackId) -> Result<&mut Track> {
        self.tracks.get_mut(&id).ok_or(Error::UnknownTrack(id))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Index into the last `update_tracks` input that continued or created `id`.
    pub fn detection_for(&self, id: TrackId) -> Option<usize> {
        self.assignments.get(&id).copied()
    }

    /// Associate this frame's detections with live tracks.
    ///
    /// Each track, oldest first, takes the unclaimed detection with the highest
    /// IoU above the tracking threshold. Leftover detections start new tracks.
    /// Tracks left unmatched and idle past the staleness limit are dropped.
    /// Returns every track touched this frame.
    pub fn update_tracks(&mut self, detections: &[Detection], now: f64) -> HashSet<TrackId> {
        let mut touched = HashSet::new();
        let mut unmatched: Vec<usize> = (0..detections.len()).collect();
        self.assignments.clear();

        for (id, track) in self.tracks.iter_mut() {
            let mut best_iou = self.cfg.tracking_iou_threshold;
            let mut best_pos = None;
            for (pos, &det_idx) in unmatched.iter().enumerate() {
                let iou = compute_iou(detections[det_idx].tlbr(), &track.tlbr);
                if iou > best_iou {
                    best_iou = iou;
                    best_pos = Some(pos);
                }
            }

            if let Some(pos) = best_pos {
                let det_idx = unmatched.remove(pos);
                let det = &detections[det_idx];
                track.update(det.tlbr, det.crop.clone(), now);
                touched.insert(*id);
                self.assignments.insert(*id, det_idx);
                debug!(track = %id, detection = det_idx, iou = best_iou, "continued track");
            }
        }

        for det_idx in unmatched {
            self.last_track_id += 1;
            let id = TrackId(self.last_track_id);
            let det = &detections[det_idx];
            let mut track = Track::new(id, det.tlbr, now);
            track.crop = Some(det.crop.clone());
            self.tracks.insert(id, track);
            touched.insert(id);
            self.assignments.insert(id, det_idx);
            debug!(track = %id, detection = det_idx, "created track");
        }

        self.remove_stale_tracks(&touched, now);
        debug!(active = self.tracks.len(), touched = touched.len(), "tracks updated");
        touched
    }

    fn remove_stale_tracks(&mut self, touched: &HashSet<TrackId>, now: f64) {
        let stale_after = self.cfg.stale_track_secs;
        self.tracks.retain(|id, track| {
            let keep = touched.contains(id) || now - track.last_seen <= stale_after;
            if !keep {
                // the stored identity, if any, stays in the store
                debug!(
                    track = %id,
                    age = track.age(now),
                    frames = track.frames_seen,
                    person = ?track.person_id,
                    "removing stale track"
                );
            }
            keep
        });
    }

    /// Append a normalized embedding to the active phase's collection.
    ///
    /// Collections stop growing at the collection window. A full registration
    /// window marks the track evaluated; a full recognition window does not.
    pub fn add_embedding(&mut self, id: TrackId, embedding: &Embedding, quality: f32) -> Result<()> {
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidEmbedding("non-finite component"));
        }
        let normalized = l2_normalize(embedding).ok_or(Error::InvalidEmbedding("zero norm"))?;
        let window = self.cfg.collection_window;
        let track = self.track_mut(id)?;

        if let Some(first) = track.active_embeddings().first() {
            if first.len() != normalized.len() {
                return Err(Error::DimensionMismatch { expected: first.len(), actual: normalized.len() });
            }
        }
        if track.phase == Phase::Registration && !track.can_register {
            return Ok(());
        }
        if track.active_embeddings().len() >= window {
            return Ok(());
        }

        track.active_embeddings_mut().push(normalized);
        track.embedding_qualities.push(quality);

        if track.phase == Phase::Registration && track.registration_embeddings.len() >= window {
            track.evaluated = true;
        }
        Ok(())
    }

    pub fn has_enough_embeddings(&self, id: TrackId) -> bool {
        self.tracks
            .get(&id)
            .is_some_and(|t| t.active_embeddings().len() >= self.cfg.collection_window)
    }

    pub fn get_average_embedding(&self, id: TrackId) -> Option<Embedding> {
        self.tracks.get(&id)?.average_embedding()
    }

    pub fn start_registration_phase(&mut self, id: TrackId) -> Result<()> {
        let track = self.track_mut(id)?;
        track.phase = Phase::Registration;
        track.can_register = true;
        track.registration_embeddings.clear();
        track.embedding_qualities.clear();
        track.evaluated = false;
        debug!(track = %id, "registration phase");
        Ok(())
    }

    /// Record one evaluation step and decide once the history is full.
    ///
    /// A similarity above the instant-match threshold commits immediately.
    /// Returns the verdict when this call settled the track's identity.
    pub fn update_track_identity(
        &mut self,
        id: TrackId,
        match_result: MatchResult,
        similarity: f32,
    ) -> Result<Option<Verdict>> {
        let window = self.cfg.evaluation_frames;
        let instant = self.cfg.instant_match_threshold;
        let track = self.track_mut(id)?;
        track.push_history(similarity, match_result.clone(), window);

        if similarity > instant {
            if let Some((person, name)) = match_result {
                info!(track = %id, person = %person, name = %name, similarity, "immediate match");
                settle_match(track, person, name, similarity);
                return Ok(Some(Verdict::Matched));
            }
        }

        if track.similarity_history.len() >= window && !track.evaluated {
            return self.evaluate_track_identity(id).map(Some);
        }
        Ok(None)
    }

    fn evaluate_track_identity(&mut self, id: TrackId) -> Result<Verdict> {
        let window = self.cfg.evaluation_frames;
        let instant = self.cfg.instant_match_threshold;
        let recognition = self.cfg.recognition_threshold;
        let display = self.cfg.display_confidence;
        let track = self.track_mut(id)?;

        // (person, name) -> [similarities], in first-seen order
        let mut all: Vec<((PersonId, String), Vec<f32>)> = Vec::new();
        let mut high: Vec<((PersonId, String), Vec<f32>)> = Vec::new();
        let mut consistent: Vec<((PersonId, String), Vec<f32>)> = Vec::new();

        for (m, &s) in track.match_history.iter().zip(track.similarity_history.iter()) {
            let Some(key) = m else { continue };
            tally(&mut all, key, s);
            if s > instant {
                tally(&mut high, key, s);
            }
            if s > recognition {
                tally(&mut consistent, key, s);
            }
        }
        let frames_with_match: usize = all.iter().map(|(_, v)| v.len()).sum();
        debug!(
            track = %id,
            frames_with_match,
            window,
            high = high.len(),
            consistent = consistent.len(),
            "evaluating identity"
        );

        for group in [&high, &consistent] {
            if let Some(((person, name), sims)) = most_frequent(group) {
                let best = sims.iter().copied().fold(f32::MIN, f32::max);
                info!(track = %id, person = %person, name = %name, similarity = best, "matched from history");
                settle_match(track, *person, name.clone(), best);
                return Ok(Verdict::Matched);
            }
        }

        if let Some(((person, name), sims)) = most_frequent(&all) {
            if sims.len() >= window / 2 {
                let avg = crate::utils::mean(sims).unwrap_or(0.0);
                info!(track = %id, person = %person, name = %name, frames = sims.len(), "matched by consensus");
                settle_match(track, *person, name.clone(), avg);
                return Ok(Verdict::Matched);
            }
        }

        let sims: Vec<f32> = track.similarity_history.iter().copied().collect();
        track.matched = false;
        track.evaluated = true;
        if frames_with_match == 0 {
            track.name = UNKNOWN.to_string();
            track.similarity = crate::utils::mean(&sims).unwrap_or(display).max(display);
            track.can_register = true;
            track.verdict = Some(Verdict::Unknown);
            info!(track = %id, "no match in any frame, may register");
            Ok(Verdict::Unknown)
        } else {
            track.name = AMBIGUOUS.to_string();
            track.similarity = sims.iter().copied().fold(display, f32::max);
            track.can_register = false;
            track.verdict = Some(Verdict::Ambiguous);
            info!(track = %id, frames_with_match, window, "ambiguous matches, registration blocked");
            Ok(Verdict::Ambiguous)
        }
    }

    /// Commit a recognition outright: buffers cleared, no further evaluation.
    pub fn commit_match(&mut self, id: TrackId, person: PersonId, name: &str, similarity: f32) -> Result<()> {
        let track = self.track_mut(id)?;
        settle_match(track, person, name.to_string(), similarity);
        track.clear_embeddings();
        track.provisional_windows = 0;
        Ok(())
    }

    /// Record a recognition window in the provisional band. The window's
    /// buffers are cleared and collection continues. Returns how many such
    /// windows are pending, this one included.
    pub fn note_provisional_window(&mut self, id: TrackId, person: PersonId, name: &str, similarity: f32) -> Result<u32> {
        let track = self.track_mut(id)?;
        track.recognition_embeddings.clear();
        track.embedding_qualities.clear();
        track.name = name.to_string();
        track.person_id = Some(person);
        track.similarity = similarity;
        track.provisional_windows += 1;
        Ok(track.provisional_windows)
    }

    /// Drop the recognition window without touching any decision state.
    pub fn restart_collection(&mut self, id: TrackId) -> Result<()> {
        let track = self.track_mut(id)?;
        track.recognition_embeddings.clear();
        track.embedding_qualities.clear();
        Ok(())
    }

    pub fn reset_provisional(&mut self, id: TrackId) -> Result<()> {
        self.track_mut(id)?.provisional_windows = 0;
        Ok(())
    }

    /// Abort a registration whose face already exists in the store.
    pub fn reject_registration(&mut self, id: TrackId) -> Result<()> {
        let track = self.track_mut(id)?;
        track.matched = true;
        track.can_register = false;
        track.clear_embeddings();
        Ok(())
    }

    /// Bind the track to a freshly created person and start reinforcement.
    pub fn commit_registration(&mut self, id: TrackId, person: PersonId, name: &str, now: f64) -> Result<()> {
        let track = self.track_mut(id)?;
        settle_match(track, person, name.to_string(), 1.0);
        self.last_registration_time = Some(now);
        self.start_post_registration_collection(id)
    }

    pub fn start_post_registration_collection(&mut self, id: TrackId) -> Result<()> {
        let track = self.track_mut(id)?;
        track.post_registration_collected = 0;
        track.needs_more_embeddings = true;
        track.phase = Phase::Recognition;
        track.clear_embeddings();
        debug!(track = %id, name = %track.name, "post-registration collection started");
        Ok(())
    }

    pub fn needs_more_embeddings(&self, id: TrackId) -> bool {
        self.tracks.get(&id).is_some_and(|t| t.needs_more_embeddings)
    }

    /// Count one saved reinforcement window; collection ends after the
    /// configured number of rounds.
    pub fn increment_post_registration_embeddings(&mut self, id: TrackId) -> Result<u32> {
        let rounds = self.cfg.post_registration_rounds;
        let track = self.track_mut(id)?;
        track.post_registration_collected += 1;
        if track.post_registration_collected >= rounds {
            track.needs_more_embeddings = false;
        }
        track.clear_embeddings();
        debug!(track = %id, collected = track.post_registration_collected, rounds, "post-registration window saved");
        Ok(track.post_registration_collected)
    }

    /// Next auto-generated name, `Person_N`.
    pub fn allocate_person_name(&mut self) -> String {
        self.last_person_number += 1;
        format!("Person_{}", self.last_person_number)
    }

    /// Start the registration cooldown without binding a track.
    pub fn mark_registered(&mut self, now: f64) {
        self.last_registration_time = Some(now);
    }

    pub fn registration_cooldown_elapsed(&self, now: f64) -> bool {
        self.last_registration_time
            .map_or(true, |t| now - t > self.cfg.registration_cooldown_secs)
    }

    /// Tracker-only reset: forget every track and counter. Stored identities
    /// are untouched.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.assignments.clear();
        self.last_track_id = 0;
        self.last_person_number = 0;
        self.last_registration_time = None;
    }
}

fn settle_match(track: &mut Track, person: PersonId, name: String, similarity: f32) {
    track.name = name;
    track.person_id = Some(person);
    track.similarity = similarity;
    track.matched = true;
    track.evaluated = true;
    track.can_register = false;
    track.verdict = Some(Verdict::Matched);
}

fn tally(groups: &mut Vec<((PersonId, String), Vec<f32>)>, key: &(PersonId, String), similarity: f32) {
    match groups.iter_mut().find(|(k, _)| k == key) {
        Some((_, sims)) => sims.push(similarity),
        None => groups.push((key.clone(), vec![similarity])),
    }
}

/// Largest group; the first seen wins ties.
fn most_frequent(groups: &[((PersonId, String), Vec<f32>)]) -> Option<&((PersonId, String), Vec<f32>)> {
    groups.iter().fold(None, |best, g| match best {
        Some(b) if b.1.len() >= g.1.len() => Some(b),
        _ => Some(g),
    })
}
