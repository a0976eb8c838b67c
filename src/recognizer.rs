//! Per-frame decision loop.
//!
//! [`Recognizer`] glues the tracker, the quality gate, the feature extractor
//! and the matcher together. Each call to [`Recognizer::process_frame`] moves
//! every visible track one step through recognition, continuous learning,
//! registration or post-registration reinforcement, and writes the resulting
//! identity decisions to the store.

use nalgebra::SVector;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detection::{Detection, FeatureExtractor};
use crate::error::{Error, Result};
use crate::matcher::IdentityMatcher;
use crate::quality::QualityGate;
use crate::store::{EmbeddingStore, PersonId};
use crate::track::{Phase, TrackId, Verdict};
use crate::tracker::FaceTracker;
use crate::utils::{bbox_center, Embedding};

/// Identity decisions taken during one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Matched { track: TrackId, person: PersonId, name: String, similarity: f32 },
    /// A window in the continuous-learning band that was not persisted.
    Provisional { track: TrackId, person: PersonId, similarity: f32 },
    /// A window in the continuous-learning band saved to the person.
    Learned { track: TrackId, person: PersonId, similarity: f32 },
    RegistrationStarted { track: TrackId },
    Registered { track: TrackId, person: PersonId, name: String },
    DuplicateRejected { track: TrackId, similar_to: PersonId, similarity: f32 },
    PostRegistrationSaved { track: TrackId, person: PersonId, round: u32 },
}

/// Display state of one track after the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSummary {
    pub track_id: TrackId,
    pub tlbr: SVector<f32, 4>,
    pub name: String,
    pub person_id: Option<PersonId>,
    pub similarity: f32,
    pub phase: Phase,
    pub matched: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub events: Vec<FrameEvent>,
    pub tracks: Vec<TrackSummary>,
}

pub struct Recognizer<S, E> {
    tracker: FaceTracker,
    matcher: IdentityMatcher<S>,
    gate: QualityGate,
    extractor: E,
    cfg: Config,
}

impl<S: EmbeddingStore, E: FeatureExtractor> Recognizer<S, E> {
    pub fn new(cfg: Config, store: S, extractor: E) -> Self {
        Recognizer {
            tracker: FaceTracker::new(cfg.clone()),
            matcher: IdentityMatcher::new(store, cfg.recognition_threshold),
            gate: QualityGate::new(cfg.quality.clone()),
            extractor,
            cfg,
        }
    }

    pub fn tracker(&self) -> &FaceTracker {
        &self.tracker
    }

    pub fn store(&self) -> &S {
        self.matcher.store()
    }

    pub fn store_mut(&mut self) -> &mut S {
        self.matcher.invalidate();
        self.matcher.store_mut()
    }

    pub fn into_store(self) -> S {
        self.matcher.into_store()
    }

    /// Drop every track and the identity cache.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.matcher.invalidate();
    }

    /// Run one frame of detections. `frame_size` is (width, height) in pixels.
    ///
    /// Store or extractor failures are logged and skip the affected track for
    /// this frame only.
    pub fn process_frame(&mut self, detections: &[Detection], frame_size: (u32, u32), now: f64) -> FrameReport {
        let mut touched: Vec<TrackId> = self.tracker.update_tracks(detections, now).into_iter().collect();
        touched.sort();

        let mut events = Vec::new();
        for &id in &touched {
            let Some(det) = self.tracker.detection_for(id).and_then(|i| detections.get(i)) else {
                continue;
            };
            if let Err(e) = self.process_track(id, det, now, &mut events) {
                warn!(track = %id, error = %e, "skipping track for this frame");
            }
        }

        if self.cfg.prefer_centered_face {
            if let Err(e) = self.update_centered_person(&touched, frame_size) {
                warn!(error = %e, "could not update active person");
            }
        }

        let tracks = touched
            .iter()
            .filter_map(|id| self.tracker.track(*id))
            .map(|t| TrackSummary {
                track_id: t.track_id,
                tlbr: t.tlbr,
                name: t.name.clone(),
                person_id: t.person_id,
                similarity: t.similarity,
                phase: t.phase,
                matched: t.matched,
            })
            .collect();
        FrameReport { events, tracks }
    }

    fn process_track(&mut self, id: TrackId, det: &Detection, now: f64, events: &mut Vec<FrameEvent>) -> Result<()> {
        let track = self.tracker.track(id).ok_or(Error::UnknownTrack(id))?;
        if !track.matched {
            let registered = self.collect_and_decide(id, det, now, events)?;
            if registered {
                return Ok(());
            }
        }
        if self.is_reinforcing(id) {
            self.reinforce(id, det, events)?;
        }
        Ok(())
    }

    fn is_reinforcing(&self, id: TrackId) -> bool {
        self.tracker.track(id).is_some_and(|t| t.matched && t.person_id.is_some()) && self.tracker.needs_more_embeddings(id)
    }

    /// Returns true when this frame registered a new person.
    fn collect_and_decide(&mut self, id: TrackId, det: &Detection, now: f64, events: &mut Vec<FrameEvent>) -> Result<bool> {
        self.maybe_skip_to_registration(id, events)?;

        let phase = self.tracker.track(id).map_or(Phase::Recognition, |t| t.phase);
        let quality = match self.gate.check(&det.crop, det.landmarks(), phase == Phase::Registration) {
            Ok(q) => q,
            Err(reason) => {
                debug!(track = %id, ?phase, %reason, "low quality frame");
                return Ok(false);
            }
        };

        let embedding = self.extractor.extract(det)?;
        self.tracker.add_embedding(id, &embedding, quality)?;
        if !self.tracker.has_enough_embeddings(id) {
            return Ok(false);
        }

        let can_register = self.tracker.track(id).is_some_and(|t| t.can_register);
        match phase {
            Phase::Recognition => {
                self.resolve_recognition(id, events)?;
                Ok(false)
            }
            Phase::Registration if can_register => self.try_register(id, now, events),
            Phase::Registration => Ok(false),
        }
    }

    /// With nobody stored, a recognition window can only end in "no match", so
    /// a fresh track goes straight to registration.
    fn maybe_skip_to_registration(&mut self, id: TrackId, events: &mut Vec<FrameEvent>) -> Result<()> {
        let fresh = self.tracker.track(id).is_some_and(|t| {
            t.phase == Phase::Recognition
                && t.recognition_embeddings.is_empty()
                && t.provisional_windows == 0
        });
        if fresh && self.matcher.known_people()? == 0 {
            self.tracker.start_registration_phase(id)?;
            debug!(track = %id, "empty store, collecting for registration");
            events.push(FrameEvent::RegistrationStarted { track: id });
        }
        Ok(())
    }

    fn window_average(&self, id: TrackId) -> Result<(Embedding, f32)> {
        let track = self.tracker.track(id).ok_or(Error::UnknownTrack(id))?;
        let avg = track.average_embedding().ok_or(Error::InvalidEmbedding("zero-norm window average"))?;
        Ok((avg, track.average_quality()))
    }

    fn resolve_recognition(&mut self, id: TrackId, events: &mut Vec<FrameEvent>) -> Result<()> {
        let (avg, avg_quality) = self.window_average(id)?;
        let outcome = self.matcher.match_embedding(&avg)?;

        let Some(candidate) = outcome.matched else {
            info!(track = %id, best = outcome.best_raw_similarity, "no match found, starting registration phase");
            self.tracker.start_registration_phase(id)?;
            events.push(FrameEvent::RegistrationStarted { track: id });
            return Ok(());
        };

        let person = candidate.person_id;
        let similarity = candidate.avg_similarity;
        let verdict = self
            .tracker
            .update_track_identity(id, Some((person, candidate.name.clone())), similarity)?;

        if similarity > self.cfg.high_confidence_threshold {
            self.tracker.commit_match(id, person, &candidate.name, similarity)?;
            self.matcher.store_mut().set_active_person(person)?;
            info!(track = %id, person = %person, name = %candidate.name, similarity, "high confidence match");
            events.push(FrameEvent::Matched { track: id, person, name: candidate.name, similarity });
            return Ok(());
        }

        if similarity >= self.cfg.recognition_threshold
            && candidate.embedding_count < self.cfg.max_embeddings_per_person
        {
            self.matcher.store_mut().set_active_person(person)?;
            let pending = self.tracker.note_provisional_window(id, person, &candidate.name, similarity)?;
            if pending >= 2 {
                self.matcher.store_mut().save_new_embedding(person, &avg, avg_quality)?;
                self.matcher.remember_embedding(person, avg, avg_quality)?;
                self.tracker.reset_provisional(id)?;
                info!(
                    track = %id,
                    person = %person,
                    similarity,
                    stored = candidate.embedding_count + 1,
                    "learned new embedding"
                );
                events.push(FrameEvent::Learned { track: id, person, similarity });
            } else {
                debug!(track = %id, person = %person, similarity, "medium confidence match");
                events.push(FrameEvent::Provisional { track: id, person, similarity });
            }
        } else {
            self.tracker.restart_collection(id)?;
        }

        if verdict == Some(Verdict::Matched) {
            let track = self.tracker.track(id).ok_or(Error::UnknownTrack(id))?;
            if let Some(person) = track.person_id {
                let (name, similarity) = (track.name.clone(), track.similarity);
                self.tracker.commit_match(id, person, &name, similarity)?;
                self.matcher.store_mut().set_active_person(person)?;
                events.push(FrameEvent::Matched { track: id, person, name, similarity });
            }
        }
        Ok(())
    }

    fn try_register(&mut self, id: TrackId, now: f64, events: &mut Vec<FrameEvent>) -> Result<bool> {
        if !self.tracker.registration_cooldown_elapsed(now) {
            debug!(track = %id, "registration cooling down");
            return Ok(false);
        }
        let (avg, avg_quality) = self.window_average(id)?;

        if let Some((similar_to, name, similarity)) = self.matcher.max_similarity_to_any(&avg)? {
            if similarity > self.cfg.duplicate_registration_threshold {
                warn!(track = %id, similar_to = %similar_to, name = %name, similarity, "cannot register, too similar to existing face");
                self.tracker.reject_registration(id)?;
                events.push(FrameEvent::DuplicateRejected { track: id, similar_to, similarity });
                return Ok(false);
            }
        }

        let name = self.next_person_name()?;
        let person = self.matcher.store_mut().create_person(&name, &avg, avg_quality)?;
        self.matcher.remember_person(person, &name, avg, avg_quality)?;
        self.matcher.store_mut().set_active_person(person)?;
        self.tracker.commit_registration(id, person, &name, now)?;
        info!(track = %id, person = %person, name = %name, quality = avg_quality, "auto-registered new face");
        events.push(FrameEvent::Registered { track: id, person, name });
        Ok(true)
    }

    /// Next `Person_N` not already used by a stored identity.
    fn next_person_name(&mut self) -> Result<String> {
        loop {
            let name = self.tracker.allocate_person_name();
            if !self.matcher.has_name(&name)? {
                return Ok(name);
            }
        }
    }

    fn reinforce(&mut self, id: TrackId, det: &Detection, events: &mut Vec<FrameEvent>) -> Result<()> {
        let quality = match self.gate.check(&det.crop, det.landmarks(), false) {
            Ok(q) => q,
            Err(reason) => {
                debug!(track = %id, %reason, "skipping low quality frame for additional embedding");
                return Ok(());
            }
        };
        let embedding = self.extractor.extract(det)?;
        self.tracker.add_embedding(id, &embedding, quality)?;
        if !self.tracker.has_enough_embeddings(id) {
            return Ok(());
        }

        let person = self
            .tracker
            .track(id)
            .and_then(|t| t.person_id)
            .ok_or(Error::UnknownTrack(id))?;
        let (avg, avg_quality) = self.window_average(id)?;
        self.matcher.store_mut().save_new_embedding(person, &avg, avg_quality)?;
        self.matcher.remember_embedding(person, avg, avg_quality)?;
        let round = self.tracker.increment_post_registration_embeddings(id)?;
        info!(track = %id, person = %person, round, rounds = self.cfg.post_registration_rounds, "added post-registration embedding");
        events.push(FrameEvent::PostRegistrationSaved { track: id, person, round });
        Ok(())
    }

    /// Make the recognised face closest to the frame centre the active person.
    fn update_centered_person(&mut self, touched: &[TrackId], frame_size: (u32, u32)) -> Result<()> {
        let cx = frame_size.0 as f32 / 2.0;
        let cy = frame_size.1 as f32 / 2.0;

        let centered = touched
            .iter()
            .filter_map(|id| self.tracker.track(*id))
            .filter(|t| t.matched)
            .filter_map(|t| {
                let person = t.person_id?;
                let (x, y) = bbox_center(&t.tlbr);
                Some((person, (x - cx).hypot(y - cy)))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let Some((person, distance)) = centered else {
            return Ok(());
        };
        if self.matcher.store().active_person()? != Some(person) {
            debug!(person = %person, distance, "most centred face is now active");
            self.matcher.store_mut().set_active_person(person)?;
        }
        Ok(())
    }

    /// Register a face on demand, bypassing the collection windows. Returns
    /// `None` when the crop fails the registration quality checks.
    pub fn register_manually(&mut self, det: &Detection, now: f64) -> Result<Option<PersonId>> {
        if let Err(reason) = self.gate.check(&det.crop, det.landmarks(), true) {
            warn!(%reason, "cannot register");
            return Ok(None);
        }
        let embedding = crate::utils::l2_normalize(&self.extractor.extract(det)?)
            .ok_or(Error::InvalidEmbedding("zero norm"))?;
        let name = self.next_person_name()?;
        let person = self.matcher.store_mut().create_person(&name, &embedding, 1.0)?;
        self.matcher.remember_person(person, &name, embedding, 1.0)?;
        self.matcher.store_mut().set_active_person(person)?;
        self.tracker.mark_registered(now);
        info!(person = %person, name = %name, "manually registered new face");
        Ok(Some(person))
    }
}
