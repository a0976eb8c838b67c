use approx::assert_relative_eq;
use facetrack::detection::{Detection, DetectorEmbedding, DetectorOutput};
use facetrack::quality::FaceCrop;
use facetrack::recognizer::{FrameEvent, Recognizer};
use facetrack::store::{MemoryStore, StoreError, StoredEmbedding, StoredPerson};
use facetrack::utils::{cosine_similarity, Embedding};
use facetrack::{Config, EmbeddingStore, PersonId, TrackId};
use nalgebra::SVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const FRAME: (u32, u32) = (640, 480);
const DT: f64 = 1.0 / 30.0;

/// Memory store that records every write.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryStore,
    created: Vec<String>,
    saved: Vec<(PersonId, Embedding)>,
    activated: Vec<PersonId>,
}

impl EmbeddingStore for RecordingStore {
    fn load_all_embeddings(&self) -> Result<BTreeMap<PersonId, StoredPerson>, StoreError> {
        self.inner.load_all_embeddings()
    }

    fn save_new_embedding(&mut self, person: PersonId, embedding: &Embedding, quality: f32) -> Result<(), StoreError> {
        self.saved.push((person, embedding.clone()));
        self.inner.save_new_embedding(person, embedding, quality)
    }

    fn create_person(&mut self, name: &str, embedding: &Embedding, quality: f32) -> Result<PersonId, StoreError> {
        self.created.push(name.to_string());
        self.inner.create_person(name, embedding, quality)
    }

    fn set_active_person(&mut self, person: PersonId) -> Result<(), StoreError> {
        self.activated.push(person);
        self.inner.set_active_person(person)
    }

    fn active_person(&self) -> Result<Option<PersonId>, StoreError> {
        self.inner.active_person()
    }
}

fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

fn unit(e: &Embedding) -> Embedding {
    e / e.norm()
}

fn face(embedding: &Embedding) -> Detection {
    face_at(260.0, embedding)
}

fn face_at(x1: f32, embedding: &Embedding) -> Detection {
    Detection::new(
        FaceCrop::from_fn(120, 120, |x, y| if (x + y) % 2 == 0 { 90 } else { 150 }),
        SVector::<f32, 4>::new(x1, 180.0, x1 + 120.0, 300.0),
        DetectorOutput { score: 0.95, landmarks: None, embedding: Some(embedding.as_slice().to_vec()) },
    )
}

fn axis(dim: usize, i: usize) -> Embedding {
    Embedding::from_fn(dim, |j, _| if j == i { 1.0 } else { 0.0 })
}

fn run(recognizer: &mut Recognizer<RecordingStore, DetectorEmbedding>, frames: &[Embedding], start: usize) -> Vec<FrameEvent> {
    let mut events = Vec::new();
    for (i, e) in frames.iter().enumerate() {
        let now = (start + i) as f64 * DT;
        events.extend(recognizer.process_frame(&[face(e)], FRAME, now).events);
    }
    events
}

fn noisy_frames(rng: &mut StdRng, base: &Embedding, n: usize) -> Vec<Embedding> {
    (0..n)
        .map(|_| {
            let noise = Embedding::from_fn(base.len(), |_, _| 0.05 * gaussian(rng));
            base + noise
        })
        .collect()
}

#[test]
fn new_face_is_registered_once() {
    let mut rng = StdRng::seed_from_u64(7);
    let base = unit(&Embedding::from_fn(128, |_, _| gaussian(&mut rng)));
    let frames = noisy_frames(&mut rng, &base, 30);

    let mut recognizer = Recognizer::new(Config::default(), RecordingStore::default(), DetectorEmbedding);
    let events = run(&mut recognizer, &frames, 0);

    let store = recognizer.store();
    assert_eq!(store.created, vec!["Person_1".to_string()]);
    assert!(store.saved.is_empty());
    assert!(events.iter().any(|e| matches!(e, FrameEvent::Registered { .. })));

    let track = recognizer.tracker().track(TrackId(1)).unwrap();
    assert!(track.matched);
    assert_eq!(track.name, "Person_1");
    assert!(track.needs_more_embeddings);
    assert_eq!(track.post_registration_collected, 0);

    // the stored vector is the averaged window, close to the true face
    let person = track.person_id.unwrap();
    let stored = &store.inner.person(person).unwrap().embeddings[0].vector;
    assert!(cosine_similarity(stored, &base) > 0.95);
    assert_eq!(store.active_person().unwrap(), Some(person));
}

#[test]
fn registration_is_reinforced_for_five_windows() {
    let mut rng = StdRng::seed_from_u64(11);
    let base = unit(&Embedding::from_fn(128, |_, _| gaussian(&mut rng)));
    let frames = noisy_frames(&mut rng, &base, 30 * 6 + 10);

    let mut recognizer = Recognizer::new(Config::default(), RecordingStore::default(), DetectorEmbedding);
    let events = run(&mut recognizer, &frames, 0);

    let rounds: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            FrameEvent::PostRegistrationSaved { round, .. } => Some(*round),
            _ => None,
        })
        .collect();
    assert_eq!(rounds, vec![1, 2, 3, 4, 5]);

    let store = recognizer.store();
    assert_eq!(store.created.len(), 1);
    assert_eq!(store.saved.len(), 5);

    let track = recognizer.tracker().track(TrackId(1)).unwrap();
    assert!(!track.needs_more_embeddings);
    assert_eq!(store.inner.person(track.person_id.unwrap()).unwrap().embedding_count(), 6);
}

#[test]
fn medium_confidence_windows_learn_one_embedding() {
    let dim = 8;
    let e0 = Embedding::from_fn(dim, |i, _| if i == 0 { 1.0 } else { 0.0 });
    let e1 = Embedding::from_fn(dim, |i, _| if i == 1 { 1.0 } else { 0.0 });
    let query = &e0 * 0.87 + &e1 * (1.0f32 - 0.87 * 0.87).sqrt();

    let mut store = RecordingStore::default();
    let alice = store.inner.insert_person(
        "Alice",
        (0..10).map(|_| StoredEmbedding { vector: e0.clone(), quality: 0.5 }).collect(),
    );

    let mut recognizer = Recognizer::new(Config::default(), store, DetectorEmbedding);
    let frames = vec![query.clone(); 60];
    let events = run(&mut recognizer, &frames, 0);

    let store = recognizer.store();
    assert!(store.created.is_empty());
    assert_eq!(store.saved.len(), 1);
    let (person, saved) = &store.saved[0];
    assert_eq!(*person, alice);
    assert_relative_eq!(cosine_similarity(saved, &e0), 0.87, epsilon = 1e-4);
    assert_eq!(store.activated, vec![alice, alice]);

    assert!(matches!(events[0], FrameEvent::Provisional { person, .. } if person == alice));
    assert!(matches!(events[1], FrameEvent::Learned { person, .. } if person == alice));

    let track = recognizer.tracker().track(TrackId(1)).unwrap();
    assert!(!track.matched);
    assert_eq!(track.name, "Alice");
    assert_eq!(store.inner.person(alice).unwrap().embedding_count(), 11);
}

#[test]
fn strong_match_commits_without_store_writes() {
    let dim = 8;
    let e0 = Embedding::from_fn(dim, |i, _| if i == 0 { 1.0 } else { 0.0 });
    let e1 = Embedding::from_fn(dim, |i, _| if i == 1 { 1.0 } else { 0.0 });
    let query = &e0 * 0.95 + &e1 * (1.0f32 - 0.95 * 0.95).sqrt();

    let mut store = RecordingStore::default();
    let alice = store.inner.insert_person(
        "Alice",
        (0..10).map(|_| StoredEmbedding { vector: e0.clone(), quality: 0.5 }).collect(),
    );

    let mut recognizer = Recognizer::new(Config::default(), store, DetectorEmbedding);
    let events = run(&mut recognizer, &vec![query; 45], 0);

    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], FrameEvent::Matched { person, name, .. } if *person == alice && name == "Alice"));

    let store = recognizer.store();
    assert!(store.created.is_empty() && store.saved.is_empty());
    assert_eq!(store.activated, vec![alice]);

    let track = recognizer.tracker().track(TrackId(1)).unwrap();
    assert!(track.matched && track.evaluated);
    assert!(track.recognition_embeddings.is_empty());
}

#[test]
fn full_person_is_matched_without_learning() {
    let (e0, e1) = (axis(8, 0), axis(8, 1));
    let query = &e0 * 0.87 + &e1 * (1.0f32 - 0.87 * 0.87).sqrt();

    let mut store = RecordingStore::default();
    let alice = store.inner.insert_person(
        "Alice",
        (0..30).map(|_| StoredEmbedding { vector: e0.clone(), quality: 0.5 }).collect(),
    );

    let mut recognizer = Recognizer::new(Config::default(), store, DetectorEmbedding);
    // four windows are dropped, the fifth settles the history
    let events = run(&mut recognizer, &vec![query.clone(); 149], 0);
    assert!(events.is_empty());
    assert!(!recognizer.tracker().track(TrackId(1)).unwrap().matched);

    let events = run(&mut recognizer, &vec![query; 20], 149);
    assert_eq!(events.len(), 1);
    let FrameEvent::Matched { person, similarity, .. } = &events[0] else {
        panic!("expected a match, got {events:?}");
    };
    assert_eq!(*person, alice);
    assert_relative_eq!(*similarity, 0.87, epsilon = 1e-4);

    let store = recognizer.store();
    assert!(store.saved.is_empty() && store.created.is_empty());
    assert_eq!(store.activated, vec![alice]);
    assert_eq!(store.inner.person(alice).unwrap().embedding_count(), 30);
    assert!(recognizer.tracker().track(TrackId(1)).unwrap().matched);
}

#[test]
fn registration_cooldown_delays_second_face() {
    let cfg = Config { collection_window: 5, ..Config::default() };
    let (a, b) = (axis(8, 2), axis(8, 5));
    let mut recognizer = Recognizer::new(cfg, RecordingStore::default(), DetectorEmbedding);

    let mut registered = Vec::new();
    for i in 0..90 {
        let now = i as f64 * DT;
        let report = recognizer.process_frame(&[face_at(60.0, &a), face_at(420.0, &b)], FRAME, now);
        for e in report.events {
            if let FrameEvent::Registered { track, name, .. } = e {
                registered.push((track, name, now));
            }
        }
    }

    assert_eq!(registered.len(), 2);
    let (first, second) = (&registered[0], &registered[1]);
    assert_eq!((first.0, first.1.as_str()), (TrackId(1), "Person_1"));
    assert_relative_eq!(first.2, 4.0 * DT, epsilon = 1e-9);
    assert_eq!((second.0, second.1.as_str()), (TrackId(2), "Person_2"));

    // the second window was full at the same frame but waits out the cooldown
    let waited = second.2 - first.2;
    assert!(waited >= 2.0 - 1e-9, "registered after {waited}s");
    assert!(waited <= 2.0 + 2.0 * DT, "registered after {waited}s");
    assert_eq!(recognizer.store().created, vec!["Person_1".to_string(), "Person_2".to_string()]);
}
