use anyhow::Context;
use clap::Parser;
use facetrack::detection::{Detection, DetectorEmbedding, DetectorOutput, Landmarks};
use facetrack::quality::FaceCrop;
use facetrack::recognizer::{FrameEvent, FrameReport, Recognizer};
use facetrack::store::{EmbeddingStore, JsonFileStore, PersonId};
use facetrack::Config;
use nalgebra::SVector;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "facetrack",
    about = "Replay a face detection log through the identity tracker",
    version = "0.1.0"
)]
struct Args {
    /// JSON array of frames with detections and embeddings
    #[arg(short, long)]
    log: PathBuf,

    /// Identity store, created if missing
    #[arg(short, long)]
    store: PathBuf,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write per-frame track states here
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Deserialize, Debug)]
struct FrameLog {
    time: f64,
    #[serde(default = "default_width")]
    width: u32,
    #[serde(default = "default_height")]
    height: u32,
    detections: Vec<DetectionLog>,
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

#[derive(Deserialize, Debug)]
struct DetectionLog {
    bbox: [f32; 4], // [x1, y1, x2, y2]
    crop: FaceCrop,
    #[serde(default)]
    landmarks: Option<[[f32; 2]; 5]>,
    #[serde(default)]
    score: f32,
    embedding: Option<Vec<f32>>,
}

impl From<DetectionLog> for Detection {
    fn from(d: DetectionLog) -> Self {
        let [x1, y1, x2, y2] = d.bbox;
        Detection::new(
            d.crop,
            SVector::<f32, 4>::new(x1, y1, x2, y2),
            DetectorOutput {
                score: d.score,
                landmarks: d.landmarks.map(Landmarks::from_points),
                embedding: d.embedding,
            },
        )
    }
}

#[derive(Serialize, Debug)]
struct TrackLog {
    frame: usize,
    track: String,
    bbox: [f32; 4],
    name: String,
    person_id: Option<PersonId>,
    similarity: f32,
    phase: String,
    matched: bool,
}

fn describe(event: &FrameEvent) -> String {
    match event {
        FrameEvent::Matched { track, person, name, similarity } => {
            format!("{track}: matched {name} (id {person}, {similarity:.3})")
        }
        FrameEvent::Provisional { track, person, similarity } => {
            format!("{track}: medium confidence match with id {person} ({similarity:.3})")
        }
        FrameEvent::Learned { track, person, similarity } => {
            format!("{track}: learned new embedding for id {person} ({similarity:.3})")
        }
        FrameEvent::RegistrationStarted { track } => format!("{track}: collecting for registration"),
        FrameEvent::Registered { track, person, name } => format!("{track}: registered {name} (id {person})"),
        FrameEvent::DuplicateRejected { track, similar_to, similarity } => {
            format!("{track}: not registered, too similar to id {similar_to} ({similarity:.3})")
        }
        FrameEvent::PostRegistrationSaved { track, person, round } => {
            format!("{track}: saved additional embedding {round} for id {person}")
        }
    }
}

fn log_tracks(frame: usize, report: &FrameReport, out: &mut Vec<TrackLog>) {
    for t in &report.tracks {
        out.push(TrackLog {
            frame,
            track: t.track_id.to_string(),
            bbox: [t.tlbr[0], t.tlbr[1], t.tlbr[2], t.tlbr[3]],
            name: t.name.clone(),
            person_id: t.person_id,
            similarity: t.similarity,
            phase: format!("{:?}", t.phase),
            matched: t.matched,
        });
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    let raw = fs::read_to_string(&args.log).with_context(|| format!("reading {}", args.log.display()))?;
    let frames: Vec<FrameLog> = serde_json::from_str(&raw).context("parsing detection log")?;
    info!(frames = frames.len(), log = %args.log.display(), "replaying detection log");

    let store = JsonFileStore::open(&args.store)?;
    let mut recognizer = Recognizer::new(cfg, store, DetectorEmbedding);
    let mut tracking_log = Vec::new();

    for (frame_id, frame) in frames.into_iter().enumerate() {
        let size = (frame.width, frame.height);
        let time = frame.time;
        let detections: Vec<Detection> = frame.detections.into_iter().map(Detection::from).collect();

        let report = recognizer.process_frame(&detections, size, time);
        for event in &report.events {
            println!("[{time:8.3}] {}", describe(event));
        }
        if args.output.is_some() {
            log_tracks(frame_id, &report, &mut tracking_log);
        }
    }

    if let Some(path) = &args.output {
        fs::write(path, serde_json::to_string_pretty(&tracking_log)?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(entries = tracking_log.len(), path = %path.display(), "wrote tracking log");
    }

    let store = recognizer.into_store();
    let active = store.active_person()?;
    println!("\nKnown people:");
    let mut empty = true;
    for (id, person) in store.people() {
        empty = false;
        let marker = if Some(id) == active { " (active)" } else { "" };
        println!("  {id}: {} - {} embeddings{marker}", person.name, person.embedding_count());
    }
    if empty {
        warn!("no faces in store");
    }
    Ok(())
}
