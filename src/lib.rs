pub mod config;
pub mod detection;
pub mod error;
pub mod matcher;
pub mod quality;
pub mod recognizer;
pub mod store;
pub mod threshold;
pub mod track;
pub mod tracker;
pub mod utils;

// Re-export main types
pub use crate::config::Config;
pub use crate::detection::{Detection, FeatureExtractor};
pub use crate::error::{Error, Result};
pub use crate::matcher::{IdentityMatcher, MatchCandidate};
pub use crate::recognizer::Recognizer;
pub use crate::store::{EmbeddingStore, PersonId};
pub use crate::track::{Track, TrackId};
pub use crate::tracker::FaceTracker;
