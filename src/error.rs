use thiserror::Error;

use crate::store::StoreError;
use crate::track::TrackId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(&'static str),

    #[error("invalid face crop: {0}")]
    InvalidCrop(&'static str),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("unknown track {0}")]
    UnknownTrack(TrackId),

    #[error("embedding store: {0}")]
    Store(#[from] StoreError),

    #[error("feature extractor: {0}")]
    Extractor(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
