use std::path::PathBuf;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while turning an audio file into a feature vector.
///
/// No partial vector is ever produced: every stage either succeeds or
/// returns one of these.
#[derive(Debug, Error)]
pub enum FeatureExtractionError {
    #[error("empty or silent audio")]
    EmptyAudio,

    #[error("failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("resampling failed: {0}")]
    Resample(#[source] BoxError),

    #[error("need at least {required} analysis frames, got {frames}")]
    TooFewFrames { frames: usize, required: usize },

    #[error("non-finite value at feature index {index}")]
    NonFinite { index: usize },

    #[error("invalid feature configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised by model fitting, persistence and prediction.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no trained model at {0}")]
    Unavailable(PathBuf),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("unsupported artifact version {0}")]
    UnsupportedVersion(u32),

    #[error("cannot fit on an empty training set")]
    EmptyTrainingSet,

    #[error("artifact i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact encoding: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("model backend: {0}")]
    Backend(String),
}

/// Errors that abort a whole training run.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("no usable samples in {real} or {fake}")]
    EmptyDataset { real: PathBuf, fake: PathBuf },

    #[error("failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Errors raised while writing augmented copies of one source clip.
#[derive(Debug, Error)]
pub enum AugmentError {
    #[error(transparent)]
    Audio(#[from] FeatureExtractionError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
