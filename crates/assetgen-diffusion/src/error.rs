//! Pipeline errors

use assetgen_core::ResolveError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building or running the diffusion pipeline
#[derive(Debug, Error)]
pub enum DiffusionError {
    /// The resolved base model path vanished before loading
    #[error("Model not found: {0}")]
    ModelNotFound(PathBuf),

    /// A single file whose tensor names match no known layout
    #[error("Unsupported checkpoint {path}: {reason}")]
    UnsupportedCheckpoint { path: PathBuf, reason: String },

    /// A required pipeline component has no weights
    #[error("No {component} weights found in {path}")]
    MissingComponent {
        component: &'static str,
        path: PathBuf,
    },

    /// A resolved LoRA path does not exist
    #[error("LoRA weights not found: {0}")]
    LoraNotFound(PathBuf),

    /// LoRA tensors are malformed or do not fit the base weights
    #[error("Invalid LoRA file {path}: {reason}")]
    InvalidLora { path: PathBuf, reason: String },

    /// No local tokenizer, or it failed to load or encode
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Width or height unusable by the VAE
    #[error("Image dimensions must be positive multiples of 8, got {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    /// A model JSON file failed to parse
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Shared model-file handling from assetgen-core
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Tensor operation or safetensors failure
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// PNG encoding or writing failed
    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, DiffusionError>;
