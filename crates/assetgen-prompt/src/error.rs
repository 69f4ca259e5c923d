//! Enhancer errors

use assetgen_core::ResolveError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnhancerError {
    /// The chat model directory is missing or has no weights
    #[error("Language model not found: {0}")]
    ModelNotFound(PathBuf),

    /// `tokenizer.json` failed to load, encode or decode
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// `config.json` failed to parse
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Shared model-file handling from assetgen-core
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Sampling produced no usable output
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Tensor operation or safetensors failure
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EnhancerError>;
