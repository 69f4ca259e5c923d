//! Resolution errors
//!
//! Everything here is a setup mistake: it is reported once and the run stops.

use crate::device::Backend;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving devices, models and adapters
#[derive(Debug, Error)]
pub enum ResolveError {
    /// An explicitly requested backend is not compiled in or not present
    #[error("{0} requested but not available")]
    DeviceUnavailable(Backend),

    /// A configured base model is neither a local file nor a directory
    #[error(
        "Base model '{0}' not found as a local file or directory. Remote downloads are disabled. \
         Place the model under models/checkpoints/ or provide a valid local path."
    )]
    BaseModelNotFound(String),

    /// The base model environment variable names a missing path
    #[error("{var} points to '{value}', but no file or directory was found")]
    EnvBaseModelMissing { var: &'static str, value: String },

    /// Every base model fallback came up empty
    #[error(
        "No base model configured and no local models found under {checkpoints}. \
         Tried --base-model, {var}, {default_file} and {default_dir}."
    )]
    NoBaseModel {
        var: &'static str,
        checkpoints: PathBuf,
        default_file: PathBuf,
        default_dir: PathBuf,
    },

    /// A LoRA given as a file path does not exist
    #[error("LoRA file '{0}' not found")]
    LoraFileNotFound(String),

    /// A LoRA directory was given without naming the weight file inside it
    #[error("LoRA weight name must be provided when using a repo or directory ('{0}')")]
    LoraWeightRequired(String),

    /// `loras` in the config file is not a JSON array
    #[error("Config field 'loras' must be a list")]
    LorasNotAList,

    /// One `loras` entry is neither a string nor a valid object
    #[error("Invalid LoRA entry at index {index}: {reason}")]
    InvalidLoraEntry { index: usize, reason: String },

    /// A sharded weight index could not be read
    #[error("Cannot read shard index {path}: {source}")]
    ShardIndexUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A sharded weight index is not valid JSON or lacks `weight_map`
    #[error("Invalid shard index {path}: {source}")]
    InvalidShardIndex {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The executable's directory could not be determined
    #[error("Cannot determine program root: {0}")]
    Root(#[from] std::io::Error),
}

/// Result type for resolution
pub type Result<T> = std::result::Result<T, ResolveError>;
