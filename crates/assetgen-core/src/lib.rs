//! assetgen core - run configuration and local model resolution
//!
//! Everything that happens before a model is loaded:
//!
//! - Loading the optional JSON config file and merging it over CLI flags
//! - Extracting prompts from node-graph exports
//! - Layered precedence of defaults, environment, command line and file
//! - Choosing a compute backend and precision
//! - Resolving base models and LoRA adapters to local paths
//! - Listing the shards of a sharded weight index
//!
//! # Precedence
//!
//! ```text
//! Defaults → Environment → Command line → Config file
//! ```
//!
//! The config file wins. Model and LoRA environment variables are a separate
//! fallback used by [`ModelResolver`] when nothing else names a model.

pub mod apply;
pub mod config;
pub mod device;
pub mod env;
pub mod error;
pub mod layers;
pub mod layout;
pub mod loader;
pub mod nodegraph;
pub mod prompts;
pub mod resolve;
pub mod shards;

pub use apply::{ApplyReport, apply_config, apply_node_prompts};
pub use config::{ConfigMap, RunConfiguration};
pub use device::{
    AcceleratorProbe, Backend, DevicePreference, DeviceSelection, Precision, StaticProbe,
    select_device,
};
pub use env::Environment;
pub use error::{ResolveError, Result};
pub use layers::{CliOverrides, ConfigLayer, LayerStack};
pub use layout::Layout;
pub use loader::load_config;
pub use nodegraph::{PromptPair, extract_prompts};
pub use prompts::{Prompts, resolve_prompts};
pub use resolve::{LoraSpec, ModelResolver};
pub use shards::read_shard_index;
