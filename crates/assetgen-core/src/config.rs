//! Run configuration
//!
//! One [`RunConfiguration`] is built per invocation by the layers in
//! [`crate::layers`] and handed to the resolvers and the pipeline.

use crate::device::DevicePreference;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Parsed JSON config file contents
pub type ConfigMap = Map<String, Value>;

pub const DEFAULT_HEIGHT: usize = 1024;
pub const DEFAULT_WIDTH: usize = 1024;
pub const DEFAULT_STEPS: usize = 4;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 0.0;
pub const DEFAULT_FILENAME_PREFIX: &str = "asset";

/// Settings for a single generation run
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    /// Base model path or name; `None` means "use the fallback chain"
    pub base_model: Option<String>,
    /// Single LoRA location
    pub lora: Option<String>,
    /// Weight file inside `lora` when it is a repository or directory
    pub lora_weight: Option<String>,
    /// Raw `loras` list from the config file; resolved later
    pub loras: Option<Value>,
    pub device: DevicePreference,
    pub height: usize,
    pub width: usize,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
    pub output_dir: PathBuf,
    pub filename_prefix: String,
    pub positive_prompt: Option<String>,
    pub negative_prompt: Option<String>,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            base_model: None,
            lora: None,
            lora_weight: None,
            loras: None,
            device: DevicePreference::Auto,
            height: DEFAULT_HEIGHT,
            width: DEFAULT_WIDTH,
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: None,
            output_dir: PathBuf::from(crate::layout::OUTPUTS_DIR),
            filename_prefix: DEFAULT_FILENAME_PREFIX.to_string(),
            positive_prompt: None,
            negative_prompt: None,
        }
    }
}

impl RunConfiguration {
    /// Whether a `loras` list was supplied (a JSON `null` counts as absent)
    pub fn has_lora_list(&self) -> bool {
        self.loras.as_ref().is_some_and(|v| !v.is_null())
    }

    /// Output image path for the given unix timestamp
    pub fn output_file(&self, timestamp: u64) -> PathBuf {
        output_file(&self.output_dir, &self.filename_prefix, timestamp)
    }
}

/// `<dir>/<prefix>_<timestamp>.png`
pub fn output_file(dir: &Path, prefix: &str, timestamp: u64) -> PathBuf {
    dir.join(format!("{}_{}.png", prefix, timestamp))
}
