//! Fixed filesystem layout
//!
//! ```text
//! <root>/
//! ├── pipeline.json
//! ├── models/
//! │   ├── checkpoints/
//! │   ├── loras/
//! │   ├── tokenizers/
//! │   └── llm/
//! │       └── tinyllama-1.1b-chat/
//! └── outputs/
//! ```

use crate::env::{ENV_ROOT, Environment};
use crate::error::Result;
use std::path::{Path, PathBuf};

pub const MODELS_DIR: &str = "models";
pub const CHECKPOINTS_DIR: &str = "checkpoints";
pub const LORAS_DIR: &str = "loras";
pub const TOKENIZERS_DIR: &str = "tokenizers";
pub const LLM_DIR: &str = "llm";
pub const OUTPUTS_DIR: &str = "outputs";
pub const DEFAULT_CONFIG_FILE: &str = "pipeline.json";

/// Single-file checkpoint tried when nothing else is configured
pub const DEFAULT_CHECKPOINT_FILE: &str = "base_checkpoint.safetensors";
/// Diffusers directory tried after [`DEFAULT_CHECKPOINT_FILE`]
pub const DEFAULT_CHECKPOINT_DIR: &str = "sdxl-base-example";

/// Chat model used by the prompt enhancer
pub const DEFAULT_LLM_DIR: &str = "tinyllama-1.1b-chat";

/// Extension of adapter and checkpoint weight files
pub const SAFETENSORS_EXT: &str = "safetensors";

/// Directory layout rooted at the program directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Create a layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `ASSET_TTI_ROOT`, else the current working directory
    pub fn discover(env: &Environment) -> Result<Self> {
        match env.non_empty(ENV_ROOT) {
            Some(root) => Ok(Self::new(root)),
            None => Ok(Self::new(std::env::current_dir()?)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(MODELS_DIR)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.models_dir().join(CHECKPOINTS_DIR)
    }

    pub fn loras_dir(&self) -> PathBuf {
        self.models_dir().join(LORAS_DIR)
    }

    pub fn tokenizers_dir(&self) -> PathBuf {
        self.models_dir().join(TOKENIZERS_DIR)
    }

    pub fn llm_dir(&self) -> PathBuf {
        self.models_dir().join(LLM_DIR)
    }

    pub fn default_llm_dir(&self) -> PathBuf {
        self.llm_dir().join(DEFAULT_LLM_DIR)
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join(OUTPUTS_DIR)
    }

    pub fn default_config_path(&self) -> PathBuf {
        self.root.join(DEFAULT_CONFIG_FILE)
    }

    pub fn default_checkpoint_file(&self) -> PathBuf {
        self.checkpoints_dir().join(DEFAULT_CHECKPOINT_FILE)
    }

    pub fn default_checkpoint_dir(&self) -> PathBuf {
        self.checkpoints_dir().join(DEFAULT_CHECKPOINT_DIR)
    }
}
