//! Local checkpoint layouts
//!
//! A base model is either a single `.safetensors` file, or a diffusers
//! directory:
//!
//! ```text
//! model/
//! ├── scheduler/scheduler_config.json
//! ├── tokenizer/tokenizer.json
//! ├── tokenizer_2/tokenizer.json
//! ├── text_encoder/model[.fp16].safetensors
//! ├── text_encoder_2/model[.fp16].safetensors
//! ├── unet/diffusion_pytorch_model[.fp16].safetensors
//! └── vae/diffusion_pytorch_model[.fp16].safetensors
//! ```
//!
//! A single file holds every component either under diffusers prefixes
//! (`unet.`, `text_encoder.`, `text_encoder_2.`, `vae.`) or in the original
//! layout, which is renamed by [`crate::ldm`].
//!
//! Component weights are read into host memory so adapters can be fused
//! before any module is built.

use crate::error::{DiffusionError, Result};
use crate::ldm;
use assetgen_core::{Layout, read_shard_index};
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Weight variant suffix preferred for half precision
pub const FP16_VARIANT: &str = "fp16";

/// Fallback tokenizer for the first text encoder, under `models/tokenizers`
pub const CLIP_L_TOKENIZER_DIR: &str = "clip-vit-large-patch14";
/// Fallback tokenizer for the second text encoder, under `models/tokenizers`
pub const CLIP_G_TOKENIZER_DIR: &str = "clip-vit-bigg-14";

const TOKENIZER_FILE: &str = "tokenizer.json";
const SCHEDULER_CONFIG: &str = "scheduler/scheduler_config.json";

/// Host tensors of one component, keyed without the component prefix
pub type TensorMap = HashMap<String, Tensor>;

/// SDXL pipeline component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Unet,
    TextEncoder,
    TextEncoder2,
    Vae,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Unet,
        Component::TextEncoder,
        Component::TextEncoder2,
        Component::Vae,
    ];

    /// Subdirectory in a diffusers layout
    pub fn dir_name(&self) -> &'static str {
        match self {
            Component::Unet => "unet",
            Component::TextEncoder => "text_encoder",
            Component::TextEncoder2 => "text_encoder_2",
            Component::Vae => "vae",
        }
    }

    /// Key prefix in a single-file checkpoint
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Component::Unet => "unet.",
            Component::TextEncoder => "text_encoder.",
            Component::TextEncoder2 => "text_encoder_2.",
            Component::Vae => "vae.",
        }
    }

    fn weight_stem(&self) -> &'static str {
        match self {
            Component::Unet | Component::Vae => "diffusion_pytorch_model",
            Component::TextEncoder | Component::TextEncoder2 => "model",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Host-resident weights of all four components
#[derive(Debug, Default)]
pub struct HostWeights {
    pub unet: TensorMap,
    pub text_encoder: TensorMap,
    pub text_encoder_2: TensorMap,
    pub vae: TensorMap,
}

impl HostWeights {
    pub fn get(&self, component: Component) -> &TensorMap {
        match component {
            Component::Unet => &self.unet,
            Component::TextEncoder => &self.text_encoder,
            Component::TextEncoder2 => &self.text_encoder_2,
            Component::Vae => &self.vae,
        }
    }

    pub fn get_mut(&mut self, component: Component) -> &mut TensorMap {
        match component {
            Component::Unet => &mut self.unet,
            Component::TextEncoder => &mut self.text_encoder,
            Component::TextEncoder2 => &mut self.text_encoder_2,
            Component::Vae => &mut self.vae,
        }
    }
}

/// Key naming of a single-file checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SingleFileLayout {
    Diffusers,
    Original,
}

/// Where a base model lives on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSource {
    SingleFile(PathBuf),
    Diffusers(PathBuf),
}

impl CheckpointSource {
    /// Classify a local path; anything else is an error since nothing is
    /// downloaded
    pub fn detect(path: &Path) -> Result<Self> {
        if path.is_file() {
            Ok(Self::SingleFile(path.to_path_buf()))
        } else if path.is_dir() {
            Ok(Self::Diffusers(path.to_path_buf()))
        } else {
            Err(DiffusionError::ModelNotFound(path.to_path_buf()))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::SingleFile(p) | Self::Diffusers(p) => p,
        }
    }

    /// Weight files for one component of a diffusers layout.
    ///
    /// With `prefer_fp16` the `fp16` variant wins when present. A sharded
    /// checkpoint is read through its `.index.json`.
    pub fn component_files(&self, component: Component, prefer_fp16: bool) -> Result<Vec<PathBuf>> {
        let Self::Diffusers(root) = self else {
            return Ok(vec![self.path().to_path_buf()]);
        };

        let dir = root.join(component.dir_name());
        let stem = component.weight_stem();

        let mut names = Vec::with_capacity(2);
        if prefer_fp16 {
            names.push(format!("{}.{}.safetensors", stem, FP16_VARIANT));
        }
        names.push(format!("{}.safetensors", stem));

        for name in &names {
            let file = dir.join(name);
            if file.is_file() {
                return Ok(vec![file]);
            }
            let index = dir.join(format!("{}.index.json", name));
            if index.is_file() {
                return Ok(read_shard_index(&index)?);
            }
        }

        Err(DiffusionError::MissingComponent {
            component: component.dir_name(),
            path: dir,
        })
    }

    /// Read all component weights into host memory
    pub fn load_host_weights(&self, prefer_fp16: bool) -> Result<HostWeights> {
        let mut weights = HostWeights::default();

        match self {
            Self::SingleFile(file) => {
                info!(path = %file.display(), "Loading single-file checkpoint");
                let all = candle_core::safetensors::load(file, &Device::Cpu)?;

                match single_file_layout(file, all.keys().map(String::as_str))? {
                    SingleFileLayout::Diffusers => {
                        for (key, tensor) in all {
                            let Some(component) = Component::ALL
                                .into_iter()
                                .find(|c| key.starts_with(c.key_prefix()))
                            else {
                                continue;
                            };
                            let name = key[component.key_prefix().len()..].to_string();
                            weights.get_mut(component).insert(name, tensor);
                        }
                    }
                    SingleFileLayout::Original => {
                        info!("Converting original key layout to diffusers names");
                        weights = ldm::convert_checkpoint(all)?;
                    }
                }

                for component in Component::ALL {
                    if weights.get(component).is_empty() {
                        return Err(DiffusionError::MissingComponent {
                            component: component.dir_name(),
                            path: file.clone(),
                        });
                    }
                }
            }
            Self::Diffusers(root) => {
                info!(path = %root.display(), "Loading diffusers checkpoint");
                for component in Component::ALL {
                    let files = self.component_files(component, prefer_fp16)?;
                    let map = weights.get_mut(component);
                    for file in &files {
                        debug!(%component, file = %file.display(), "Reading weights");
                        map.extend(candle_core::safetensors::load(file, &Device::Cpu)?);
                    }
                }
            }
        }

        Ok(weights)
    }

    /// `scheduler/scheduler_config.json` of a diffusers layout, if present
    pub fn scheduler_config(&self) -> Option<PathBuf> {
        match self {
            Self::Diffusers(root) => Some(root.join(SCHEDULER_CONFIG)).filter(|p| p.is_file()),
            Self::SingleFile(_) => None,
        }
    }

    /// Local tokenizer for a text encoder.
    ///
    /// Looks in the model's own `tokenizer{,_2}` directory first, then in
    /// `models/tokenizers/`.
    pub fn tokenizer_file(&self, layout: &Layout, encoder: Component) -> Result<PathBuf> {
        let (own_dir, shared) = match encoder {
            Component::TextEncoder2 => ("tokenizer_2", [CLIP_G_TOKENIZER_DIR, CLIP_L_TOKENIZER_DIR]),
            _ => ("tokenizer", [CLIP_L_TOKENIZER_DIR, CLIP_G_TOKENIZER_DIR]),
        };

        let mut candidates = Vec::with_capacity(3);
        if let Self::Diffusers(root) = self {
            candidates.push(root.join(own_dir).join(TOKENIZER_FILE));
        }
        for dir in shared {
            candidates.push(layout.tokenizers_dir().join(dir).join(TOKENIZER_FILE));
        }

        candidates
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| {
                DiffusionError::Tokenizer(format!(
                    "no local {} found for {} (looked in the model directory and {})",
                    TOKENIZER_FILE,
                    encoder,
                    layout.tokenizers_dir().display()
                ))
            })
    }
}

/// Diffusers prefixes win when a file mixes both layouts
fn single_file_layout<'a>(path: &Path, keys: impl Iterator<Item = &'a str>) -> Result<SingleFileLayout> {
    let mut has_original = false;

    for key in keys {
        if Component::ALL.iter().any(|c| key.starts_with(c.key_prefix())) {
            return Ok(SingleFileLayout::Diffusers);
        }
        has_original |= ldm::is_ldm_key(key);
    }

    if has_original {
        Ok(SingleFileLayout::Original)
    } else {
        Err(DiffusionError::UnsupportedCheckpoint {
            path: path.to_path_buf(),
            reason: "no unet/text_encoder/text_encoder_2/vae tensors".into(),
        })
    }
}
