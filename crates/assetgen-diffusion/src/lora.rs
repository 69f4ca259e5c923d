//! LoRA adapter parsing and fusing
//!
//! Adapters are folded into the base weights before modules are built:
//!
//! ```text
//! W' = W + scale * (alpha / rank) * (up @ down)
//! ```
//!
//! Two naming families are understood:
//!
//! - diffusers/PEFT: `unet.<module>.lora_A.weight`, `<module>.lora.down.weight`,
//!   and the older `<attn>.processor.to_q_lora.down.weight`
//! - kohya: `lora_unet_<module_with_underscores>.lora_down.weight`, `lora_te1_*`,
//!   `lora_te2_*` and a per-module `.alpha`
//!
//! Kohya names lose the dots of the module path, so they are matched against
//! the base weight names with dots replaced by underscores. SDXL kohya files
//! usually name UNet modules after the original blocks (`input_blocks_4_1_*`);
//! those are matched through [`crate::ldm::UnetKeyMap`].

use crate::checkpoint::{Component, HostWeights, TensorMap};
use crate::error::{DiffusionError, Result};
use crate::ldm;
use assetgen_core::LoraSpec;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How a LoRA module names its target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ModuleName {
    /// Dotted module path as in the base weights
    Dotted(String),
    /// Kohya module path with `.` flattened to `_`
    Kohya(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    Alpha,
}

#[derive(Default)]
struct PartialModule {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

/// One low-rank update
#[derive(Debug, Clone)]
pub struct LoraModule {
    component: Component,
    name: ModuleName,
    down: Tensor,
    up: Tensor,
    alpha: Option<f64>,
}

impl LoraModule {
    pub fn component(&self) -> Component {
        self.component
    }

    pub fn rank(&self) -> usize {
        self.down.dims().first().copied().unwrap_or(0)
    }

    /// `alpha / rank`, or 1 when no alpha was stored
    fn alpha_ratio(&self) -> f64 {
        match (self.alpha, self.rank()) {
            (Some(alpha), rank) if rank > 0 => alpha / rank as f64,
            _ => 1.0,
        }
    }

    /// The dense update `(alpha / rank) * up @ down` in f32, shaped like the
    /// flattened base weight
    fn delta(&self) -> candle_core::Result<Tensor> {
        let up = self.up.to_dtype(DType::F32)?.flatten_from(1)?;
        let down = self.down.to_dtype(DType::F32)?.flatten_from(1)?;
        up.matmul(&down)? * self.alpha_ratio()
    }
}

/// A parsed adapter file
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    source: PathBuf,
    modules: Vec<LoraModule>,
}

impl LoraAdapter {
    /// Load an adapter from a `.safetensors` file on the host
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DiffusionError::LoraNotFound(path.to_path_buf()));
        }
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        Self::from_tensors(path, tensors)
    }

    /// Group raw tensors into modules
    pub fn from_tensors(source: impl Into<PathBuf>, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let source = source.into();
        let mut partial: HashMap<(Component, ModuleName), PartialModule> = HashMap::new();
        let mut ignored = 0usize;

        for (key, tensor) in tensors {
            let Some((component, name, part)) = parse_key(&key) else {
                ignored += 1;
                continue;
            };
            let entry = partial.entry((component, name)).or_default();
            match part {
                Part::Down => entry.down = Some(tensor),
                Part::Up => entry.up = Some(tensor),
                Part::Alpha => entry.alpha = scalar(&tensor)?,
            }
        }

        let mut modules = Vec::with_capacity(partial.len());
        for ((component, name), p) in partial {
            match (p.down, p.up) {
                (Some(down), Some(up)) => modules.push(LoraModule {
                    component,
                    name,
                    down,
                    up,
                    alpha: p.alpha,
                }),
                _ => ignored += 1,
            }
        }

        if modules.is_empty() {
            return Err(DiffusionError::InvalidLora {
                path: source,
                reason: "no recognisable LoRA up/down pairs".into(),
            });
        }

        if ignored > 0 {
            debug!(source = %source.display(), ignored, "Ignored LoRA tensors");
        }

        Ok(Self { source, modules })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn modules(&self) -> &[LoraModule] {
        &self.modules
    }

    /// Number of modules targeting a component
    pub fn module_count(&self, component: Component) -> usize {
        self.modules.iter().filter(|m| m.component == component).count()
    }
}

/// Outcome of fusing one adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FuseReport {
    pub fused: usize,
    pub unmatched: usize,
}

/// Ordered stack of adapters with their scales
#[derive(Debug, Default)]
pub struct LoraInjector {
    loras: Vec<(LoraAdapter, f64)>,
}

impl LoraInjector {
    pub fn new() -> Self {
        Self { loras: Vec::new() }
    }

    /// Load every resolved adapter in order
    pub fn from_specs(specs: &[LoraSpec]) -> Result<Self> {
        let mut injector = Self::new();
        for spec in specs {
            let path = spec.weight_path();
            if !path.is_file() {
                return Err(DiffusionError::LoraNotFound(path));
            }
            info!(lora = %spec, "Loading LoRA");
            injector.push(LoraAdapter::load(&path)?, spec.scale);
        }
        Ok(injector)
    }

    pub fn push(&mut self, adapter: LoraAdapter, scale: f64) {
        self.loras.push((adapter, scale));
    }

    pub fn len(&self) -> usize {
        self.loras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loras.is_empty()
    }

    /// Fuse every adapter, in order, into the host weights
    pub fn apply(&self, weights: &mut HostWeights) -> Result<Vec<FuseReport>> {
        let mut reports = Vec::with_capacity(self.loras.len());

        for (adapter, scale) in &self.loras {
            let mut report = FuseReport::default();
            for component in [Component::Unet, Component::TextEncoder, Component::TextEncoder2] {
                if adapter.module_count(component) == 0 {
                    continue;
                }
                let r = fuse_component(weights.get_mut(component), component, adapter, *scale)?;
                report.fused += r.fused;
                report.unmatched += r.unmatched;
            }

            if report.unmatched > 0 {
                warn!(
                    source = %adapter.source().display(),
                    unmatched = report.unmatched,
                    "LoRA modules did not match any base weight"
                );
            }
            info!(
                source = %adapter.source().display(),
                fused = report.fused,
                scale,
                "Fused LoRA"
            );
            reports.push(report);
        }

        Ok(reports)
    }
}

/// Fuse the modules of one adapter that target `component`
pub fn fuse_component(
    weights: &mut TensorMap,
    component: Component,
    adapter: &LoraAdapter,
    scale: f64,
) -> Result<FuseReport> {
    let mut kohya_index: HashMap<String, String> = weights
        .keys()
        .filter_map(|k| k.strip_suffix(".weight"))
        .map(|module| (module.replace('.', "_"), format!("{}.weight", module)))
        .collect();
    if component == Component::Unet {
        kohya_index.extend(ldm::kohya_unet_names(weights.keys()));
    }

    let mut report = FuseReport::default();

    for module in adapter.modules().iter().filter(|m| m.component == component) {
        let key = match &module.name {
            ModuleName::Dotted(path) => {
                Some(format!("{}.weight", path)).filter(|k| weights.contains_key(k))
            }
            ModuleName::Kohya(path) => kohya_index.get(path).cloned(),
        };
        let Some(key) = key else {
            report.unmatched += 1;
            continue;
        };
        let Some(base) = weights.get(&key) else {
            report.unmatched += 1;
            continue;
        };

        let delta = module.delta()?;
        if delta.elem_count() != base.elem_count() {
            warn!(
                %component,
                key = %key,
                base = ?base.dims(),
                delta = ?delta.dims(),
                "LoRA shape mismatch, skipping module"
            );
            report.unmatched += 1;
            continue;
        }

        let fused = (base.to_dtype(DType::F32)? + (delta.reshape(base.shape())? * scale)?)?
            .to_dtype(base.dtype())?;
        weights.insert(key, fused);
        report.fused += 1;
    }

    Ok(report)
}

const KOHYA_PREFIXES: [(&str, Component); 4] = [
    ("lora_unet_", Component::Unet),
    ("lora_te1_", Component::TextEncoder),
    ("lora_te2_", Component::TextEncoder2),
    ("lora_te_", Component::TextEncoder),
];

const DOTTED_PREFIXES: [(&str, Component); 4] = [
    ("unet.", Component::Unet),
    ("text_encoder_2.", Component::TextEncoder2),
    ("text_encoder.", Component::TextEncoder),
    ("base_model.model.", Component::Unet),
];

const DOTTED_SUFFIXES: [(&str, Part); 9] = [
    (".lora_A.weight", Part::Down),
    (".lora_B.weight", Part::Up),
    (".lora.down.weight", Part::Down),
    (".lora.up.weight", Part::Up),
    (".lora_down.weight", Part::Down),
    (".lora_up.weight", Part::Up),
    ("_lora.down.weight", Part::Down),
    ("_lora.up.weight", Part::Up),
    (".alpha", Part::Alpha),
];

/// First value of a (usually 0-d) tensor
fn scalar(tensor: &Tensor) -> candle_core::Result<Option<f64>> {
    let values = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Ok(values.first().copied())
}

/// Split a tensor key into target component, module and part
fn parse_key(key: &str) -> Option<(Component, ModuleName, Part)> {
    for (prefix, component) in KOHYA_PREFIXES {
        if let Some(rest) = key.strip_prefix(prefix) {
            let (module, tail) = rest.split_once('.')?;
            let part = match tail {
                "lora_down.weight" => Part::Down,
                "lora_up.weight" => Part::Up,
                "alpha" => Part::Alpha,
                _ => return None,
            };
            return Some((component, ModuleName::Kohya(module.to_string()), part));
        }
    }

    let (component, rest) = DOTTED_PREFIXES
        .iter()
        .find_map(|(prefix, c)| key.strip_prefix(prefix).map(|rest| (*c, rest)))?;

    let (module, part) = DOTTED_SUFFIXES
        .iter()
        .find_map(|(suffix, p)| rest.strip_suffix(suffix).map(|m| (m, *p)))?;

    Some((component, ModuleName::Dotted(processor_target(module)), part))
}

/// `attn1.processor.to_q` → `attn1.to_q`, `attn1.processor.to_out` → `attn1.to_out.0`
fn processor_target(module: &str) -> String {
    let Some((attn, proj)) = module.split_once(".processor.") else {
        return module.to_string();
    };
    if proj == "to_out" {
        format!("{}.to_out.0", attn)
    } else {
        format!("{}.{}", attn, proj)
    }
}
