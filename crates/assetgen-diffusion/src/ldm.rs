//! Original (LDM) SDXL key layout
//!
//! Published SDXL single files keep the names of the original training code:
//!
//! ```text
//! model.diffusion_model.*                  UNet
//! conditioner.embedders.0.transformer.*    CLIP ViT-L (already in HF naming)
//! conditioner.embedders.1.model.*          OpenCLIP ViT-bigG
//! first_stage_model.*                      VAE
//! ```
//!
//! Every tensor is renamed to the diffusers layout the models are built from.
//! OpenCLIP's fused attention projection is split into q/k/v, and the VAE's
//! 1x1 attention convolutions become linear weights.
//!
//! Kohya LoRA files name UNet modules after the same original blocks, so the
//! UNet mapping is also used in reverse to match them.

use crate::checkpoint::{Component, HostWeights};
use crate::error::Result;
use candle_core::Tensor;
use std::collections::HashMap;
use tracing::debug;

pub const UNET_PREFIX: &str = "model.diffusion_model.";
pub const CLIP_L_PREFIX: &str = "conditioner.embedders.0.transformer.";
pub const CLIP_G_PREFIX: &str = "conditioner.embedders.1.model.";
pub const VAE_PREFIX: &str = "first_stage_model.";

const PREFIXES: [&str; 4] = [UNET_PREFIX, CLIP_L_PREFIX, CLIP_G_PREFIX, VAE_PREFIX];

/// Attention per SDXL down block; up blocks use the reverse
const DOWN_ATTENTION: [bool; 3] = [false, true, true];
const LAYERS_PER_BLOCK: usize = 2;
const VAE_BLOCKS: usize = 4;

/// Resnet sub-module names, original → diffusers
const RESNET_RENAMES: [(&str, &str); 6] = [
    ("in_layers.0.", "norm1."),
    ("in_layers.2.", "conv1."),
    ("emb_layers.1.", "time_emb_proj."),
    ("out_layers.0.", "norm2."),
    ("out_layers.3.", "conv2."),
    ("skip_connection.", "conv_shortcut."),
];

/// Whether a key belongs to the original layout
pub fn is_ldm_key(key: &str) -> bool {
    PREFIXES.iter().any(|p| key.starts_with(p))
}

struct BlockRename {
    ldm: String,
    diffusers: String,
    resnet: bool,
}

/// Block-level renames between original and diffusers SDXL UNet names
pub struct UnetKeyMap {
    blocks: Vec<BlockRename>,
}

impl UnetKeyMap {
    pub fn sdxl() -> Self {
        let mut blocks = Vec::new();
        let mut add = |ldm: String, diffusers: String, resnet: bool| {
            blocks.push(BlockRename {
                ldm,
                diffusers,
                resnet,
            })
        };

        add("input_blocks.0.0.".into(), "conv_in.".into(), false);
        add("time_embed.0.".into(), "time_embedding.linear_1.".into(), false);
        add("time_embed.2.".into(), "time_embedding.linear_2.".into(), false);
        add("label_emb.0.0.".into(), "add_embedding.linear_1.".into(), false);
        add("label_emb.0.2.".into(), "add_embedding.linear_2.".into(), false);
        add("out.0.".into(), "conv_norm_out.".into(), false);
        add("out.2.".into(), "conv_out.".into(), false);

        let last = DOWN_ATTENTION.len() - 1;
        for (i, &attn) in DOWN_ATTENTION.iter().enumerate() {
            for j in 0..LAYERS_PER_BLOCK {
                let n = (LAYERS_PER_BLOCK + 1) * i + j + 1;
                add(
                    format!("input_blocks.{n}.0."),
                    format!("down_blocks.{i}.resnets.{j}."),
                    true,
                );
                if attn {
                    add(
                        format!("input_blocks.{n}.1."),
                        format!("down_blocks.{i}.attentions.{j}."),
                        false,
                    );
                }
            }
            if i < last {
                add(
                    format!("input_blocks.{}.0.op.", (LAYERS_PER_BLOCK + 1) * (i + 1)),
                    format!("down_blocks.{i}.downsamplers.0.conv."),
                    false,
                );
            }
        }

        add("middle_block.0.".into(), "mid_block.resnets.0.".into(), true);
        add("middle_block.1.".into(), "mid_block.attentions.0.".into(), false);
        add("middle_block.2.".into(), "mid_block.resnets.1.".into(), true);

        for (i, &attn) in DOWN_ATTENTION.iter().rev().enumerate() {
            for j in 0..=LAYERS_PER_BLOCK {
                let n = (LAYERS_PER_BLOCK + 1) * i + j;
                add(
                    format!("output_blocks.{n}.0."),
                    format!("up_blocks.{i}.resnets.{j}."),
                    true,
                );
                if attn {
                    add(
                        format!("output_blocks.{n}.1."),
                        format!("up_blocks.{i}.attentions.{j}."),
                        false,
                    );
                }
            }
            if i < last {
                let n = (LAYERS_PER_BLOCK + 1) * i + LAYERS_PER_BLOCK;
                let slot = if attn { 2 } else { 1 };
                add(
                    format!("output_blocks.{n}.{slot}.conv."),
                    format!("up_blocks.{i}.upsamplers.0.conv."),
                    false,
                );
            }
        }

        Self { blocks }
    }

    /// Original UNet key (without `model.diffusion_model.`) → diffusers key
    pub fn to_diffusers(&self, key: &str) -> Option<String> {
        self.blocks.iter().find_map(|b| {
            let rest = key.strip_prefix(b.ldm.as_str())?;
            let rest = if b.resnet {
                rename_prefix(rest, RESNET_RENAMES.iter().map(|(l, d)| (*l, *d)))
            } else {
                rest.to_string()
            };
            Some(format!("{}{}", b.diffusers, rest))
        })
    }

    /// Diffusers UNet key → original key
    pub fn to_ldm(&self, key: &str) -> Option<String> {
        self.blocks.iter().find_map(|b| {
            let rest = key.strip_prefix(b.diffusers.as_str())?;
            let rest = if b.resnet {
                rename_prefix(rest, RESNET_RENAMES.iter().map(|(l, d)| (*d, *l)))
            } else {
                rest.to_string()
            };
            Some(format!("{}{}", b.ldm, rest))
        })
    }
}

fn rename_prefix<'a>(key: &str, renames: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    renames
        .into_iter()
        .find_map(|(from, to)| key.strip_prefix(from).map(|rest| format!("{}{}", to, rest)))
        .unwrap_or_else(|| key.to_string())
}

/// Original VAE key (without `first_stage_model.`) → diffusers key
pub fn vae_key(key: &str) -> String {
    let parts: Vec<&str> = key.split('.').collect();
    let joined = |rest: &[&str]| rest.join(".");

    match parts.as_slice() {
        [side, "down", i, "block", j, rest @ ..] => {
            format!("{side}.down_blocks.{i}.resnets.{j}.{}", vae_resnet(rest))
        }
        [side, "down", i, "downsample", "conv", rest @ ..] => {
            format!("{side}.down_blocks.{i}.downsamplers.0.conv.{}", joined(rest))
        }
        [side, "up", i, "block", j, rest @ ..] => {
            format!("{side}.up_blocks.{}.resnets.{j}.{}", vae_up_index(i), vae_resnet(rest))
        }
        [side, "up", i, "upsample", "conv", rest @ ..] => {
            format!("{side}.up_blocks.{}.upsamplers.0.conv.{}", vae_up_index(i), joined(rest))
        }
        [side, "mid", "block_1", rest @ ..] => {
            format!("{side}.mid_block.resnets.0.{}", vae_resnet(rest))
        }
        [side, "mid", "block_2", rest @ ..] => {
            format!("{side}.mid_block.resnets.1.{}", vae_resnet(rest))
        }
        [side, "mid", "attn_1", module, rest @ ..] => {
            let module = match *module {
                "norm" => "group_norm",
                "q" => "to_q",
                "k" => "to_k",
                "v" => "to_v",
                "proj_out" => "to_out.0",
                other => other,
            };
            format!("{side}.mid_block.attentions.0.{module}.{}", joined(rest))
        }
        [side, "norm_out", rest @ ..] => format!("{side}.conv_norm_out.{}", joined(rest)),
        _ => key.to_string(),
    }
}

/// Original up blocks count from the lowest resolution
fn vae_up_index(i: &str) -> String {
    match i.parse::<usize>() {
        Ok(i) if i < VAE_BLOCKS => (VAE_BLOCKS - 1 - i).to_string(),
        _ => i.to_string(),
    }
}

fn vae_resnet(rest: &[&str]) -> String {
    match rest {
        ["nin_shortcut", tail @ ..] => format!("conv_shortcut.{}", tail.join(".")),
        _ => rest.join("."),
    }
}

/// Whether a converted VAE key is an attention projection stored as a 1x1 conv
fn is_vae_attention_projection(key: &str) -> bool {
    key.contains(".mid_block.attentions.0.")
        && ["to_q.weight", "to_k.weight", "to_v.weight", "to_out.0.weight"]
            .iter()
            .any(|s| key.ends_with(s))
}

/// OpenCLIP bigG tensor (without `conditioner.embedders.1.model.`) → diffusers
/// CLIP tensors; the fused attention projection yields three
pub fn open_clip_tensors(key: &str, tensor: Tensor) -> Result<Vec<(String, Tensor)>> {
    fn single(name: String, t: Tensor) -> Result<Vec<(String, Tensor)>> {
        Ok(vec![(name, t)])
    }

    match key {
        "positional_embedding" => single("text_model.embeddings.position_embedding.weight".into(), tensor),
        "token_embedding.weight" => single("text_model.embeddings.token_embedding.weight".into(), tensor),
        "text_projection" => single("text_projection.weight".into(), tensor.t()?.contiguous()?),
        "logit_scale" => Ok(Vec::new()),
        _ => {
            if let Some(rest) = key.strip_prefix("ln_final.") {
                return single(format!("text_model.final_layer_norm.{}", rest), tensor);
            }
            let Some(rest) = key.strip_prefix("transformer.resblocks.") else {
                return Ok(Vec::new());
            };
            let Some((layer, rest)) = rest.split_once('.') else {
                return Ok(Vec::new());
            };
            let base = format!("text_model.encoder.layers.{}", layer);

            let split_kind = match rest {
                "attn.in_proj_weight" => Some("weight"),
                "attn.in_proj_bias" => Some("bias"),
                _ => None,
            };
            if let Some(kind) = split_kind {
                let width = tensor.dim(0)? / 3;
                return ["q_proj", "k_proj", "v_proj"]
                    .iter()
                    .enumerate()
                    .map(|(n, proj)| -> Result<(String, Tensor)> {
                        let part = tensor.narrow(0, n * width, width)?.contiguous()?;
                        Ok((format!("{base}.self_attn.{proj}.{kind}"), part))
                    })
                    .collect();
            }

            let renamed = rename_prefix(
                rest,
                [
                    ("ln_1.", "layer_norm1."),
                    ("ln_2.", "layer_norm2."),
                    ("mlp.c_fc.", "mlp.fc1."),
                    ("mlp.c_proj.", "mlp.fc2."),
                    ("attn.out_proj.", "self_attn.out_proj."),
                ],
            );
            single(format!("{base}.{renamed}"), tensor)
        }
    }
}

/// Rename every tensor of an original-layout checkpoint into host weights
pub fn convert_checkpoint(tensors: HashMap<String, Tensor>) -> Result<HostWeights> {
    let unet_map = UnetKeyMap::sdxl();
    let mut weights = HostWeights::default();
    let mut dropped = 0usize;

    for (key, tensor) in tensors {
        if let Some(rest) = key.strip_prefix(UNET_PREFIX) {
            match unet_map.to_diffusers(rest) {
                Some(name) => {
                    weights.unet.insert(name, tensor);
                }
                None => dropped += 1,
            }
        } else if let Some(rest) = key.strip_prefix(CLIP_L_PREFIX) {
            weights.text_encoder.insert(rest.to_string(), tensor);
        } else if let Some(rest) = key.strip_prefix(CLIP_G_PREFIX) {
            let converted = open_clip_tensors(rest, tensor)?;
            if converted.is_empty() {
                dropped += 1;
            }
            weights.text_encoder_2.extend(converted);
        } else if let Some(rest) = key.strip_prefix(VAE_PREFIX) {
            let name = vae_key(rest);
            let tensor = if is_vae_attention_projection(&name) && tensor.rank() == 4 {
                tensor.flatten_from(1)?
            } else {
                tensor
            };
            weights.vae.insert(name, tensor);
        } else {
            dropped += 1;
        }
    }

    for component in Component::ALL {
        debug!(%component, tensors = weights.get(component).len(), "Converted original layout");
    }
    if dropped > 0 {
        debug!(dropped, "Dropped tensors without a diffusers counterpart");
    }
    Ok(weights)
}

/// Kohya module name (`.` flattened to `_`) for each diffusers UNet weight
pub fn kohya_unet_names<'a>(keys: impl Iterator<Item = &'a String>) -> TensorNameIndex {
    let map = UnetKeyMap::sdxl();
    keys.filter_map(|key| {
        let ldm = map.to_ldm(key)?;
        let module = ldm.strip_suffix(".weight")?;
        Some((module.replace('.', "_"), key.clone()))
    })
    .collect()
}

/// Flattened module name → base weight key
pub type TensorNameIndex = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_unet_block_mapping() {
        let map = UnetKeyMap::sdxl();
        let cases = [
            ("input_blocks.0.0.weight", "conv_in.weight"),
            ("time_embed.2.bias", "time_embedding.linear_2.bias"),
            ("label_emb.0.0.weight", "add_embedding.linear_1.weight"),
            ("input_blocks.1.0.in_layers.0.weight", "down_blocks.0.resnets.0.norm1.weight"),
            ("input_blocks.3.0.op.weight", "down_blocks.0.downsamplers.0.conv.weight"),
            (
                "input_blocks.4.1.transformer_blocks.0.attn1.to_q.weight",
                "down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_q.weight",
            ),
            ("input_blocks.4.0.skip_connection.bias", "down_blocks.1.resnets.0.conv_shortcut.bias"),
            ("input_blocks.8.1.proj_out.weight", "down_blocks.2.attentions.1.proj_out.weight"),
            ("middle_block.2.out_layers.3.weight", "mid_block.resnets.1.conv2.weight"),
            ("middle_block.1.norm.weight", "mid_block.attentions.0.norm.weight"),
            ("output_blocks.0.0.emb_layers.1.weight", "up_blocks.0.resnets.0.time_emb_proj.weight"),
            ("output_blocks.2.2.conv.weight", "up_blocks.0.upsamplers.0.conv.weight"),
            ("output_blocks.5.1.proj_in.bias", "up_blocks.1.attentions.2.proj_in.bias"),
            ("output_blocks.5.2.conv.bias", "up_blocks.1.upsamplers.0.conv.bias"),
            ("output_blocks.8.0.out_layers.0.bias", "up_blocks.2.resnets.2.norm2.bias"),
            ("out.0.weight", "conv_norm_out.weight"),
            ("out.2.bias", "conv_out.bias"),
        ];

        for (ldm, diffusers) in cases {
            assert_eq!(map.to_diffusers(ldm).as_deref(), Some(diffusers), "{}", ldm);
            assert_eq!(map.to_ldm(diffusers).as_deref(), Some(ldm), "{}", diffusers);
        }
    }

    #[test]
    fn test_blocks_without_attention_have_no_mapping() {
        let map = UnetKeyMap::sdxl();
        assert_eq!(map.to_diffusers("input_blocks.1.1.norm.weight"), None);
        assert_eq!(map.to_diffusers("output_blocks.8.1.norm.weight"), None);
        assert_eq!(map.to_ldm("up_blocks.2.upsamplers.0.conv.weight"), None);
    }

    #[test]
    fn test_vae_keys() {
        let cases = [
            ("encoder.conv_in.weight", "encoder.conv_in.weight"),
            ("encoder.down.1.block.0.nin_shortcut.weight", "encoder.down_blocks.1.resnets.0.conv_shortcut.weight"),
            ("encoder.down.0.downsample.conv.bias", "encoder.down_blocks.0.downsamplers.0.conv.bias"),
            ("decoder.up.3.block.2.norm1.weight", "decoder.up_blocks.0.resnets.2.norm1.weight"),
            ("decoder.up.1.upsample.conv.weight", "decoder.up_blocks.2.upsamplers.0.conv.weight"),
            ("decoder.mid.block_2.conv1.bias", "decoder.mid_block.resnets.1.conv1.bias"),
            ("encoder.mid.attn_1.norm.weight", "encoder.mid_block.attentions.0.group_norm.weight"),
            ("encoder.mid.attn_1.proj_out.weight", "encoder.mid_block.attentions.0.to_out.0.weight"),
            ("decoder.norm_out.bias", "decoder.conv_norm_out.bias"),
            ("post_quant_conv.weight", "post_quant_conv.weight"),
        ];
        for (ldm, diffusers) in cases {
            assert_eq!(vae_key(ldm), diffusers);
        }
    }

    #[test]
    fn test_open_clip_in_proj_split() {
        let fused = Tensor::arange(0f32, 12., &Device::Cpu)
            .unwrap()
            .reshape((6, 2))
            .unwrap();
        let parts = open_clip_tensors("transformer.resblocks.3.attn.in_proj_weight", fused).unwrap();

        let names: Vec<&str> = parts.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "text_model.encoder.layers.3.self_attn.q_proj.weight",
                "text_model.encoder.layers.3.self_attn.k_proj.weight",
                "text_model.encoder.layers.3.self_attn.v_proj.weight",
            ]
        );
        let v: Vec<f32> = parts[2].1.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![8., 9., 10., 11.]);
    }

    #[test]
    fn test_open_clip_renames() {
        let t = || Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let one = |key: &str| {
            let out = open_clip_tensors(key, t()).unwrap();
            assert_eq!(out.len(), 1, "{}", key);
            out.into_iter().next().unwrap()
        };

        assert_eq!(one("ln_final.weight").0, "text_model.final_layer_norm.weight");
        assert_eq!(one("transformer.resblocks.0.mlp.c_fc.bias").0, "text_model.encoder.layers.0.mlp.fc1.bias");
        assert_eq!(
            one("transformer.resblocks.31.attn.out_proj.weight").0,
            "text_model.encoder.layers.31.self_attn.out_proj.weight"
        );
        assert_eq!(one("transformer.resblocks.2.ln_2.bias").0, "text_model.encoder.layers.2.layer_norm2.bias");

        let (name, projection) = one("text_projection");
        assert_eq!(name, "text_projection.weight");
        assert_eq!(projection.dims(), &[3, 2]);

        assert!(open_clip_tensors("logit_scale", t()).unwrap().is_empty());
    }

    #[test]
    fn test_kohya_names_from_original_blocks() {
        let keys = vec![
            "down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_q.weight".to_string(),
            "up_blocks.0.resnets.1.conv1.weight".to_string(),
            "conv_in.bias".to_string(),
        ];
        let index = kohya_unet_names(keys.iter());

        assert_eq!(
            index.get("input_blocks_4_1_transformer_blocks_0_attn1_to_q").map(String::as_str),
            Some("down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_q.weight")
        );
        assert_eq!(
            index.get("output_blocks_1_0_in_layers_2").map(String::as_str),
            Some("up_blocks.0.resnets.1.conv1.weight")
        );
        assert_eq!(index.len(), 2);
    }
}
