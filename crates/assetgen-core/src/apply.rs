//! Merging a config file onto the run configuration
//!
//! Recognised keys overwrite whatever earlier layers set. Numeric values are
//! coerced the way Python's `int()`/`float()` would; a value that cannot be
//! coerced is skipped and the earlier value stays.

use crate::config::{ConfigMap, RunConfiguration};
use crate::device::DevicePreference;
use crate::nodegraph;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Keys copied from the config file onto [`RunConfiguration`]
pub const RECOGNIZED_KEYS: [&str; 13] = [
    "base_model",
    "lora",
    "lora_weight",
    "device",
    "height",
    "width",
    "steps",
    "guidance_scale",
    "seed",
    "output_dir",
    "filename_prefix",
    "positive_prompt",
    "negative_prompt",
];

/// Adapter list key; copied through without interpretation
pub const LORAS_KEY: &str = "loras";

/// Node-graph export key
pub const NODES_KEY: &str = "nodes";

/// What happened during a merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
}

/// Merge recognised keys from `config` onto `cfg`
pub fn apply_config(cfg: &mut RunConfiguration, config: &ConfigMap) -> ApplyReport {
    let mut report = ApplyReport::default();

    for key in RECOGNIZED_KEYS {
        let Some(value) = config.get(key) else {
            continue;
        };

        if apply_key(cfg, key, value) {
            report.applied.push(key);
        } else {
            warn!(key, %value, "Ignoring config value that cannot be used");
            report.skipped.push(key);
        }
    }

    if let Some(value) = config.get(LORAS_KEY) {
        cfg.loras = Some(value.clone());
        report.applied.push(LORAS_KEY);
    }

    debug!(applied = ?report.applied, skipped = ?report.skipped, "Applied config file");
    report
}

/// Fill still-unset prompt fields from an embedded node graph
pub fn apply_node_prompts(cfg: &mut RunConfiguration, config: &ConfigMap) {
    let Some(Value::Array(nodes)) = config.get(NODES_KEY) else {
        return;
    };

    let found = nodegraph::extract_prompts(nodes);

    if cfg.positive_prompt.is_none() {
        if let Some(positive) = found.positive {
            debug!("Positive prompt taken from node graph");
            cfg.positive_prompt = Some(positive);
        }
    }
    if cfg.negative_prompt.is_none() {
        if let Some(negative) = found.negative {
            debug!("Negative prompt taken from node graph");
            cfg.negative_prompt = Some(negative);
        }
    }
}

fn apply_key(cfg: &mut RunConfiguration, key: &str, value: &Value) -> bool {
    match key {
        "base_model" => set_opt_string(&mut cfg.base_model, value),
        "lora" => set_opt_string(&mut cfg.lora, value),
        "lora_weight" => set_opt_string(&mut cfg.lora_weight, value),
        "positive_prompt" => set_opt_string(&mut cfg.positive_prompt, value),
        "negative_prompt" => set_opt_string(&mut cfg.negative_prompt, value),
        "device" => match value {
            Value::Null => {
                cfg.device = DevicePreference::Auto;
                true
            }
            Value::String(s) => match s.parse() {
                Ok(device) => {
                    cfg.device = device;
                    true
                }
                Err(_) => false,
            },
            _ => false,
        },
        "height" => set_usize(&mut cfg.height, value),
        "width" => set_usize(&mut cfg.width, value),
        "steps" => set_usize(&mut cfg.steps, value),
        "guidance_scale" => match coerce_float(value) {
            Some(g) => {
                cfg.guidance_scale = g;
                true
            }
            None => false,
        },
        "seed" => match value {
            Value::Null => {
                cfg.seed = None;
                true
            }
            other => match coerce_u64(other) {
                Some(seed) => {
                    cfg.seed = Some(seed);
                    true
                }
                None => false,
            },
        },
        "output_dir" => match value {
            Value::String(s) => {
                cfg.output_dir = PathBuf::from(s);
                true
            }
            _ => false,
        },
        "filename_prefix" => match value {
            Value::String(s) => {
                cfg.filename_prefix = s.clone();
                true
            }
            _ => false,
        },
        _ => false,
    }
}

fn set_opt_string(field: &mut Option<String>, value: &Value) -> bool {
    match value {
        Value::Null => {
            *field = None;
            true
        }
        Value::String(s) => {
            *field = Some(s.clone());
            true
        }
        _ => false,
    }
}

fn set_usize(field: &mut usize, value: &Value) -> bool {
    match coerce_int(value).and_then(|i| usize::try_from(i).ok()) {
        Some(v) => {
            *field = v;
            true
        }
        None => false,
    }
}

/// Integer coercion: integers, floats truncated toward zero, numeric strings
/// and booleans
pub fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite())
                .map(|f| f.trunc())
                .filter(|f| *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Float coercion: numbers, numeric strings and booleans
pub fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn coerce_u64(value: &Value) -> Option<u64> {
    if let Some(u) = value.as_u64() {
        return Some(u);
    }
    if let Value::String(s) = value {
        if let Ok(u) = s.trim().parse::<u64>() {
            return Some(u);
        }
    }
    coerce_int(value).and_then(|i| u64::try_from(i).ok())
}
