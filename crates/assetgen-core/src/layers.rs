//! Layered configuration precedence
//!
//! A [`LayerStack`] applies an ordered list of sources to one
//! [`RunConfiguration`]. Later layers win. The standard order is
//!
//! ```text
//! Defaults → Environment → Command line → Config file
//! ```
//!
//! so a value in the config file overrides the same flag on the command line.

use crate::apply::{apply_config, apply_node_prompts};
use crate::config::{ConfigMap, RunConfiguration};
use crate::device::DevicePreference;
use crate::env::{ENV_GUIDANCE, ENV_HEIGHT, ENV_STEPS, ENV_WIDTH, Environment};
use crate::layout::Layout;
use std::path::PathBuf;
use tracing::{debug, warn};

/// A source of configuration values
pub trait ConfigLayer {
    /// Layer name for logging
    fn name(&self) -> &'static str;

    /// Overwrite the fields this layer knows about
    fn apply(&self, cfg: &mut RunConfiguration);
}

/// Built-in defaults that depend on the directory layout
pub struct Defaults<'a> {
    layout: &'a Layout,
}

impl<'a> Defaults<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }
}

impl ConfigLayer for Defaults<'_> {
    fn name(&self) -> &'static str {
        "defaults"
    }

    fn apply(&self, cfg: &mut RunConfiguration) {
        *cfg = RunConfiguration {
            output_dir: self.layout.outputs_dir(),
            ..RunConfiguration::default()
        };
    }
}

/// Default size, step and guidance overrides from the environment.
///
/// Model and LoRA variables are not applied here; they are the last fallback
/// of [`crate::resolve::ModelResolver`].
pub struct EnvironmentLayer<'a> {
    env: &'a Environment,
}

impl<'a> EnvironmentLayer<'a> {
    pub fn new(env: &'a Environment) -> Self {
        Self { env }
    }

    fn parsed<T: std::str::FromStr>(&self, var: &'static str) -> Option<T> {
        let raw = self.env.get(var)?;
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(var, value = raw, "Ignoring unparsable environment value");
                None
            }
        }
    }
}

impl ConfigLayer for EnvironmentLayer<'_> {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn apply(&self, cfg: &mut RunConfiguration) {
        if let Some(h) = self.parsed(ENV_HEIGHT) {
            cfg.height = h;
        }
        if let Some(w) = self.parsed(ENV_WIDTH) {
            cfg.width = w;
        }
        if let Some(s) = self.parsed(ENV_STEPS) {
            cfg.steps = s;
        }
        if let Some(g) = self.parsed(ENV_GUIDANCE) {
            cfg.guidance_scale = g;
        }
    }
}

/// Values given explicitly on the command line
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub base_model: Option<String>,
    pub lora: Option<String>,
    pub lora_weight: Option<String>,
    pub device: Option<DevicePreference>,
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub seed: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub filename_prefix: Option<String>,
}

/// Command-line layer
pub struct CliLayer<'a> {
    overrides: &'a CliOverrides,
}

impl<'a> CliLayer<'a> {
    pub fn new(overrides: &'a CliOverrides) -> Self {
        Self { overrides }
    }
}

impl ConfigLayer for CliLayer<'_> {
    fn name(&self) -> &'static str {
        "command line"
    }

    fn apply(&self, cfg: &mut RunConfiguration) {
        let o = self.overrides;
        if let Some(v) = &o.base_model {
            cfg.base_model = Some(v.clone());
        }
        if let Some(v) = &o.lora {
            cfg.lora = Some(v.clone());
        }
        if let Some(v) = &o.lora_weight {
            cfg.lora_weight = Some(v.clone());
        }
        if let Some(v) = o.device {
            cfg.device = v;
        }
        if let Some(v) = o.height {
            cfg.height = v;
        }
        if let Some(v) = o.width {
            cfg.width = v;
        }
        if let Some(v) = o.steps {
            cfg.steps = v;
        }
        if let Some(v) = o.guidance_scale {
            cfg.guidance_scale = v;
        }
        if let Some(v) = o.seed {
            cfg.seed = Some(v);
        }
        if let Some(v) = &o.output_dir {
            cfg.output_dir = v.clone();
        }
        if let Some(v) = &o.filename_prefix {
            cfg.filename_prefix = v.clone();
        }
    }
}

/// Config file layer: recognised keys, then node-graph prompts
pub struct FileLayer<'a> {
    config: &'a ConfigMap,
}

impl<'a> FileLayer<'a> {
    pub fn new(config: &'a ConfigMap) -> Self {
        Self { config }
    }
}

impl ConfigLayer for FileLayer<'_> {
    fn name(&self) -> &'static str {
        "config file"
    }

    fn apply(&self, cfg: &mut RunConfiguration) {
        if self.config.is_empty() {
            return;
        }
        apply_config(cfg, self.config);
        apply_node_prompts(cfg, self.config);
    }
}

/// Ordered list of configuration layers
#[derive(Default)]
pub struct LayerStack<'a> {
    layers: Vec<Box<dyn ConfigLayer + 'a>>,
}

impl<'a> LayerStack<'a> {
    /// Create an empty stack
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// The standard precedence: defaults, environment, CLI, config file
    pub fn standard(
        layout: &'a Layout,
        env: &'a Environment,
        cli: &'a CliOverrides,
        file: &'a ConfigMap,
    ) -> Self {
        Self::new()
            .layer(Defaults::new(layout))
            .layer(EnvironmentLayer::new(env))
            .layer(CliLayer::new(cli))
            .layer(FileLayer::new(file))
    }

    /// Append a layer; it takes precedence over all earlier ones
    pub fn layer(mut self, layer: impl ConfigLayer + 'a) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    /// Layer names in application order
    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    /// Apply every layer in order to a fresh configuration
    pub fn resolve(&self) -> RunConfiguration {
        let mut cfg = RunConfiguration::default();
        for layer in &self.layers {
            layer.apply(&mut cfg);
            debug!(layer = layer.name(), "Applied configuration layer");
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file(value: serde_json::Value) -> ConfigMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_standard_order() {
        let layout = Layout::new("/root");
        let env = Environment::default();
        let cli = CliOverrides::default();
        let map = ConfigMap::new();
        let stack = LayerStack::standard(&layout, &env, &cli, &map);
        assert_eq!(
            stack.names(),
            vec!["defaults", "environment", "command line", "config file"]
        );
    }

    #[test]
    fn test_defaults_use_layout_outputs() {
        let layout = Layout::new("/srv/gen");
        let cfg = LayerStack::new().layer(Defaults::new(&layout)).resolve();
        assert_eq!(cfg.output_dir, PathBuf::from("/srv/gen/outputs"));
        assert_eq!(cfg.steps, 4);
    }

    #[test]
    fn test_env_then_cli_then_file() {
        let layout = Layout::new("/root");
        let env = Environment::from_pairs([
            (ENV_HEIGHT, "512"),
            (ENV_WIDTH, "640"),
            (ENV_STEPS, "8"),
            (ENV_GUIDANCE, "2.5"),
        ]);
        let cli = CliOverrides {
            width: Some(768),
            steps: Some(12),
            ..Default::default()
        };
        let map = file(json!({"steps": 20}));

        let cfg = LayerStack::standard(&layout, &env, &cli, &map).resolve();

        assert_eq!(cfg.height, 512); // env only
        assert_eq!(cfg.width, 768); // cli beats env
        assert_eq!(cfg.steps, 20); // file beats cli
        assert_eq!(cfg.guidance_scale, 2.5);
    }

    #[test]
    fn test_bad_env_value_is_ignored() {
        let env = Environment::from_pairs([(ENV_HEIGHT, "huge")]);
        let cfg = LayerStack::new().layer(EnvironmentLayer::new(&env)).resolve();
        assert_eq!(cfg.height, 1024);
    }

    #[test]
    fn test_file_layer_extracts_node_prompts() {
        let map = file(json!({
            "nodes": [
                {"type": "PrimitiveNode", "title": "Positive", "widgets_values": ["castle"]},
            ]
        }));
        let cfg = LayerStack::new().layer(FileLayer::new(&map)).resolve();
        assert_eq!(cfg.positive_prompt.as_deref(), Some("castle"));
    }

    #[test]
    fn test_explicit_prompt_beats_node_graph() {
        let map = file(json!({
            "positive_prompt": "explicit",
            "nodes": [
                {"type": "PrimitiveNode", "title": "Positive", "widgets_values": ["graph"]},
            ]
        }));
        let cfg = LayerStack::new().layer(FileLayer::new(&map)).resolve();
        assert_eq!(cfg.positive_prompt.as_deref(), Some("explicit"));
    }
}
