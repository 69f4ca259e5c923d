//! Model and LoRA path resolution
//!
//! Everything resolves to local paths. Names that match nothing local are
//! rejected rather than treated as remote repositories; the only exception is
//! a LoRA `(directory, weight file)` pair, whose existence is checked when the
//! pipeline loads it.

use crate::config::RunConfiguration;
use crate::env::{ENV_BASE_MODEL, ENV_LORA, ENV_LORA_WEIGHT, Environment};
use crate::error::{ResolveError, Result};
use crate::layout::{Layout, SAFETENSORS_EXT};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Base model value that means "use the fallback chain"
pub const DEFAULT_MODEL_TOKEN: &str = "default";

/// LoRA values that disable adapters
pub const LORA_DISABLE_TOKENS: [&str; 3] = ["none", "off", "disable"];

/// Fusion scale used when an entry does not give one
pub const DEFAULT_LORA_SCALE: f64 = 1.0;

/// A resolved LoRA adapter
#[derive(Debug, Clone, PartialEq)]
pub struct LoraSpec {
    /// Directory (or repository-style name) holding the weight file
    pub location: PathBuf,
    /// Weight file name inside `location`
    pub weight_name: String,
    /// Fusion multiplier
    pub scale: f64,
}

impl LoraSpec {
    pub fn new(location: impl Into<PathBuf>, weight_name: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            weight_name: weight_name.into(),
            scale: DEFAULT_LORA_SCALE,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Full path of the weight file
    pub fn weight_path(&self) -> PathBuf {
        self.location.join(&self.weight_name)
    }
}

impl fmt::Display for LoraSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :: {}", self.location.display(), self.weight_name)?;
        if self.scale != DEFAULT_LORA_SCALE {
            write!(f, " (scale {})", self.scale)?;
        }
        Ok(())
    }
}

/// Resolves configured names to local model and adapter files
pub struct ModelResolver<'a> {
    layout: &'a Layout,
    env: &'a Environment,
}

impl<'a> ModelResolver<'a> {
    pub fn new(layout: &'a Layout, env: &'a Environment) -> Self {
        Self { layout, env }
    }

    /// Resolve the base model.
    ///
    /// Order: explicit path, `<checkpoints>/<name>`, then (with no argument or
    /// `default`) the environment variable and the two fixed default locations.
    pub fn resolve_base_model(&self, arg: Option<&str>) -> Result<PathBuf> {
        let arg = arg.filter(|a| !a.is_empty());

        let Some(arg) = arg else {
            return self.resolve_default_base_model();
        };

        if arg == DEFAULT_MODEL_TOKEN {
            return self.resolve_default_base_model();
        }

        if let Some(found) = existing(Path::new(arg)) {
            debug!(path = %found.display(), "Base model from explicit path");
            return Ok(found);
        }

        if let Some(found) = existing(&self.layout.checkpoints_dir().join(arg)) {
            debug!(path = %found.display(), "Base model from checkpoints directory");
            return Ok(found);
        }

        Err(ResolveError::BaseModelNotFound(arg.to_string()))
    }

    fn resolve_default_base_model(&self) -> Result<PathBuf> {
        if let Some(value) = self.env.non_empty(ENV_BASE_MODEL) {
            return match existing(Path::new(value)) {
                Some(found) => {
                    debug!(path = %found.display(), "Base model from {}", ENV_BASE_MODEL);
                    Ok(found)
                }
                None => Err(ResolveError::EnvBaseModelMissing {
                    var: ENV_BASE_MODEL,
                    value: value.to_string(),
                }),
            };
        }

        let default_file = self.layout.default_checkpoint_file();
        let default_dir = self.layout.default_checkpoint_dir();

        if let Some(found) = existing(&default_file).or_else(|| existing(&default_dir)) {
            debug!(path = %found.display(), "Base model from default location");
            return Ok(found);
        }

        Err(ResolveError::NoBaseModel {
            var: ENV_BASE_MODEL,
            checkpoints: self.layout.checkpoints_dir(),
            default_file,
            default_dir,
        })
    }

    /// Resolve a single LoRA value to a `(location, weight)` pair
    pub fn resolve_lora_values(&self, value: &str, weight: Option<&str>) -> Result<LoraSpec> {
        let path = Path::new(value);
        let loras_dir = self.layout.loras_dir();

        if path.extension().is_some_and(|e| e == SAFETENSORS_EXT) {
            let mut candidates = vec![path.to_path_buf(), self.layout.root().join(path)];
            if let Some(name) = path.file_name() {
                candidates.push(loras_dir.join(name));
            }

            return candidates
                .iter()
                .find(|c| c.is_file())
                .and_then(|c| split_file(c))
                .ok_or_else(|| ResolveError::LoraFileNotFound(value.to_string()));
        }

        let candidate = loras_dir.join(value);
        if candidate.is_file() {
            if let Some(spec) = split_file(&candidate) {
                return Ok(spec);
            }
        }

        let with_suffix = loras_dir.join(format!("{}.{}", value, SAFETENSORS_EXT));
        if with_suffix.is_file() {
            if let Some(spec) = split_file(&with_suffix) {
                return Ok(spec);
            }
        }

        match weight.filter(|w| !w.trim().is_empty()) {
            Some(w) => Ok(LoraSpec::new(value, w)),
            None => Err(ResolveError::LoraWeightRequired(value.to_string())),
        }
    }

    /// Resolve the single-LoRA form: argument first, then environment
    pub fn resolve_lora(&self, arg: Option<&str>, weight: Option<&str>) -> Result<Option<LoraSpec>> {
        if let Some(value) = arg.map(str::trim).filter(|v| !v.is_empty()) {
            if is_disable_token(value) {
                debug!("LoRA disabled by argument");
                return Ok(None);
            }
            return self.resolve_lora_values(value, weight).map(Some);
        }

        let Some(env_value) = self.env.get(ENV_LORA).map(str::trim) else {
            return Ok(None);
        };
        if env_value.is_empty() || is_disable_token(env_value) {
            return Ok(None);
        }
        self.resolve_lora_values(env_value, self.env.get(ENV_LORA_WEIGHT))
            .map(Some)
    }

    /// Resolve a `loras` list from the config file
    pub fn resolve_lora_list(&self, entries: &Value) -> Result<Vec<LoraSpec>> {
        let Value::Array(entries) = entries else {
            return Err(ResolveError::LorasNotAList);
        };

        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| self.resolve_lora_entry(index, entry))
            .collect()
    }

    fn resolve_lora_entry(&self, index: usize, entry: &Value) -> Result<LoraSpec> {
        let invalid = |reason: &str| ResolveError::InvalidLoraEntry {
            index,
            reason: reason.to_string(),
        };

        match entry {
            Value::String(value) => self.resolve_lora_values(value, None),
            Value::Object(obj) => {
                let value = obj
                    .get("lora")
                    .and_then(Value::as_str)
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| invalid("each LoRA entry must have a non-empty 'lora' value"))?;

                let weight = match obj.get("lora_weight") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(w)) => Some(w.as_str()),
                    Some(_) => return Err(invalid("'lora_weight' must be a string")),
                };

                let scale = match obj.get("scale") {
                    None | Some(Value::Null) => DEFAULT_LORA_SCALE,
                    Some(v) => v
                        .as_f64()
                        .ok_or_else(|| invalid("'scale' must be a number"))?,
                };

                Ok(self.resolve_lora_values(value, weight)?.with_scale(scale))
            }
            _ => Err(invalid("each LoRA entry must be a string or an object")),
        }
    }

    /// All adapters for a run; a `loras` list takes precedence over `lora`
    pub fn resolve_adapters(&self, cfg: &RunConfiguration) -> Result<Vec<LoraSpec>> {
        if cfg.has_lora_list() {
            if let Some(list) = &cfg.loras {
                return self.resolve_lora_list(list);
            }
        }

        Ok(self
            .resolve_lora(cfg.lora.as_deref(), cfg.lora_weight.as_deref())?
            .into_iter()
            .collect())
    }
}

fn is_disable_token(value: &str) -> bool {
    let lower = value.to_lowercase();
    LORA_DISABLE_TOKENS.contains(&lower.as_str())
}

fn existing(path: &Path) -> Option<PathBuf> {
    (path.is_file() || path.is_dir()).then(|| path.to_path_buf())
}

/// A weight file as `(parent directory, file name)`
fn split_file(path: &Path) -> Option<LoraSpec> {
    let name = path.file_name()?.to_str()?;
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    Some(LoraSpec::new(parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        layout: Layout,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let layout = Layout::new(dir.path());
            std::fs::create_dir_all(layout.checkpoints_dir()).unwrap();
            std::fs::create_dir_all(layout.loras_dir()).unwrap();
            Self { _dir: dir, layout }
        }

        fn touch(&self, path: &Path) -> PathBuf {
            std::fs::write(path, b"weights").unwrap();
            path.to_path_buf()
        }
    }

    #[test]
    fn test_base_model_explicit_path() {
        let fx = Fixture::new();
        let file = fx.touch(&fx.layout.root().join("custom.safetensors"));
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        let got = resolver.resolve_base_model(file.to_str()).unwrap();
        assert_eq!(got, file);
    }

    #[test]
    fn test_base_model_name_under_checkpoints() {
        let fx = Fixture::new();
        let dir = fx.layout.checkpoints_dir().join("juggernaut");
        std::fs::create_dir_all(&dir).unwrap();
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        assert_eq!(resolver.resolve_base_model(Some("juggernaut")).unwrap(), dir);
    }

    #[test]
    fn test_base_model_unknown_name_rejected() {
        let fx = Fixture::new();
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        let err = resolver
            .resolve_base_model(Some("stabilityai/stable-diffusion-xl-base-1.0"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::BaseModelNotFound(_)));
        assert!(err.to_string().contains("Remote downloads are disabled"));
    }

    #[test]
    fn test_base_model_fallback_chain() {
        let fx = Fixture::new();
        let resolver_env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &resolver_env);

        // Nothing anywhere
        let err = resolver.resolve_base_model(None).unwrap_err();
        assert!(matches!(err, ResolveError::NoBaseModel { .. }));

        // Default directory
        let default_dir = fx.layout.default_checkpoint_dir();
        std::fs::create_dir_all(&default_dir).unwrap();
        assert_eq!(resolver.resolve_base_model(None).unwrap(), default_dir);

        // Default file beats default directory
        let default_file = fx.touch(&fx.layout.default_checkpoint_file());
        assert_eq!(resolver.resolve_base_model(Some("")).unwrap(), default_file);
        assert_eq!(
            resolver.resolve_base_model(Some("default")).unwrap(),
            default_file
        );

        // Environment beats defaults
        let env_model = fx.touch(&fx.layout.root().join("env_model.safetensors"));
        let env = Environment::from_pairs([(ENV_BASE_MODEL, env_model.to_str().unwrap())]);
        let resolver = ModelResolver::new(&fx.layout, &env);
        assert_eq!(resolver.resolve_base_model(None).unwrap(), env_model);

        // Explicit argument beats environment
        let cli_model = fx.touch(&fx.layout.root().join("cli_model.safetensors"));
        assert_eq!(
            resolver.resolve_base_model(cli_model.to_str()).unwrap(),
            cli_model
        );
    }

    #[test]
    fn test_base_model_env_set_but_missing() {
        let fx = Fixture::new();
        fx.touch(&fx.layout.default_checkpoint_file());
        let env = Environment::from_pairs([(ENV_BASE_MODEL, "/nonexistent/model")]);
        let resolver = ModelResolver::new(&fx.layout, &env);

        let err = resolver.resolve_base_model(None).unwrap_err();
        assert!(matches!(err, ResolveError::EnvBaseModelMissing { .. }));
    }

    #[test]
    fn test_lora_file_under_adapters_dir() {
        let fx = Fixture::new();
        fx.touch(&fx.layout.loras_dir().join("style.safetensors"));
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        let spec = resolver
            .resolve_lora_values("style.safetensors", None)
            .unwrap();
        assert_eq!(spec.location, fx.layout.loras_dir());
        assert_eq!(spec.weight_name, "style.safetensors");
        assert_eq!(spec.scale, 1.0);
    }

    #[test]
    fn test_lora_safetensors_relative_to_root() {
        let fx = Fixture::new();
        let nested = fx.layout.root().join("adapters");
        std::fs::create_dir_all(&nested).unwrap();
        fx.touch(&nested.join("ink.safetensors"));
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        let spec = resolver
            .resolve_lora_values("adapters/ink.safetensors", None)
            .unwrap();
        assert_eq!(spec.location, nested);
        assert_eq!(spec.weight_name, "ink.safetensors");
    }

    #[test]
    fn test_lora_missing_safetensors_file() {
        let fx = Fixture::new();
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        let err = resolver
            .resolve_lora_values("ghost.safetensors", Some("ignored"))
            .unwrap_err();
        assert!(matches!(err, ResolveError::LoraFileNotFound(_)));
    }

    #[test]
    fn test_lora_bare_name_gets_suffix() {
        let fx = Fixture::new();
        fx.touch(&fx.layout.loras_dir().join("pixel.safetensors"));
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        let spec = resolver.resolve_lora_values("pixel", None).unwrap();
        assert_eq!(spec.weight_path(), fx.layout.loras_dir().join("pixel.safetensors"));
    }

    #[test]
    fn test_lora_repo_id_requires_weight() {
        let fx = Fixture::new();
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        let err = resolver
            .resolve_lora_values("ByteDance/SDXL-Lightning", None)
            .unwrap_err();
        assert!(matches!(err, ResolveError::LoraWeightRequired(_)));

        let err = resolver
            .resolve_lora_values("ByteDance/SDXL-Lightning", Some("  "))
            .unwrap_err();
        assert!(matches!(err, ResolveError::LoraWeightRequired(_)));

        let spec = resolver
            .resolve_lora_values("ByteDance/SDXL-Lightning", Some("lightning_4step.safetensors"))
            .unwrap();
        assert_eq!(spec.location, PathBuf::from("ByteDance/SDXL-Lightning"));
        assert_eq!(spec.weight_name, "lightning_4step.safetensors");
    }

    #[test]
    fn test_lora_disable_tokens_and_env_fallback() {
        let fx = Fixture::new();
        fx.touch(&fx.layout.loras_dir().join("env_style.safetensors"));
        let env = Environment::from_pairs([(ENV_LORA, "env_style")]);
        let resolver = ModelResolver::new(&fx.layout, &env);

        assert_eq!(resolver.resolve_lora(Some("OFF"), None).unwrap(), None);
        assert_eq!(resolver.resolve_lora(Some("none"), None).unwrap(), None);

        // Blank argument falls through to the environment
        let spec = resolver.resolve_lora(Some("  "), None).unwrap().unwrap();
        assert_eq!(spec.weight_name, "env_style.safetensors");

        let disabled_env = Environment::from_pairs([(ENV_LORA, "disable")]);
        let resolver = ModelResolver::new(&fx.layout, &disabled_env);
        assert_eq!(resolver.resolve_lora(None, None).unwrap(), None);
    }

    #[test]
    fn test_lora_env_uses_env_weight() {
        let fx = Fixture::new();
        let env = Environment::from_pairs([
            (ENV_LORA, "some/repo"),
            (ENV_LORA_WEIGHT, "w.safetensors"),
        ]);
        let resolver = ModelResolver::new(&fx.layout, &env);

        let spec = resolver.resolve_lora(None, None).unwrap().unwrap();
        assert_eq!(spec.location, PathBuf::from("some/repo"));
        assert_eq!(spec.weight_name, "w.safetensors");
    }

    #[test]
    fn test_lora_list_entries() {
        let fx = Fixture::new();
        fx.touch(&fx.layout.loras_dir().join("a.safetensors"));
        fx.touch(&fx.layout.loras_dir().join("b.safetensors"));
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        let specs = resolver
            .resolve_lora_list(&json!([
                "a.safetensors",
                {"lora": "b", "scale": 0.6},
                {"lora": "org/repo", "lora_weight": "c.safetensors"},
            ]))
            .unwrap();

        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].weight_name, "a.safetensors");
        assert_eq!(specs[1].weight_name, "b.safetensors");
        assert_eq!(specs[1].scale, 0.6);
        assert_eq!(specs[2].location, PathBuf::from("org/repo"));
    }

    #[test]
    fn test_lora_list_rejects_bad_entries() {
        let fx = Fixture::new();
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        assert!(matches!(
            resolver.resolve_lora_list(&json!("a.safetensors")),
            Err(ResolveError::LorasNotAList)
        ));
        assert!(matches!(
            resolver.resolve_lora_list(&json!([{"lora": ""}])),
            Err(ResolveError::InvalidLoraEntry { index: 0, .. })
        ));
        assert!(matches!(
            resolver.resolve_lora_list(&json!([{"lora_weight": "x"}])),
            Err(ResolveError::InvalidLoraEntry { index: 0, .. })
        ));
        assert!(matches!(
            resolver.resolve_lora_list(&json!([{"lora": "r", "lora_weight": "w"}, 5])),
            Err(ResolveError::InvalidLoraEntry { index: 1, .. })
        ));
    }

    #[test]
    fn test_list_takes_precedence_over_single() {
        let fx = Fixture::new();
        fx.touch(&fx.layout.loras_dir().join("listed.safetensors"));
        fx.touch(&fx.layout.loras_dir().join("single.safetensors"));
        let env = Environment::default();
        let resolver = ModelResolver::new(&fx.layout, &env);

        let cfg = RunConfiguration {
            lora: Some("single".into()),
            loras: Some(json!(["listed"])),
            ..Default::default()
        };
        let specs = resolver.resolve_adapters(&cfg).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].weight_name, "listed.safetensors");

        let cfg = RunConfiguration {
            lora: Some("single".into()),
            loras: Some(Value::Null),
            ..Default::default()
        };
        let specs = resolver.resolve_adapters(&cfg).unwrap();
        assert_eq!(specs[0].weight_name, "single.safetensors");
    }
}
