//! Environment variable snapshot
//!
//! The process environment is captured once so that every layer and resolver
//! sees the same values, and so tests can supply their own.

use std::collections::HashMap;

/// Base model location override
pub const ENV_BASE_MODEL: &str = "ASSET_TTI_BASE_MODEL";
/// LoRA location override
pub const ENV_LORA: &str = "ASSET_TTI_LORA";
/// LoRA weight file override
pub const ENV_LORA_WEIGHT: &str = "ASSET_TTI_LORA_WEIGHT";
/// Default image height
pub const ENV_HEIGHT: &str = "ASSET_TTI_HEIGHT";
/// Default image width
pub const ENV_WIDTH: &str = "ASSET_TTI_WIDTH";
/// Default denoising step count
pub const ENV_STEPS: &str = "ASSET_TTI_STEPS";
/// Default guidance scale
pub const ENV_GUIDANCE: &str = "ASSET_TTI_GUIDANCE";
/// Program root directory
pub const ENV_ROOT: &str = "ASSET_TTI_ROOT";

const ALL_VARS: [&str; 8] = [
    ENV_BASE_MODEL,
    ENV_LORA,
    ENV_LORA_WEIGHT,
    ENV_HEIGHT,
    ENV_WIDTH,
    ENV_STEPS,
    ENV_GUIDANCE,
    ENV_ROOT,
];

/// A snapshot of the variables this program reads
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<&'static str, String>,
}

impl Environment {
    /// Capture the current process environment
    pub fn from_process() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from explicit pairs; unknown names are ignored
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let given: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.into()))
            .collect();
        Self::from_lookup(|name| given.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = ALL_VARS
            .iter()
            .filter_map(|&name| lookup(name).map(|value| (name, value)))
            .collect();
        Self { vars }
    }

    /// Raw value of a variable, if set
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Value of a variable if set and not blank
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pairs_keeps_known_vars_only() {
        let env = Environment::from_pairs([(ENV_HEIGHT, "768"), ("UNRELATED", "x")]);
        assert_eq!(env.get(ENV_HEIGHT), Some("768"));
        assert_eq!(env.get("UNRELATED"), None);
    }

    #[test]
    fn test_non_empty_filters_blank() {
        let env = Environment::from_pairs([(ENV_LORA, "  ")]);
        assert_eq!(env.get(ENV_LORA), Some("  "));
        assert_eq!(env.non_empty(ENV_LORA), None);
    }
}
