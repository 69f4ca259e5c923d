//! TinyLlama-style chat model on candle
//!
//! Expects a local directory holding `config.json`, `tokenizer.json` and
//! either `model.safetensors` or a sharded `model.safetensors.index.json`.

use crate::error::{EnhancerError, Result};
use crate::generator::{SamplingParams, TextGenerator};
use assetgen_core::read_shard_index;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX: &str = "model.safetensors.index.json";
const EOS_TOKEN: &str = "</s>";

/// A causal language model with its tokenizer
pub struct LlamaGenerator {
    model: Llama,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    eos_token: Option<u32>,
}

impl LlamaGenerator {
    /// Load the model in `dir` onto `device`
    pub fn load(dir: &Path, device: &Device, dtype: DType) -> Result<Self> {
        if !dir.is_dir() {
            return Err(EnhancerError::ModelNotFound(dir.to_path_buf()));
        }
        info!(path = %dir.display(), ?dtype, "Loading language model");

        let config = read_config(&dir.join(CONFIG_FILE))?;
        let tokenizer_path = dir.join(TOKENIZER_FILE);
        if !tokenizer_path.is_file() {
            return Err(EnhancerError::ModelNotFound(tokenizer_path));
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EnhancerError::Tokenizer(e.to_string()))?;

        let files = weight_files(dir)?;
        debug!(shards = files.len(), "Mapping weights");
        // SAFETY: the files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files, dtype, device)? };
        let model = Llama::load(vb, &config)?;

        let eos_token = tokenizer.token_to_id(EOS_TOKEN);
        Ok(Self {
            model,
            config,
            tokenizer,
            device: device.clone(),
            dtype,
            eos_token,
        })
    }
}

impl TextGenerator for LlamaGenerator {
    fn generate(&mut self, prompt: &str, params: &SamplingParams) -> Result<String> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| EnhancerError::Tokenizer(e.to_string()))?;
        let mut tokens = encoding.get_ids().to_vec();
        let prompt_len = tokens.len();

        let seed = params.seed.unwrap_or_else(rand::random);
        let mut sampler = LogitsProcessor::from_sampling(
            seed,
            Sampling::TopKThenTopP {
                k: params.top_k,
                p: params.top_p,
                temperature: params.temperature,
            },
        );
        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;

        let mut index_pos = 0;
        for step in 0..params.max_new_tokens {
            // With the KV cache only the newest token is fed after the first pass
            let context = if step == 0 {
                &tokens[..]
            } else {
                &tokens[tokens.len() - 1..]
            };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, index_pos, &mut cache)?;
            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            index_pos += context.len();

            let next = sampler.sample(&logits)?;
            if Some(next) == self.eos_token {
                break;
            }
            tokens.push(next);
        }

        debug!(new_tokens = tokens.len() - prompt_len, "Generation finished");
        self.tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| EnhancerError::Tokenizer(e.to_string()))
    }
}

fn read_config(path: &Path) -> Result<Config> {
    if !path.is_file() {
        return Err(EnhancerError::ModelNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let config: LlamaConfig = serde_json::from_str(&content).map_err(|source| EnhancerError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(config.into_config(false))
}

fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let single = dir.join(WEIGHTS_FILE);
    if single.is_file() {
        return Ok(vec![single]);
    }

    let index = dir.join(WEIGHTS_INDEX);
    if !index.is_file() {
        return Err(EnhancerError::ModelNotFound(single));
    }
    Ok(read_shard_index(&index)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetgen_core::ResolveError;
    use tempfile::TempDir;

    #[test]
    fn test_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(matches!(
            LlamaGenerator::load(&missing, &Device::Cpu, DType::F32),
            Err(EnhancerError::ModelNotFound(p)) if p == missing
        ));
    }

    #[test]
    fn test_missing_config() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            LlamaGenerator::load(tmp.path(), &Device::Cpu, DType::F32),
            Err(EnhancerError::ModelNotFound(p)) if p.ends_with(CONFIG_FILE)
        ));
    }

    #[test]
    fn test_invalid_config_json() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert!(matches!(
            read_config(&tmp.path().join(CONFIG_FILE)),
            Err(EnhancerError::Json { .. })
        ));
    }

    #[test]
    fn test_single_weight_file_preferred() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(WEIGHTS_FILE), b"").unwrap();
        std::fs::write(tmp.path().join(WEIGHTS_INDEX), "{}").unwrap();

        let files = weight_files(tmp.path()).unwrap();
        assert_eq!(files, vec![tmp.path().join(WEIGHTS_FILE)]);
    }

    #[test]
    fn test_sharded_weights_deduplicated() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(WEIGHTS_INDEX),
            r#"{"metadata": {}, "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }}"#,
        )
        .unwrap();

        let files = weight_files(tmp.path()).unwrap();
        assert_eq!(
            files,
            vec![
                tmp.path().join("model-00001-of-00002.safetensors"),
                tmp.path().join("model-00002-of-00002.safetensors"),
            ]
        );
    }

    #[test]
    fn test_malformed_index_reported() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(WEIGHTS_INDEX), "{}").unwrap();
        assert!(matches!(
            weight_files(tmp.path()),
            Err(EnhancerError::Resolve(ResolveError::InvalidShardIndex { .. }))
        ));
    }

    #[test]
    fn test_no_weights() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            weight_files(tmp.path()),
            Err(EnhancerError::ModelNotFound(_))
        ));
    }
}
