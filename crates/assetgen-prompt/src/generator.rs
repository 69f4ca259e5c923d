//! Text generation seam

use crate::error::Result;

/// Sampling settings for one completion
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    /// Fixed sampling seed; random when unset
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.7,
            top_k: 50,
            top_p: 0.95,
            seed: None,
        }
    }
}

/// A local model that continues a prompt
pub trait TextGenerator {
    /// Generate a completion for `prompt`.
    ///
    /// Implementations may return the prompt followed by the completion, or
    /// the completion alone.
    fn generate(&mut self, prompt: &str, params: &SamplingParams) -> Result<String>;
}

impl<G: TextGenerator + ?Sized> TextGenerator for Box<G> {
    fn generate(&mut self, prompt: &str, params: &SamplingParams) -> Result<String> {
        (**self).generate(prompt, params)
    }
}
