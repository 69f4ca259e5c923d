//! assetgen prompt - turn short ideas into SDXL prompt pairs
//!
//! A local chat model drafts the prompts and the required quality phrases
//! are enforced afterwards. The model sits behind [`TextGenerator`], so the
//! parsing and enforcement work without any weights.

pub mod enhancer;
pub mod error;
pub mod generator;
pub mod llama;

pub use enhancer::{
    DEFAULT_STYLE, EnhancedPrompt, PromptEnhancer, REQUIRED_NEGATIVE, REQUIRED_POSITIVE,
    build_instruction, enforce_constraints, parse_response,
};
pub use error::{EnhancerError, Result};
pub use generator::{SamplingParams, TextGenerator};
pub use llama::LlamaGenerator;
