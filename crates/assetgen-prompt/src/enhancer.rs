//! Idea → SDXL prompt pair
//!
//! A chat model is asked for two labelled lines. Its answer is parsed
//! leniently and the required quality phrases are then enforced, since the
//! model cannot be relied on to include them.

use crate::error::Result;
use crate::generator::{SamplingParams, TextGenerator};
use tracing::{debug, info};

/// Must appear in every positive prompt
pub const REQUIRED_POSITIVE: &str = "masterpiece, best quality, 8k, ultra-detailed";

/// Must appear in every negative prompt
pub const REQUIRED_NEGATIVE: &str = "low quality, worst quality, bad anatomy, bad hands, text, error, \
missing fingers, extra digit, fewer digits, cropped, jpeg artifacts, signature, watermark, \
username, artist name";

pub const DEFAULT_STYLE: &str = "cinematic";

const ASSISTANT_MARKER: &str = "<|assistant|>\n";
const POSITIVE_LABEL: &str = "positive prompt:";
const NEGATIVE_LABEL: &str = "negative prompt:";
const HUMAN_NEGATIVE: &str = "deformed, disfigured, mutation, extra limbs, floating limbs";

/// A positive/negative prompt pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedPrompt {
    pub positive: String,
    pub negative: String,
}

fn system_prompt() -> String {
    format!(
        "You are an expert AI art prompt engineer for Stable Diffusion XL. \
         Your goal is to format the user's idea into a professional prompt WITHOUT adding unrequested content.\n\
         RULES for Positive Prompt:\n\
         - DO NOT hallucinate new objects, actions, or narrative details not mentioned by the user.\n\
         - Structure: [User's Exact Idea] -> [Art Style/Medium] -> [Lighting/Atmosphere] -> [Quality Boosters].\n\
         - Always include: '{positive}'.\n\
         RULES for Negative Prompt (CRITICAL for avoiding errors):\n\
         - ALWAYS include: '{negative}'.\n\
         - If the subject is human, add: '{human}'.\n\
         Strictly follow this output format:\n\
         Positive Prompt: <generated_positive_prompt>\n\
         Negative Prompt: <generated_negative_prompt>\n\
         \n\
         Example:\n\
         Positive Prompt: A samurai, ukiyo-e style, dramatic lighting, {positive}\n\
         Negative Prompt: {negative}",
        positive = REQUIRED_POSITIVE,
        negative = REQUIRED_NEGATIVE,
        human = HUMAN_NEGATIVE,
    )
}

/// The full chat-formatted instruction for an idea and style
pub fn build_instruction(idea: &str, style: &str) -> String {
    let user = format!(
        "Convert this idea into a professional prompt pair.\nIdea: {}\nStyle: {}",
        idea, style
    );
    format!(
        "<|system|>\n{}</s>\n<|user|>\n{}</s>\n{}",
        system_prompt(),
        user,
        ASSISTANT_MARKER
    )
}

/// Text after the last assistant marker, trimmed
pub fn assistant_reply(generated: &str) -> &str {
    generated
        .rsplit(ASSISTANT_MARKER)
        .next()
        .unwrap_or(generated)
        .trim()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Positive,
    Negative,
}

/// Parse a labelled reply and enforce the required phrases.
///
/// Lines after a label belong to that label until the next one. Without a
/// positive label the whole reply becomes the positive prompt.
pub fn parse_response(response: &str) -> EnhancedPrompt {
    let mut positive: Vec<&str> = Vec::new();
    let mut negative: Vec<&str> = Vec::new();
    let mut section = None;

    for line in response.lines() {
        let line = line.trim();
        let lower = line.to_lowercase();

        let text = if lower.starts_with(POSITIVE_LABEL) {
            section = Some(Section::Positive);
            after_label(line)
        } else if lower.starts_with(NEGATIVE_LABEL) {
            section = Some(Section::Negative);
            after_label(line)
        } else {
            line
        };

        if text.is_empty() {
            continue;
        }
        match section {
            Some(Section::Positive) => positive.push(text),
            Some(Section::Negative) => negative.push(text),
            None => {}
        }
    }

    let mut positive = positive.join(" ");
    if positive.is_empty() {
        debug!("No positive label in reply, using it verbatim");
        positive = response.trim().to_string();
    }

    enforce_constraints(&positive, &negative.join(" "))
}

fn after_label(line: &str) -> &str {
    line.split_once(':').map(|(_, rest)| rest.trim()).unwrap_or("")
}

/// Append the required phrases where they are missing.
///
/// Presence is an exact substring check, so applying this to its own output
/// changes nothing.
pub fn enforce_constraints(positive: &str, negative: &str) -> EnhancedPrompt {
    EnhancedPrompt {
        positive: append_required(positive.trim(), REQUIRED_POSITIVE),
        negative: append_required(negative.trim(), REQUIRED_NEGATIVE),
    }
}

fn append_required(text: &str, required: &str) -> String {
    if text.contains(required) {
        text.to_string()
    } else if text.is_empty() {
        required.to_string()
    } else {
        format!("{}, {}", text, required)
    }
}

/// Expands short ideas into prompt pairs with a local model
pub struct PromptEnhancer<G> {
    generator: G,
    params: SamplingParams,
}

impl<G: TextGenerator> PromptEnhancer<G> {
    pub fn new(generator: G) -> Self {
        Self {
            generator,
            params: SamplingParams::default(),
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Turn an idea into a constrained prompt pair
    pub fn enhance(&mut self, idea: &str, style: &str) -> Result<EnhancedPrompt> {
        let style = if style.trim().is_empty() {
            DEFAULT_STYLE
        } else {
            style.trim()
        };
        info!(style, "Enhancing prompt");

        let instruction = build_instruction(idea.trim(), style);
        let generated = self.generator.generate(&instruction, &self.params)?;
        let reply = assistant_reply(&generated);
        debug!(reply, "Model reply");

        Ok(parse_response(reply))
    }
}
