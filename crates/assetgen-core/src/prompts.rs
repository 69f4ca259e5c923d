//! Prompt resolution: explicit, then interactive, then built-in default

use crate::config::RunConfiguration;
use std::io::{self, BufRead, Write};

pub const DEFAULT_POSITIVE_PROMPT: &str =
    "High quality game asset, concept art, detailed, sharp focus, 4k, trending on artstation";

pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "low quality, blurry, distorted, extra limbs, bad anatomy, watermark, text";

const POSITIVE_QUESTION: &str = "Positive prompt (describe your asset): ";
const NEGATIVE_QUESTION: &str = "Negative prompt (press Enter for defaults): ";

/// Final prompt text for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    pub positive: String,
    pub negative: String,
}

/// Resolve both prompts.
///
/// A configured prompt is used when it is non-blank after trimming. Otherwise
/// the user is asked on `output` and the answer read from `input`; a blank
/// answer or end of input selects the default.
pub fn resolve_prompts<R: BufRead, W: Write>(
    cfg: &RunConfiguration,
    input: &mut R,
    output: &mut W,
) -> io::Result<Prompts> {
    let positive = resolve_one(
        cfg.positive_prompt.as_deref(),
        POSITIVE_QUESTION,
        DEFAULT_POSITIVE_PROMPT,
        input,
        output,
    )?;
    let negative = resolve_one(
        cfg.negative_prompt.as_deref(),
        NEGATIVE_QUESTION,
        DEFAULT_NEGATIVE_PROMPT,
        input,
        output,
    )?;
    Ok(Prompts { positive, negative })
}

fn resolve_one<R: BufRead, W: Write>(
    configured: Option<&str>,
    question: &str,
    default: &str,
    input: &mut R,
    output: &mut W,
) -> io::Result<String> {
    if let Some(text) = configured.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(text.to_string());
    }

    write!(output, "{}", question)?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;

    let answer = line.trim();
    if answer.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(answer.to_string())
    }
}
