//! Enhance command

use super::DeviceArg;
use assetgen_core::{Environment, Layout, select_device};
use assetgen_diffusion::{CandleProbe, device_for};
use assetgen_prompt::{
    DEFAULT_STYLE, EnhancedPrompt, LlamaGenerator, PromptEnhancer, SamplingParams, TextGenerator,
};
use clap::Args;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::info;

const IDEA_QUESTION: &str = "\nEnter your idea (or 'q' to quit): ";
const STYLE_QUESTION: &str = "Enter style (e.g., cyberpunk, fantasy, realistic): ";
const QUIT: &str = "q";

#[derive(Args, Debug, Clone)]
pub struct EnhanceArgs {
    /// Local chat model directory (defaults to models/llm/tinyllama-1.1b-chat)
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Art style used when none is entered
    #[arg(long, default_value = DEFAULT_STYLE)]
    pub style: String,

    /// Enhance this idea once and exit
    #[arg(long)]
    pub idea: Option<String>,

    /// Execution device
    #[arg(long, value_enum, default_value_t = DeviceArg::Auto)]
    pub device: DeviceArg,

    /// Sampling seed
    #[arg(long)]
    pub seed: Option<u64>,
}

pub fn run(args: EnhanceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let env = Environment::from_process();
    let layout = Layout::discover(&env)?;
    let model_dir = args.model.clone().unwrap_or_else(|| layout.default_llm_dir());

    let selection = select_device(args.device.into(), &CandleProbe)?;
    let (device, dtype) = device_for(selection)?;
    info!(%selection, model = %model_dir.display(), "Loading prompt enhancer");
    let generator = LlamaGenerator::load(&model_dir, &device, dtype)?;
    println!("Running LLM on: {}", selection);

    let mut enhancer = PromptEnhancer::new(generator).with_params(SamplingParams {
        seed: args.seed,
        ..SamplingParams::default()
    });

    let stdout = io::stdout();
    match &args.idea {
        Some(idea) => {
            let result = enhancer.enhance(idea, &args.style)?;
            print_result(&mut stdout.lock(), &result)?;
        }
        None => interactive(
            &mut enhancer,
            &args.style,
            &mut io::stdin().lock(),
            &mut stdout.lock(),
        )?,
    }
    Ok(())
}

/// Ask for ideas until `q` or end of input
fn interactive<G: TextGenerator, R: BufRead, W: Write>(
    enhancer: &mut PromptEnhancer<G>,
    default_style: &str,
    input: &mut R,
    output: &mut W,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let Some(idea) = ask(IDEA_QUESTION, input, output)? else {
            break;
        };
        if idea.eq_ignore_ascii_case(QUIT) {
            break;
        }

        let style = ask(STYLE_QUESTION, input, output)?.unwrap_or_default();
        let style = if style.is_empty() {
            default_style
        } else {
            style.as_str()
        };

        writeln!(output, "\nGenerating...")?;
        let result = enhancer.enhance(&idea, style)?;
        print_result(output, &result)?;
    }
    Ok(())
}

/// Trimmed answer, or `None` at end of input
fn ask<R: BufRead, W: Write>(
    question: &str,
    input: &mut R,
    output: &mut W,
) -> io::Result<Option<String>> {
    write!(output, "{}", question)?;
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn print_result(out: &mut impl Write, result: &EnhancedPrompt) -> io::Result<()> {
    writeln!(out, "\n--- Result ---")?;
    writeln!(out, "Positive: {}", result.positive)?;
    writeln!(out, "Negative: {}", result.negative)?;
    writeln!(out, "--------------")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetgen_prompt::{REQUIRED_NEGATIVE, REQUIRED_POSITIVE};
    use std::io::Cursor;

    /// Echoes the style back as the positive prompt
    struct EchoStyle;

    impl TextGenerator for EchoStyle {
        fn generate(
            &mut self,
            prompt: &str,
            _params: &SamplingParams,
        ) -> assetgen_prompt::Result<String> {
            let style = prompt
                .lines()
                .find_map(|l| l.strip_prefix("Style: "))
                .unwrap_or("")
                .trim_end_matches("</s>");
            Ok(format!("Positive Prompt: {}", style))
        }
    }

    fn session(script: &str) -> String {
        let mut enhancer = PromptEnhancer::new(EchoStyle);
        let mut input = Cursor::new(script.as_bytes().to_vec());
        let mut output = Vec::new();
        interactive(&mut enhancer, "cinematic", &mut input, &mut output).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_quit_immediately() {
        let out = session("q\n");
        assert_eq!(out, IDEA_QUESTION);
    }

    #[test]
    fn test_one_round_then_end_of_input() {
        let out = session("a dragon\npixel art\n");
        assert!(out.contains("\nGenerating...\n"));
        assert!(out.contains(&format!("Positive: pixel art, {}\n", REQUIRED_POSITIVE)));
        assert!(out.contains(&format!("Negative: {}\n", REQUIRED_NEGATIVE)));
        assert_eq!(out.matches(IDEA_QUESTION).count(), 2);
    }

    #[test]
    fn test_blank_style_falls_back() {
        let out = session("a dragon\n\nQ\n");
        assert!(out.contains(&format!("Positive: cinematic, {}\n", REQUIRED_POSITIVE)));
    }
}
