//! Generate command

use super::DeviceArg;
use assetgen_core::{
    CliOverrides, DeviceSelection, Environment, LayerStack, Layout,
    LoraSpec, ModelResolver, RunConfiguration, load_config, resolve_prompts, select_device,
};
use assetgen_diffusion::{CandleProbe, GenerationRequest, PipelineBuilder};
use clap::Args;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

#[derive(Args, Debug, Clone, Default)]
pub struct GenerateArgs {
    /// Base model: checkpoint file, diffusers directory or name under models/checkpoints
    #[arg(long)]
    pub base_model: Option<String>,

    /// LoRA file, directory or name under models/loras ('none' disables)
    #[arg(long)]
    pub lora: Option<String>,

    /// Weight file inside the LoRA directory
    #[arg(long)]
    pub lora_weight: Option<String>,

    /// Execution device
    #[arg(long, value_enum)]
    pub device: Option<DeviceArg>,

    /// Image height in pixels
    #[arg(long)]
    pub height: Option<usize>,

    /// Image width in pixels
    #[arg(long)]
    pub width: Option<usize>,

    /// Denoising steps
    #[arg(long)]
    pub steps: Option<usize>,

    /// Classifier-free guidance scale
    #[arg(long)]
    pub guidance_scale: Option<f64>,

    /// Noise seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Directory for generated images
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Image file name prefix
    #[arg(long)]
    pub filename_prefix: Option<String>,

    /// JSON config file (defaults to pipeline.json under the program root)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl GenerateArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            base_model: self.base_model.clone(),
            lora: self.lora.clone(),
            lora_weight: self.lora_weight.clone(),
            device: self.device.map(Into::into),
            height: self.height,
            width: self.width,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            seed: self.seed,
            output_dir: self.output_dir.clone(),
            filename_prefix: self.filename_prefix.clone(),
        }
    }
}

pub fn run(args: GenerateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let env = Environment::from_process();
    let layout = Layout::discover(&env)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| layout.default_config_path());
    let file = load_config(&config_path);
    let overrides = args.overrides();
    let cfg = LayerStack::standard(&layout, &env, &overrides, &file).resolve();

    let selection = select_device(cfg.device, &CandleProbe)?;

    let resolver = ModelResolver::new(&layout, &env);
    let base_model = resolver.resolve_base_model(cfg.base_model.as_deref())?;
    let loras = resolver.resolve_adapters(&cfg)?;

    let stdout = io::stdout();
    print_summary(
        &mut stdout.lock(),
        &cfg,
        selection,
        &base_model,
        &loras,
        cfg.has_lora_list(),
    )?;

    let pipeline = PipelineBuilder::new(base_model.clone(), selection)
        .layout(layout.clone())
        .loras(loras)
        .build()?;

    let prompts = resolve_prompts(&cfg, &mut io::stdin().lock(), &mut stdout.lock())?;
    let request = GenerationRequest::new(&cfg, prompts);

    std::fs::create_dir_all(layout.outputs_dir())?;
    std::fs::create_dir_all(&cfg.output_dir)?;

    let image = pipeline.generate(&request)?;
    let output_path = cfg.output_file(unix_timestamp());
    image.save(&output_path)?;
    info!(path = %output_path.display(), "Generation complete");

    println!("Image saved to {}", output_path.display());
    Ok(())
}

/// Print the resolved run configuration
fn print_summary(
    out: &mut impl Write,
    cfg: &RunConfiguration,
    selection: DeviceSelection,
    base_model: &Path,
    loras: &[LoraSpec],
    from_list: bool,
) -> io::Result<()> {
    writeln!(out, "Pipeline configuration:")?;
    writeln!(
        out,
        "  Device: {} ({})",
        selection.backend.as_str(),
        selection.precision
    )?;
    writeln!(out, "  Base model path: {}", base_model.display())?;

    match loras {
        [] => writeln!(out, "  LoRA: disabled")?,
        [single] if !from_list => {
            writeln!(out, "  LoRA path: {}", single.location.display())?;
            writeln!(out, "  LoRA weight file: {}", single.weight_name)?;
        }
        many => {
            writeln!(out, "  LoRAs:")?;
            for lora in many {
                writeln!(out, "    - {}", lora)?;
            }
        }
    }

    writeln!(out, "  Height x Width: {} x {}", cfg.height, cfg.width)?;
    writeln!(out, "  Steps: {}", cfg.steps)?;
    writeln!(out, "  Guidance scale: {}", cfg.guidance_scale)?;
    if let Some(seed) = cfg.seed {
        writeln!(out, "  Seed: {}", seed)?;
    }
    writeln!(out, "  Output directory: {}", cfg.output_dir.display())?;
    writeln!(out, "  Filename prefix: {}", cfg.filename_prefix)?;
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetgen_core::{Backend, Precision};

    fn selection() -> DeviceSelection {
        DeviceSelection {
            backend: Backend::Cpu,
            precision: Precision::Full,
        }
    }

    fn summary(cfg: &RunConfiguration, loras: &[LoraSpec], from_list: bool) -> String {
        let mut out = Vec::new();
        print_summary(
            &mut out,
            cfg,
            selection(),
            Path::new("/models/sdxl"),
            loras,
            from_list,
        )
        .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_overrides_carry_every_flag() {
        let args = GenerateArgs {
            base_model: Some("sdxl".into()),
            lora: Some("none".into()),
            steps: Some(8),
            seed: Some(3),
            output_dir: Some(PathBuf::from("out")),
            ..Default::default()
        };
        let o = args.overrides();
        assert_eq!(o.base_model.as_deref(), Some("sdxl"));
        assert_eq!(o.lora.as_deref(), Some("none"));
        assert_eq!(o.steps, Some(8));
        assert_eq!(o.seed, Some(3));
        assert_eq!(o.output_dir, Some(PathBuf::from("out")));
        assert!(o.height.is_none());
    }

    #[test]
    fn test_summary_without_lora() {
        let text = summary(&RunConfiguration::default(), &[], false);
        assert!(text.starts_with("Pipeline configuration:\n  Device: cpu (float32)\n"));
        assert!(text.contains("  Base model path: /models/sdxl\n"));
        assert!(text.contains("  LoRA: disabled\n"));
        assert!(text.contains("  Height x Width: 1024 x 1024\n"));
        assert!(!text.contains("Seed"));
    }

    #[test]
    fn test_summary_single_lora() {
        let cfg = RunConfiguration {
            seed: Some(42),
            ..Default::default()
        };
        let text = summary(&cfg, &[LoraSpec::new("/loras", "style.safetensors")], false);
        assert!(text.contains("  LoRA path: /loras\n  LoRA weight file: style.safetensors\n"));
        assert!(text.contains("  Seed: 42\n"));
    }

    #[test]
    fn test_summary_lora_list() {
        let loras = [
            LoraSpec::new("/loras", "a.safetensors"),
            LoraSpec::new("/loras", "b.safetensors").with_scale(0.5),
        ];
        let text = summary(&RunConfiguration::default(), &loras, true);
        assert!(text.contains("  LoRAs:\n    - /loras :: a.safetensors\n    - /loras :: b.safetensors (scale 0.5)\n"));
    }
}
