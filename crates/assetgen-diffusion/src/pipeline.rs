//! SDXL text-to-image pipeline
//!
//! [`PipelineBuilder`] turns a resolved base model, a device selection and a
//! list of adapters into a ready [`SdxlPipeline`]:
//!
//! 1. Classify the checkpoint (single file or diffusers directory)
//! 2. Read component weights into host memory, preferring `fp16` files for
//!    half precision
//! 3. Fuse LoRA adapters in order
//! 4. Configure the multistep scheduler from the model's scheduler config
//! 5. Bind to the device: everything resident, or one stage at a time
//!
//! Generation is the usual SDXL loop: both CLIP encoders, optional
//! classifier-free guidance, seeded latent noise, denoising and VAE decode.

use crate::checkpoint::{CheckpointSource, Component, HostWeights, TensorMap};
use crate::device::device_for;
use crate::error::{DiffusionError, Result};
use crate::lora::LoraInjector;
use crate::output::GeneratedImage;
use crate::scheduler::SchedulerSettings;
use assetgen_core::{Backend, DeviceSelection, Layout, LoraSpec, Precision, Prompts, RunConfiguration};
use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip::{self, ClipTextTransformer};
use candle_transformers::models::stable_diffusion::unet_2d::{
    BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig,
};
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::fmt;
use std::path::PathBuf;
use tokenizers::Tokenizer;
use tracing::{debug, info, info_span};

/// SDXL VAE latent scaling factor
pub const VAE_SCALE: f64 = 0.13025;
/// Latent channels of the SDXL UNet and VAE
pub const LATENT_CHANNELS: usize = 4;
/// Pixel size of one latent cell
pub const LATENT_STRIDE: usize = 8;

const DEFAULT_PAD_TOKEN: &str = "<|endoftext|>";

/// How component modules are kept on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// All modules built once and kept on the device
    Full,
    /// Weights stay on the host; each module is built for its stage and
    /// dropped afterwards
    Sequential,
}

impl Residency {
    /// Sequential on MPS, resident elsewhere
    pub fn for_backend(backend: Backend) -> Self {
        match backend {
            Backend::Mps => Residency::Sequential,
            Backend::Cuda | Backend::Cpu => Residency::Full,
        }
    }
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Residency::Full => write!(f, "resident"),
            Residency::Sequential => write!(f, "sequential"),
        }
    }
}

/// Parameters of a single inference call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub positive: String,
    pub negative: String,
    pub height: usize,
    pub width: usize,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(cfg: &RunConfiguration, prompts: Prompts) -> Self {
        Self {
            positive: prompts.positive,
            negative: prompts.negative,
            height: cfg.height,
            width: cfg.width,
            steps: cfg.steps,
            guidance_scale: cfg.guidance_scale,
            seed: cfg.seed,
        }
    }

    /// Classifier-free guidance is only run above 1.0
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }

    pub fn validate(&self) -> Result<()> {
        let ok = |v: usize| v > 0 && v % LATENT_STRIDE == 0;
        if !ok(self.height) || !ok(self.width) {
            return Err(DiffusionError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

/// Builder for [`SdxlPipeline`]
pub struct PipelineBuilder {
    base_model: PathBuf,
    selection: DeviceSelection,
    layout: Layout,
    loras: Vec<LoraSpec>,
    residency: Option<Residency>,
}

impl PipelineBuilder {
    pub fn new(base_model: impl Into<PathBuf>, selection: DeviceSelection) -> Self {
        Self {
            base_model: base_model.into(),
            selection,
            layout: Layout::new("."),
            loras: Vec::new(),
            residency: None,
        }
    }

    /// Directory layout used for shared tokenizers
    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Adapters to fuse, in order
    pub fn loras(mut self, loras: Vec<LoraSpec>) -> Self {
        self.loras = loras;
        self
    }

    /// Override the backend's default residency
    pub fn residency(mut self, residency: Residency) -> Self {
        self.residency = Some(residency);
        self
    }

    pub fn build(self) -> Result<SdxlPipeline> {
        let _span = info_span!("build_pipeline", model = %self.base_model.display()).entered();

        let source = CheckpointSource::detect(&self.base_model)?;
        let injector = LoraInjector::from_specs(&self.loras)?;

        let tokenizer = load_tokenizer(&source, &self.layout, Component::TextEncoder)?;
        let tokenizer_2 = load_tokenizer(&source, &self.layout, Component::TextEncoder2)?;

        let (device, dtype) = device_for(self.selection)?;
        let prefer_fp16 = self.selection.precision == Precision::Half;
        let mut weights = source.load_host_weights(prefer_fp16)?;

        if !injector.is_empty() {
            injector.apply(&mut weights)?;
        }

        let scheduler = SchedulerSettings::load_or_default(source.scheduler_config().as_deref());
        let use_flash_attn = flash_attention(self.selection.backend);
        let residency = self
            .residency
            .unwrap_or_else(|| Residency::for_backend(self.selection.backend));

        let stages = match residency {
            Residency::Full => Stages::Resident(Box::new(ResidentModels {
                clip: build_clip(&weights.text_encoder, Component::TextEncoder, &device)?,
                clip_2: build_clip(&weights.text_encoder_2, Component::TextEncoder2, &device)?,
                unet: build_unet(&weights.unet, &device, dtype, use_flash_attn)?,
                vae: build_vae(&weights.vae, &device)?,
            })),
            Residency::Sequential => Stages::Host(weights),
        };

        info!(
            device = %self.selection,
            %residency,
            loras = injector.len(),
            "Pipeline ready"
        );

        Ok(SdxlPipeline {
            selection: self.selection,
            residency,
            device,
            dtype,
            tokenizer,
            tokenizer_2,
            scheduler,
            use_flash_attn,
            stages,
        })
    }
}

struct ResidentModels {
    clip: ClipTextTransformer,
    clip_2: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

enum Stages {
    Resident(Box<ResidentModels>),
    Host(HostWeights),
}

/// A loaded SDXL pipeline
pub struct SdxlPipeline {
    selection: DeviceSelection,
    residency: Residency,
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    tokenizer_2: Tokenizer,
    scheduler: SchedulerSettings,
    use_flash_attn: bool,
    stages: Stages,
}

impl SdxlPipeline {
    pub fn selection(&self) -> DeviceSelection {
        self.selection
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Run one text-to-image generation
    pub fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage> {
        request.validate()?;
        let _span = info_span!(
            "generate",
            steps = request.steps,
            height = request.height,
            width = request.width
        )
        .entered();

        let guided = request.uses_guidance();
        let embeddings = self.encode_prompts(&request.positive, &request.negative, guided)?;
        let latents = self.denoise(&embeddings, request, guided)?;
        self.decode(&latents)
    }

    /// Concatenated hidden states of both text encoders; unconditional first
    /// when guided
    fn encode_prompts(&self, positive: &str, negative: &str, guided: bool) -> Result<Tensor> {
        let first = self.encode(Component::TextEncoder, positive, negative, guided)?;
        let second = self.encode(Component::TextEncoder2, positive, negative, guided)?;
        Ok(Tensor::cat(&[first, second], D::Minus1)?.to_dtype(self.dtype)?)
    }

    fn encode(&self, encoder: Component, positive: &str, negative: &str, guided: bool) -> Result<Tensor> {
        let tokenizer = match encoder {
            Component::TextEncoder2 => &self.tokenizer_2,
            _ => &self.tokenizer,
        };
        let config = clip_config(encoder);
        let cond_ids = token_ids(tokenizer, &config, positive, &self.device)?;
        let uncond_ids = if guided {
            Some(token_ids(tokenizer, &config, negative, &self.device)?)
        } else {
            None
        };

        self.with_text_encoder(encoder, |model| {
            let cond = model.forward(&cond_ids)?;
            match &uncond_ids {
                Some(ids) => {
                    let uncond = model.forward(ids)?;
                    Ok(Tensor::cat(&[uncond, cond], 0)?)
                }
                None => Ok(cond),
            }
        })
    }

    fn denoise(&self, embeddings: &Tensor, request: &GenerationRequest, guided: bool) -> Result<Tensor> {
        let mut scheduler = self.scheduler.build(request.steps)?;
        let shape = (
            1,
            LATENT_CHANNELS,
            request.height / LATENT_STRIDE,
            request.width / LATENT_STRIDE,
        );
        let noise = initial_noise(shape, request.seed, &self.device)?;
        let latents = (noise * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;
        let timesteps = scheduler.timesteps().to_vec();

        self.with_unet(|unet| {
            let mut latents = latents;
            for (index, &timestep) in timesteps.iter().enumerate() {
                let input = if guided {
                    Tensor::cat(&[&latents, &latents], 0)?
                } else {
                    latents.clone()
                };
                let input = scheduler.scale_model_input(input, timestep)?;
                let noise_pred = unet.forward(&input, timestep as f64, embeddings)?;

                let noise_pred = if guided {
                    let chunks = noise_pred.chunk(2, 0)?;
                    let (uncond, cond) = (&chunks[0], &chunks[1]);
                    (uncond + ((cond - uncond)? * request.guidance_scale)?)?
                } else {
                    noise_pred
                };

                latents = scheduler.step(&noise_pred, timestep, &latents)?;
                debug!(step = index + 1, of = timesteps.len(), timestep, "Denoised");
            }
            Ok(latents)
        })
    }

    fn decode(&self, latents: &Tensor) -> Result<GeneratedImage> {
        let latents = (latents.to_dtype(DType::F32)? / VAE_SCALE)?;
        let decoded = self.with_vae(|vae| Ok(vae.decode(&latents)?))?;
        let image = ((decoded / 2.)? + 0.5)?;
        GeneratedImage::from_tensor(&image)
    }

    fn with_text_encoder<T>(
        &self,
        encoder: Component,
        f: impl FnOnce(&ClipTextTransformer) -> Result<T>,
    ) -> Result<T> {
        match &self.stages {
            Stages::Resident(m) => match encoder {
                Component::TextEncoder2 => f(&m.clip_2),
                _ => f(&m.clip),
            },
            Stages::Host(w) => {
                debug!(component = %encoder, "Loading stage");
                let model = build_clip(w.get(encoder), encoder, &self.device)?;
                f(&model)
            }
        }
    }

    fn with_unet<T>(&self, f: impl FnOnce(&UNet2DConditionModel) -> Result<T>) -> Result<T> {
        match &self.stages {
            Stages::Resident(m) => f(&m.unet),
            Stages::Host(w) => {
                debug!(component = %Component::Unet, "Loading stage");
                let model = build_unet(&w.unet, &self.device, self.dtype, self.use_flash_attn)?;
                f(&model)
            }
        }
    }

    fn with_vae<T>(&self, f: impl FnOnce(&AutoEncoderKL) -> Result<T>) -> Result<T> {
        match &self.stages {
            Stages::Resident(m) => f(&m.vae),
            Stages::Host(w) => {
                debug!(component = %Component::Vae, "Loading stage");
                let model = build_vae(&w.vae, &self.device)?;
                f(&model)
            }
        }
    }
}

fn load_tokenizer(source: &CheckpointSource, layout: &Layout, encoder: Component) -> Result<Tokenizer> {
    let path = source.tokenizer_file(layout, encoder)?;
    debug!(%encoder, path = %path.display(), "Loading tokenizer");
    Tokenizer::from_file(&path).map_err(|e| DiffusionError::Tokenizer(e.to_string()))
}

fn clip_config(encoder: Component) -> clip::Config {
    match encoder {
        Component::TextEncoder2 => clip::Config::sdxl2(),
        _ => clip::Config::sdxl(),
    }
}

/// Token ids padded (or truncated) to the encoder's context length
fn token_ids(tokenizer: &Tokenizer, config: &clip::Config, prompt: &str, device: &Device) -> Result<Tensor> {
    let pad = config.pad_with.as_deref().unwrap_or(DEFAULT_PAD_TOKEN);
    let pad_id = tokenizer
        .get_vocab(true)
        .get(pad)
        .copied()
        .ok_or_else(|| DiffusionError::Tokenizer(format!("pad token '{}' not in vocabulary", pad)))?;

    let mut ids = tokenizer
        .encode(prompt, true)
        .map_err(|e| DiffusionError::Tokenizer(e.to_string()))?
        .get_ids()
        .to_vec();

    let max_len = config.max_position_embeddings;
    if ids.len() > max_len {
        debug!(tokens = ids.len(), max_len, "Truncating prompt");
        ids.truncate(max_len);
    }
    ids.resize(max_len, pad_id);

    Ok(Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?)
}

/// Text encoders always run in f32
fn build_clip(weights: &TensorMap, encoder: Component, device: &Device) -> Result<ClipTextTransformer> {
    let vb = VarBuilder::from_tensors(weights.clone(), DType::F32, device);
    Ok(ClipTextTransformer::new(vb, &clip_config(encoder))?)
}

fn build_unet(
    weights: &TensorMap,
    device: &Device,
    dtype: DType,
    use_flash_attn: bool,
) -> Result<UNet2DConditionModel> {
    let vb = VarBuilder::from_tensors(weights.clone(), dtype, device);
    Ok(UNet2DConditionModel::new(
        vb,
        LATENT_CHANNELS,
        LATENT_CHANNELS,
        use_flash_attn,
        sdxl_unet_config(),
    )?)
}

/// The SDXL VAE overflows in f16, so it is kept in f32
fn build_vae(weights: &TensorMap, device: &Device) -> Result<AutoEncoderKL> {
    let vb = VarBuilder::from_tensors(weights.clone(), DType::F32, device);
    Ok(AutoEncoderKL::new(vb, 3, 3, sdxl_vae_config())?)
}

pub fn sdxl_unet_config() -> UNet2DConditionModelConfig {
    let block = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim,
    };
    UNet2DConditionModelConfig {
        blocks: vec![
            block(320, None, 5),
            block(640, Some(2), 10),
            block(1280, Some(10), 20),
        ],
        center_input_sample: false,
        cross_attention_dim: 2048,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size: None,
        use_linear_projection: true,
    }
}

pub fn sdxl_vae_config() -> AutoEncoderKLConfig {
    AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: LATENT_CHANNELS,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}

/// Flash attention is only available on CUDA builds with the `flash-attn`
/// feature
fn flash_attention(backend: Backend) -> bool {
    if backend != Backend::Cuda {
        return false;
    }
    if cfg!(feature = "flash-attn") {
        info!("Flash attention enabled");
        true
    } else {
        info!("Flash attention not compiled in, using standard attention");
        false
    }
}

/// Standard normal latent noise drawn on the host so a seed gives the same
/// latents on every backend
pub fn initial_noise(
    shape: (usize, usize, usize, usize),
    seed: Option<u64>,
    device: &Device,
) -> Result<Tensor> {
    let rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_os_rng(),
    };

    let count = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = rng.sample_iter(StandardNormal).take(count).collect();

    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?.to_device(device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cpu() -> DeviceSelection {
        DeviceSelection {
            backend: Backend::Cpu,
            precision: Precision::Full,
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            positive: "a treasure chest".into(),
            negative: "blurry".into(),
            height: 1024,
            width: 1024,
            steps: 4,
            guidance_scale: 0.0,
            seed: Some(42),
        }
    }

    #[test]
    fn test_residency_per_backend() {
        assert_eq!(Residency::for_backend(Backend::Mps), Residency::Sequential);
        assert_eq!(Residency::for_backend(Backend::Cuda), Residency::Full);
        assert_eq!(Residency::for_backend(Backend::Cpu), Residency::Full);
    }

    #[test]
    fn test_request_from_config() {
        let cfg = RunConfiguration {
            height: 768,
            width: 512,
            steps: 8,
            guidance_scale: 5.0,
            seed: Some(3),
            ..Default::default()
        };
        let prompts = Prompts {
            positive: "p".into(),
            negative: "n".into(),
        };
        let req = GenerationRequest::new(&cfg, prompts);
        assert_eq!((req.height, req.width, req.steps), (768, 512, 8));
        assert!(req.uses_guidance());
        assert_eq!(req.seed, Some(3));
    }

    #[test]
    fn test_guidance_threshold() {
        let mut req = request();
        assert!(!req.uses_guidance());
        req.guidance_scale = 1.0;
        assert!(!req.uses_guidance());
        req.guidance_scale = 1.5;
        assert!(req.uses_guidance());
    }

    #[test]
    fn test_dimensions_must_be_multiples_of_eight() {
        assert!(request().validate().is_ok());

        let mut req = request();
        req.width = 1020;
        assert!(matches!(
            req.validate(),
            Err(DiffusionError::InvalidDimensions { width: 1020, .. })
        ));

        req.width = 0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let a = initial_noise((1, 4, 2, 3), Some(7), &Device::Cpu).unwrap();
        let b = initial_noise((1, 4, 2, 3), Some(7), &Device::Cpu).unwrap();
        let c = initial_noise((1, 4, 2, 3), Some(8), &Device::Cpu).unwrap();

        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        let c: Vec<f32> = c.flatten_all().unwrap().to_vec1().unwrap();

        assert_eq!(a.len(), 24);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_noise_fills_odd_shapes() {
        let noise = initial_noise((1, 1, 1, 3), Some(5), &Device::Cpu).unwrap();
        assert_eq!(noise.dims(), &[1, 1, 1, 3]);
        assert_eq!(noise.dtype(), DType::F32);
    }

    #[test]
    fn test_noise_is_roughly_standard_normal() {
        let noise = initial_noise((1, 4, 64, 64), Some(1), &Device::Cpu).unwrap();
        let values: Vec<f32> = noise.flatten_all().unwrap().to_vec1().unwrap();
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.05, "mean {}", mean);
        assert!((var - 1.0).abs() < 0.1, "variance {}", var);
    }

    #[test]
    fn test_missing_model_fails() {
        let dir = TempDir::new().unwrap();
        let err = PipelineBuilder::new(dir.path().join("nope"), cpu())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, DiffusionError::ModelNotFound(_)));
    }

    #[test]
    fn test_missing_lora_fails_before_loading_weights() {
        let dir = TempDir::new().unwrap();
        let err = PipelineBuilder::new(dir.path(), cpu())
            .loras(vec![LoraSpec::new(dir.path(), "absent.safetensors")])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, DiffusionError::LoraNotFound(_)));
    }

    #[test]
    fn test_missing_tokenizer_fails() {
        let dir = TempDir::new().unwrap();
        let err = PipelineBuilder::new(dir.path(), cpu())
            .layout(Layout::new(dir.path()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, DiffusionError::Tokenizer(_)));
    }

    #[test]
    fn test_sdxl_configs() {
        let unet = sdxl_unet_config();
        assert_eq!(unet.cross_attention_dim, 2048);
        assert_eq!(unet.blocks.len(), 3);
        assert_eq!(sdxl_vae_config().block_out_channels, vec![128, 256, 512, 512]);
    }
}
