//! assetgen diffusion - SDXL inference on candle
//!
//! Builds an SDXL pipeline from local weights only, fuses any number of LoRA
//! adapters into it, and runs single text-to-image generations.
//!
//! # Features
//!
//! - `cuda`: NVIDIA GPUs
//! - `metal`: Apple GPUs (the `mps` device)
//! - `flash-attn`: flash attention in the UNet on CUDA
//!
//! Without accelerator features everything runs on the CPU in f32.

pub mod checkpoint;
pub mod device;
pub mod error;
pub mod ldm;
pub mod lora;
pub mod output;
pub mod pipeline;
pub mod scheduler;

pub use checkpoint::{CheckpointSource, Component};
pub use device::{CandleProbe, candle_device, device_for};
pub use error::{DiffusionError, Result};
pub use lora::{FuseReport, LoraAdapter, LoraInjector};
pub use output::GeneratedImage;
pub use pipeline::{GenerationRequest, PipelineBuilder, Residency, SdxlPipeline};
pub use scheduler::SchedulerSettings;
