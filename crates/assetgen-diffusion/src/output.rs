//! Decoded image output

use crate::error::Result;
use candle_core::{DType, Device, Tensor};
use std::path::Path;
use tracing::info;

/// An RGB8 image produced by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB bytes
    pub data: Vec<u8>,
}

impl GeneratedImage {
    /// Convert a `(3, H, W)` or `(1, 3, H, W)` tensor with values in `[0, 1]`
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let tensor = if tensor.rank() == 4 {
            tensor.squeeze(0)?
        } else {
            tensor.clone()
        };

        let pixels = (tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * 255.)?
            .round()?
            .to_dtype(DType::U8)?;
        let (_channels, height, width) = pixels.dims3()?;
        let data = pixels.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;

        Ok(Self {
            width: width as u32,
            height: height as u32,
            data,
        })
    }

    /// Write as PNG
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        image::save_buffer_with_format(
            path,
            &self.data,
            self.width,
            self.height,
            image::ColorType::Rgb8,
            image::ImageFormat::Png,
        )?;
        info!(path = %path.display(), width = self.width, height = self.height, "Saved image");
        Ok(())
    }
}
