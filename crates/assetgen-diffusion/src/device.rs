//! Mapping device selections onto candle devices

use assetgen_core::{AcceleratorProbe, Backend, DeviceSelection, Precision};
use candle_core::{DType, Device};
use tracing::debug;

/// Reports what the running binary was compiled to use.
///
/// Accelerator support is a build feature (`cuda`, `metal`), so an accelerator
/// that was not compiled in is reported as unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleProbe;

impl AcceleratorProbe for CandleProbe {
    fn cuda_available(&self) -> bool {
        candle_core::utils::cuda_is_available()
    }

    fn mps_available(&self) -> bool {
        candle_core::utils::metal_is_available()
    }
}

/// Open the candle device for a backend
pub fn candle_device(backend: Backend) -> candle_core::Result<Device> {
    let device = match backend {
        Backend::Cuda => Device::new_cuda(0)?,
        Backend::Mps => Device::new_metal(0)?,
        Backend::Cpu => Device::Cpu,
    };
    debug!(%backend, "Opened device");
    Ok(device)
}

/// Tensor dtype for a precision
pub fn dtype(precision: Precision) -> DType {
    match precision {
        Precision::Half => DType::F16,
        Precision::Full => DType::F32,
    }
}

/// Device and dtype for a selection
pub fn device_for(selection: DeviceSelection) -> candle_core::Result<(Device, DType)> {
    Ok((candle_device(selection.backend)?, dtype(selection.precision)))
}
