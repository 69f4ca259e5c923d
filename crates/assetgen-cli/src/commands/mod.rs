//! CLI commands

pub mod enhance;
pub mod generate;
pub mod loras;

use assetgen_core::DevicePreference;

/// Execution device flag
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum DeviceArg {
    /// CUDA, then MPS, then CPU
    Auto,
    /// Apple GPU
    Mps,
    /// NVIDIA GPU
    Cuda,
    Cpu,
}

impl From<DeviceArg> for DevicePreference {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Auto => DevicePreference::Auto,
            DeviceArg::Mps => DevicePreference::Mps,
            DeviceArg::Cuda => DevicePreference::Cuda,
            DeviceArg::Cpu => DevicePreference::Cpu,
        }
    }
}
