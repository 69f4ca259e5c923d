//! Execution device selection
//!
//! Picks one of three mutually exclusive backends and the numeric precision
//! that goes with it. Availability is asked of an [`AcceleratorProbe`] so the
//! selection rules can be exercised without real hardware.

use crate::error::{ResolveError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Execution backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// NVIDIA GPU
    Cuda,
    /// Apple GPU (Metal)
    Mps,
    /// Host CPU
    Cpu,
}

impl Backend {
    /// Lowercase identifier as used on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Cuda => "cuda",
            Backend::Mps => "mps",
            Backend::Cpu => "cpu",
        }
    }

    /// Whether this is an accelerator
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Backend::Cpu)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cuda => write!(f, "CUDA"),
            Backend::Mps => write!(f, "MPS"),
            Backend::Cpu => write!(f, "CPU"),
        }
    }
}

/// Numeric precision paired with a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    /// 16-bit floats
    Half,
    /// 32-bit floats
    Full,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Half => write!(f, "float16"),
            Precision::Full => write!(f, "float32"),
        }
    }
}

/// User device preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Mps,
    Cuda,
    Cpu,
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "mps" => Ok(Self::Mps),
            "cuda" => Ok(Self::Cuda),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown device '{}'", other)),
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Mps => "mps",
            Self::Cuda => "cuda",
            Self::Cpu => "cpu",
        };
        f.write_str(s)
    }
}

/// Reports which accelerators the running binary can use
pub trait AcceleratorProbe {
    fn cuda_available(&self) -> bool;
    fn mps_available(&self) -> bool;
}

/// Fixed availability, mostly useful in tests and for forcing CPU
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe {
    pub cuda: bool,
    pub mps: bool,
}

impl AcceleratorProbe for StaticProbe {
    fn cuda_available(&self) -> bool {
        self.cuda
    }

    fn mps_available(&self) -> bool {
        self.mps
    }
}

/// The outcome of device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSelection {
    pub backend: Backend,
    pub precision: Precision,
}

impl DeviceSelection {
    fn for_backend(backend: Backend) -> Self {
        let precision = if backend.is_accelerator() {
            Precision::Half
        } else {
            Precision::Full
        };
        Self { backend, precision }
    }
}

impl fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.backend.as_str(), self.precision)
    }
}

/// Select a backend for the given preference.
///
/// An explicit accelerator that the probe reports missing is an error. `auto`
/// tries CUDA, then MPS, then falls back to CPU.
pub fn select_device(
    preference: DevicePreference,
    probe: &impl AcceleratorProbe,
) -> Result<DeviceSelection> {
    let backend = match preference {
        DevicePreference::Cuda => {
            if !probe.cuda_available() {
                return Err(ResolveError::DeviceUnavailable(Backend::Cuda));
            }
            Backend::Cuda
        }
        DevicePreference::Mps => {
            if !probe.mps_available() {
                return Err(ResolveError::DeviceUnavailable(Backend::Mps));
            }
            Backend::Mps
        }
        DevicePreference::Cpu => Backend::Cpu,
        DevicePreference::Auto => {
            if probe.cuda_available() {
                Backend::Cuda
            } else if probe.mps_available() {
                Backend::Mps
            } else {
                Backend::Cpu
            }
        }
    };

    let selection = DeviceSelection::for_backend(backend);
    debug!(%preference, %selection, "Selected device");
    Ok(selection)
}
