//! Multistep scheduler configuration
//!
//! The model's own `scheduler_config.json` only contributes what the
//! multistep solver needs to agree with training: the prediction type and the
//! number of training timesteps. Everything else uses the solver defaults.

use crate::error::{DiffusionError, Result};
use candle_transformers::models::stable_diffusion::schedulers::{
    PredictionType, Scheduler, SchedulerConfig,
};
use candle_transformers::models::stable_diffusion::uni_pc::UniPCSchedulerConfig;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

const DEFAULT_TRAIN_TIMESTEPS: usize = 1000;

/// Fields read from `scheduler/scheduler_config.json`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_prediction_type")]
    pub prediction_type: String,
    #[serde(default = "default_train_timesteps")]
    pub num_train_timesteps: usize,
}

fn default_prediction_type() -> String {
    "epsilon".to_string()
}

fn default_train_timesteps() -> usize {
    DEFAULT_TRAIN_TIMESTEPS
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            prediction_type: default_prediction_type(),
            num_train_timesteps: DEFAULT_TRAIN_TIMESTEPS,
        }
    }
}

impl SchedulerSettings {
    /// Read settings from a scheduler config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| DiffusionError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Settings from an optional file; unreadable files fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            debug!("No scheduler config, using defaults");
            return Self::default();
        };
        match Self::from_file(path) {
            Ok(settings) => {
                debug!(?settings, "Loaded scheduler config");
                settings
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring scheduler config");
                Self::default()
            }
        }
    }

    pub fn prediction(&self) -> PredictionType {
        match self.prediction_type.as_str() {
            "v_prediction" => PredictionType::VPrediction,
            "sample" => PredictionType::Sample,
            _ => PredictionType::Epsilon,
        }
    }

    /// UniPC configuration replacing the model's default scheduler
    pub fn unipc(&self) -> UniPCSchedulerConfig {
        UniPCSchedulerConfig {
            prediction_type: self.prediction(),
            num_training_timesteps: self.num_train_timesteps,
            ..Default::default()
        }
    }

    /// Build a scheduler for `steps` inference steps
    pub fn build(&self, steps: usize) -> Result<Box<dyn Scheduler>> {
        Ok(self.unipc().build(steps)?)
    }
}
