use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::Device;
use tracing::info;

use super::pipeline::Pipeline;
use crate::error::Result;
use crate::model::{create_model, ModelLoader};
use crate::tokenizer::{create_tokenizer, TruncationPolicy};
use crate::Features;

/// Builder for loading a [`Pipeline`] from disk
pub struct PipelineBuilder {
    path: PathBuf,
    max_length: Option<usize>,
    device: Option<Device>,
    truncation: TruncationPolicy,
    seed: Option<u64>,
}

impl PipelineBuilder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_length: None,
            device: None,
            truncation: TruncationPolicy::default(),
            seed: None,
        }
    }

    /// Overrides the model's `max_length`, which also sizes the KV cache
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Set the compute device; defaults to [`Features::preferred_device`]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_truncation(mut self, truncation: TruncationPolicy) -> Self {
        self.truncation = truncation;
        self
    }

    /// Seed the sampler for reproducible output
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Load config, tokenizer and weights, then assemble the pipeline
    pub fn build(self) -> Result<Pipeline> {
        let loader = ModelLoader::new(&self.path)?;
        let config = loader.load_config(self.max_length)?;
        let generation_config = loader.load_generation_config()?.unwrap_or_default();

        let codec = loader.load_codec()?;
        let tokenizer = create_tokenizer(&config, Arc::new(codec), self.truncation)?;

        let device = self.device.unwrap_or_else(Features::preferred_device);
        let state_dict = loader.load_state_dict(&device)?;
        let mut model = create_model(config, &device)?;
        model.load_state_dict(state_dict)?;
        info!(
            model_type = %model.config().model_type,
            device = ?device,
            "Pipeline ready"
        );

        let pipeline = Pipeline::from_parts(model, Arc::from(tokenizer))
            .with_generation_config(generation_config);
        Ok(match self.seed {
            Some(seed) => pipeline.with_seed(seed),
            None => pipeline,
        })
    }
}
