//! GLM Engine - local inference for the ChatGLM family of chat models
//!
//! This crate runs ChatGLM, ChatGLM2, ChatGLM3, GLM-4 and GLM-4V checkpoints
//! end to end: chat templates and tool-call parsing, a KV-cached decode loop
//! on top of candle, and configurable sampling.
//!
//! ```no_run
//! use glm_engine::{ChatMessage, GenerationConfig, Pipeline};
//!
//! # fn main() -> glm_engine::Result<()> {
//! let mut pipeline = Pipeline::new("models/chatglm3-6b", None)?;
//! let reply = pipeline.chat(&[ChatMessage::user("Hello")], &GenerationConfig::default())?;
//! println!("{}", reply.content);
//! # Ok(())
//! # }
//! ```

use std::fmt;

use candle_core::Device;

// Public modules
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod sampler;
pub mod tokenizer;
pub mod types;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MIN_RUST_VERSION: &str = "1.70.0";

// Re-exports for public API
pub use config::{GenerationConfig, ModelConfig, ModelType, VisionModelConfig};
pub use engine::{
    AsyncPipeline, CancellationFlag, ChatResponse, GenerationOutput, Pipeline, PipelineBuilder,
    StopReason, Streamer, TextStreamer,
};
pub use error::{EngineError, Result};
pub use tokenizer::TruncationPolicy;
pub use types::{ChatMessage, CodeMessage, FunctionMessage, Image, Role, ToolCallMessage};
pub use utils::{setup_logging, LogConfig};

/// Feature detection for supported backends
pub struct Features {
    /// Whether CUDA support is enabled
    pub cuda: bool,
    /// Number of detected CUDA devices
    pub cuda_devices: usize,
}

impl Features {
    /// Detect available features at runtime
    pub fn detect() -> Self {
        #[cfg(feature = "cuda")]
        let (cuda, cuda_devices) = {
            let count = (0..8)
                .take_while(|&i| matches!(Device::new_cuda(i), Ok(Device::Cuda(_))))
                .count();
            (count > 0, count)
        };

        #[cfg(not(feature = "cuda"))]
        let (cuda, cuda_devices) = (false, 0);

        Self { cuda, cuda_devices }
    }

    /// First CUDA device when one is usable, the CPU otherwise.
    pub fn preferred_device() -> Device {
        Device::cuda_if_available(0).unwrap_or(Device::Cpu)
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CUDA support: {}", if self.cuda { "yes" } else { "no" })?;
        if self.cuda {
            writeln!(f, "CUDA devices: {}", self.cuda_devices)?;
        }
        Ok(())
    }
}
