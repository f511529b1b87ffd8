//! Causal language models of the ChatGLM family and their shared plumbing

mod chatglm;
mod chatglm2;
mod kv_cache;
mod layers;
mod loader;
pub mod vision;

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use tracing::debug;

use crate::config::{GenerationConfig, ModelConfig, ModelType};
use crate::error::{EngineError, Result};
use crate::sampler;
use crate::types::Image;

pub use chatglm::ChatGlmForCausalLm;
pub use chatglm2::ChatGlm2ForCausalLm;
pub use kv_cache::KvCache;
pub use loader::ModelLoader;

/// Weight name to tensor, as read from checkpoint shards.
pub type StateDict = HashMap<String, Tensor>;

/// Tensors and bookkeeping for a single forward call.
#[derive(Debug, Clone)]
pub struct GraphInputs {
    /// `(1, num_ids)` token ids
    pub input_ids: Tensor,
    /// Preprocessed `(1, 3, size, size)` image, prefill only
    pub image: Option<Tensor>,
    /// Index of the begin-of-image marker in `input_ids`
    pub image_offset: Option<usize>,
    /// `(seq_len,)` rotary positions, `(2, seq_len)` for the 2D scheme
    pub position_ids: Tensor,
    /// `(seq_len, n_past + seq_len)` additive mask, absent for one query
    pub mask: Option<Tensor>,
    pub n_past: usize,
    /// Positions consumed by this call, image slots included
    pub seq_len: usize,
}

/// A decoder-only model that owns its weights and KV cache.
pub trait CausalLm: Send {
    fn config(&self) -> &ModelConfig;

    fn device(&self) -> &Device;

    /// Installs weights. Every expected tensor must be present with the
    /// expected shape; on error the model keeps its previous weights.
    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()>;

    /// Builds the tensors for processing `input_ids` at positions starting at
    /// `n_past`. `n_ctx` is the prompt length of the current session.
    fn set_graph_inputs(
        &self,
        input_ids: &[u32],
        image: Option<&Image>,
        n_past: usize,
        n_ctx: usize,
    ) -> Result<GraphInputs>;

    /// Runs the network, updates the KV cache and returns the `(vocab,)`
    /// logits of the last position.
    fn forward(&mut self, inputs: &GraphInputs, is_decoding: bool) -> Result<Tensor>;

    /// Positions currently held in the KV cache.
    fn cache_len(&self) -> usize;

    fn reset_cache(&mut self);

    /// Positions `input_ids` occupy, counting image slots when an image is
    /// attached.
    fn count_tokens(&self, input_ids: &[u32], image: Option<&Image>) -> usize {
        let image_positions = match (image, &self.config().vision) {
            (Some(_), Some(vision)) => vision.num_positions,
            _ => 0,
        };
        input_ids.len() + image_positions
    }

    /// Produces the next token for `input_ids`, the full history so far.
    ///
    /// With `n_past == 0` the whole history is prefilled; otherwise only its
    /// last id is decoded at position `n_past`.
    fn generate_next_token(
        &mut self,
        input_ids: &[u32],
        image: Option<&Image>,
        gen_config: &GenerationConfig,
        n_past: usize,
        n_ctx: usize,
        rng: &mut StdRng,
    ) -> Result<u32> {
        let Some(last) = input_ids.len().checked_sub(1) else {
            return Err(EngineError::Validation {
                message: "cannot generate from an empty sequence".to_string(),
            });
        };
        let is_decoding = n_past > 0;
        let (window, image) = if is_decoding {
            (&input_ids[last..], None)
        } else {
            (input_ids, image)
        };
        let inputs = self.set_graph_inputs(window, image, n_past, n_ctx)?;
        let logits = self.forward(&inputs, is_decoding)?;
        sampler::sample(&logits, input_ids, gen_config, rng)
    }
}

/// Creates an uninitialized model; weights come from
/// [`CausalLm::load_state_dict`].
pub fn create_model(config: ModelConfig, device: &Device) -> Result<Box<dyn CausalLm>> {
    config.validate()?;
    debug!(
        model_type = %config.model_type,
        layers = config.num_hidden_layers,
        hidden_size = config.hidden_size,
        "Creating model"
    );
    let model: Box<dyn CausalLm> = match config.model_type {
        ModelType::ChatGlm => Box::new(ChatGlmForCausalLm::new(config, device)?),
        _ => Box::new(ChatGlm2ForCausalLm::new(config, device)?),
    };
    Ok(model)
}

/// Names and shapes of every tensor the model for `config` loads.
pub fn expected_weights(config: &ModelConfig) -> Vec<(String, Vec<usize>)> {
    match config.model_type {
        ModelType::ChatGlm => chatglm::expected_weights(config),
        _ => chatglm2::expected_weights(config),
    }
}

/// Rejects state dicts with missing or misshapen tensors before any weight
/// is installed.
pub(crate) fn check_state_dict(state_dict: &StateDict, config: &ModelConfig) -> Result<()> {
    let expected = expected_weights(config);
    let missing: Vec<&str> = expected
        .iter()
        .filter(|(name, _)| !state_dict.contains_key(name))
        .map(|(name, _)| name.as_str())
        .collect();
    if let Some(first) = missing.first() {
        return Err(EngineError::WeightLoad {
            name: first.to_string(),
            message: format!("tensor is missing ({} missing in total)", missing.len()),
        });
    }
    for (name, shape) in &expected {
        let tensor = &state_dict[name];
        if tensor.dims() != shape.as_slice() {
            return Err(EngineError::WeightLoad {
                name: name.clone(),
                message: format!("expected shape {shape:?}, found {:?}", tensor.dims()),
            });
        }
    }
    let unused = state_dict.len() - expected.len();
    if unused > 0 {
        debug!(unused, "State dict holds tensors the model does not use");
    }
    Ok(())
}

/// Position of a begin-of-image marker directly followed by its
/// end-of-image marker.
pub(crate) fn find_image_slot(input_ids: &[u32], config: &ModelConfig) -> Option<usize> {
    let (begin, end) = config.image_markers()?;
    input_ids.windows(2).position(|pair| pair[0] == begin && pair[1] == end)
}

/// Ensures the window `[n_past, n_past + seq_len)` is consistent with the
/// decoding mode and fits the cache.
pub(crate) fn check_input_ids(input_ids: &[u32]) -> Result<()> {
    if input_ids.is_empty() {
        return Err(EngineError::Validation {
            message: "graph inputs need at least one id".to_string(),
        });
    }
    Ok(())
}

pub(crate) fn check_step(cache: &KvCache, inputs: &GraphInputs, is_decoding: bool) -> Result<()> {
    if inputs.seq_len == 0 {
        return Err(EngineError::Validation {
            message: "forward needs at least one position".to_string(),
        });
    }
    if is_decoding && (inputs.n_past == 0 || inputs.seq_len != 1) {
        return Err(EngineError::model(format!(
            "decoding expects one position after a prefill, got {} at n_past {}",
            inputs.seq_len, inputs.n_past
        )));
    }
    if !is_decoding && inputs.n_past != 0 {
        return Err(EngineError::model("prefill must start at position 0"));
    }
    cache.check_window(inputs.n_past, inputs.seq_len)
}
