// Location: src/model/chatglm.rs

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};
use tracing::{debug, info};

use super::kv_cache::KvCache;
use super::layers::{attention, causal_mask, RotaryEmbedding};
use super::{check_input_ids, check_state_dict, check_step, CausalLm, GraphInputs, StateDict};
use crate::config::ModelConfig;
use crate::error::{EngineError, Result};
use crate::types::Image;

/// First-generation GLM: post-scaled residuals, GELU feed forward, 2D
/// rotary positions and an output head tied to the input embedding.
pub struct ChatGlmForCausalLm {
    config: ModelConfig,
    device: Device,
    weights: Option<Weights>,
    cache: KvCache,
    rotary: RotaryEmbedding,
}

struct Weights {
    word_embeddings: Embedding,
    layers: Vec<Block>,
    final_layernorm: LayerNorm,
}

struct SelfAttention {
    query_key_value: Linear,
    dense: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, config: &ModelConfig) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            query_key_value: candle_nn::linear(hidden, 3 * hidden, vb.pp("query_key_value"))?,
            dense: candle_nn::linear(hidden, hidden, vb.pp("dense"))?,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    /// Rotates the first half of each head by the token position and the
    /// second half by the block position.
    fn rotate(&self, xs: &Tensor, inputs: &GraphInputs, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let half = self.head_dim / 2;
        let positions = inputs.position_ids.get(0)?;
        let block_positions = inputs.position_ids.get(1)?;
        let first = rotary.apply_half(&xs.narrow(D::Minus1, 0, half)?, &positions)?;
        let second = rotary.apply_half(&xs.narrow(D::Minus1, half, half)?, &block_positions)?;
        Ok(Tensor::cat(&[&first, &second], D::Minus1)?)
    }

    fn forward(
        &self,
        xs: &Tensor,
        layer: usize,
        inputs: &GraphInputs,
        rotary: &RotaryEmbedding,
        cache: &KvCache,
    ) -> Result<Tensor> {
        let (b, t, hidden) = xs.dims3()?;
        // per-head [q, k, v] interleaving
        let qkv = self
            .query_key_value
            .forward(xs)?
            .reshape((b, t, self.num_heads, 3 * self.head_dim))?;
        let part = |index: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, index * self.head_dim, self.head_dim)?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = self.rotate(&part(0)?, inputs, rotary)?;
        let k = self.rotate(&part(1)?, inputs, rotary)?;
        let v = part(2)?;

        let (k, v) = cache.append(layer, &k, &v, inputs.n_past)?;
        let output = attention(&q, &k, &v, inputs.mask.as_ref())?;
        let output = output.transpose(1, 2)?.reshape((b, t, hidden))?;
        Ok(self.dense.forward(&output)?)
    }
}

struct Mlp {
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &ModelConfig) -> candle_core::Result<Self> {
        Ok(Self {
            dense_h_to_4h: candle_nn::linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("dense_h_to_4h"),
            )?,
            dense_4h_to_h: candle_nn::linear(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("dense_4h_to_h"),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.dense_h_to_4h.forward(xs)?.gelu()?;
        Ok(self.dense_4h_to_h.forward(&xs)?)
    }
}

struct Block {
    input_layernorm: LayerNorm,
    attention: SelfAttention,
    post_attention_layernorm: LayerNorm,
    mlp: Mlp,
    alpha: f64,
}

impl Block {
    fn load(vb: VarBuilder, config: &ModelConfig) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            input_layernorm: candle_nn::layer_norm(hidden, config.norm_eps, vb.pp("input_layernorm"))?,
            attention: SelfAttention::load(vb.pp("attention"), config)?,
            post_attention_layernorm: candle_nn::layer_norm(
                hidden,
                config.norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
            alpha: (2.0 * config.num_hidden_layers as f64).sqrt(),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        layer: usize,
        inputs: &GraphInputs,
        rotary: &RotaryEmbedding,
        cache: &KvCache,
    ) -> Result<Tensor> {
        let attention_input = self.input_layernorm.forward(xs)?;
        let attention_output = self
            .attention
            .forward(&attention_input, layer, inputs, rotary, cache)?;
        let xs = (attention_input.affine(self.alpha, 0.0)? + attention_output)?;

        let mlp_input = self.post_attention_layernorm.forward(&xs)?;
        let mlp_output = self.mlp.forward(&mlp_input)?;
        Ok((mlp_input.affine(self.alpha, 0.0)? + mlp_output)?)
    }
}

impl Weights {
    fn load(vb: VarBuilder, config: &ModelConfig) -> candle_core::Result<Self> {
        let layers = (0..config.num_hidden_layers)
            .map(|i| Block::load(vb.pp(format!("layers.{i}")), config))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            word_embeddings: candle_nn::embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            layers,
            final_layernorm: candle_nn::layer_norm(
                config.hidden_size,
                config.norm_eps,
                vb.pp("final_layernorm"),
            )?,
        })
    }
}

impl ChatGlmForCausalLm {
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        let cache = KvCache::new(
            config.num_hidden_layers,
            config.num_attention_heads,
            config.head_dim(),
            config.max_length,
            DType::F32,
            device,
        )?;
        let rotary = RotaryEmbedding::new(
            config.head_dim() / 2,
            config.rope_theta,
            config.max_length + 1,
            device,
        )?;
        Ok(Self {
            config,
            device: device.clone(),
            weights: None,
            cache,
            rotary,
        })
    }
}

impl CausalLm for ChatGlmForCausalLm {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()> {
        check_state_dict(&state_dict, &self.config)?;
        let vb = VarBuilder::from_tensors(state_dict, DType::F32, &self.device);
        let weights = Weights::load(vb.pp("transformer"), &self.config).map_err(|e| {
            EngineError::WeightLoad {
                name: "transformer".to_string(),
                message: e.to_string(),
            }
        })?;
        self.weights = Some(weights);
        self.cache.reset();
        info!(model_type = %self.config.model_type, "Weights loaded");
        Ok(())
    }

    fn set_graph_inputs(
        &self,
        input_ids: &[u32],
        image: Option<&Image>,
        n_past: usize,
        n_ctx: usize,
    ) -> Result<GraphInputs> {
        check_input_ids(input_ids)?;
        if image.is_some() {
            return Err(EngineError::Capability {
                model: self.config.model_type_name().to_string(),
                capability: "image input".to_string(),
            });
        }
        let seq_len = input_ids.len();
        // generated positions stay on the mask position and advance the block position
        let context = n_ctx.saturating_sub(2);
        let (positions, block_positions): (Vec<u32>, Vec<u32>) = (n_past..n_past + seq_len)
            .map(|p| (p.min(context) as u32, p.saturating_sub(context) as u32))
            .unzip();
        let position_ids = Tensor::from_vec(
            [positions, block_positions].concat(),
            (2, seq_len),
            &self.device,
        )?;
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, n_past, &self.device)?)
        } else {
            None
        };
        Ok(GraphInputs {
            input_ids: Tensor::new(input_ids, &self.device)?.unsqueeze(0)?,
            image: None,
            image_offset: None,
            position_ids,
            mask,
            n_past,
            seq_len,
        })
    }

    fn forward(&mut self, inputs: &GraphInputs, is_decoding: bool) -> Result<Tensor> {
        check_step(&self.cache, inputs, is_decoding)?;
        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| EngineError::model("weights are not loaded"))?;

        let mut hidden = weights.word_embeddings.forward(&inputs.input_ids)?;
        for (layer, block) in weights.layers.iter().enumerate() {
            hidden = block.forward(&hidden, layer, inputs, &self.rotary, &self.cache)?;
        }
        let last = hidden.narrow(1, inputs.seq_len - 1, 1)?.squeeze(1)?;
        let last = weights.final_layernorm.forward(&last)?;
        let logits = last
            .matmul(&weights.word_embeddings.embeddings().t()?)?
            .squeeze(0)?;

        self.cache.commit(inputs.n_past + inputs.seq_len);
        debug!(n_past = inputs.n_past, seq_len = inputs.seq_len, "Forward pass");
        Ok(logits)
    }

    fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn reset_cache(&mut self) {
        self.cache.reset();
    }
}

pub(super) fn expected_weights(config: &ModelConfig) -> Vec<(String, Vec<usize>)> {
    let h = config.hidden_size;
    let f = config.intermediate_size;
    let mut weights = vec![(
        "transformer.word_embeddings.weight".to_string(),
        vec![config.vocab_size, h],
    )];
    for i in 0..config.num_hidden_layers {
        let prefix = format!("transformer.layers.{i}");
        let entries: [(&str, Vec<usize>); 12] = [
            ("input_layernorm.weight", vec![h]),
            ("input_layernorm.bias", vec![h]),
            ("attention.query_key_value.weight", vec![3 * h, h]),
            ("attention.query_key_value.bias", vec![3 * h]),
            ("attention.dense.weight", vec![h, h]),
            ("attention.dense.bias", vec![h]),
            ("post_attention_layernorm.weight", vec![h]),
            ("post_attention_layernorm.bias", vec![h]),
            ("mlp.dense_h_to_4h.weight", vec![f, h]),
            ("mlp.dense_h_to_4h.bias", vec![f]),
            ("mlp.dense_4h_to_h.weight", vec![h, f]),
            ("mlp.dense_4h_to_h.bias", vec![h]),
        ];
        weights.extend(
            entries
                .into_iter()
                .map(|(name, shape)| (format!("{prefix}.{name}"), shape)),
        );
    }
    weights.push(("transformer.final_layernorm.weight".to_string(), vec![h]));
    weights.push(("transformer.final_layernorm.bias".to_string(), vec![h]));
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelType;
    use crate::test_utils::tiny_config;

    #[test]
    fn test_two_dimensional_positions() -> anyhow::Result<()> {
        let model = ChatGlmForCausalLm::new(tiny_config(ModelType::ChatGlm), &Device::Cpu)?;
        // prompt: a b [gMASK] <sop>
        let inputs = model.set_graph_inputs(&[70, 71, 3, 7], None, 0, 4)?;
        let positions: Vec<Vec<u32>> = inputs.position_ids.to_vec2()?;
        assert_eq!(positions, vec![vec![0, 1, 2, 2], vec![0, 0, 0, 1]]);

        let inputs = model.set_graph_inputs(&[80], None, 4, 4)?;
        let positions: Vec<Vec<u32>> = inputs.position_ids.to_vec2()?;
        assert_eq!(positions, vec![vec![2], vec![2]]);
        assert!(inputs.mask.is_none());
        Ok(())
    }

    #[test]
    fn test_rejects_images() {
        let model = ChatGlmForCausalLm::new(tiny_config(ModelType::ChatGlm), &Device::Cpu).unwrap();
        let image = Image::new(2, 2, 3, vec![0; 12]).unwrap();
        assert!(matches!(
            model.set_graph_inputs(&[70], Some(&image), 0, 1),
            Err(EngineError::Capability { .. })
        ));
    }

    #[test]
    fn test_expected_weight_count() {
        let config = tiny_config(ModelType::ChatGlm);
        assert_eq!(
            expected_weights(&config).len(),
            1 + 12 * config.num_hidden_layers + 2
        );
    }
}
