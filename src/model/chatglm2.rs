// Location: src/model/chatglm2.rs

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};
use candle_transformers::utils::repeat_kv;
use tracing::{debug, info};

use super::kv_cache::KvCache;
use super::layers::{attention, causal_mask, split_qkv, RotaryEmbedding};
use super::vision::{self, VisionEncoder};
use super::{
    check_input_ids, check_state_dict, check_step, find_image_slot, CausalLm, GraphInputs,
    StateDict,
};
use crate::config::ModelConfig;
use crate::error::{EngineError, Result};
use crate::types::Image;

/// Pre-norm GLM decoder shared by generations 2 to 4: RMSNorm, SwiGLU,
/// grouped-query attention and rotary embeddings on half of each head.
/// The vision variant adds an image encoder whose output is spliced into
/// the token embeddings.
pub struct ChatGlm2ForCausalLm {
    config: ModelConfig,
    device: Device,
    weights: Option<Weights>,
    cache: KvCache,
    rotary: RotaryEmbedding,
}

struct Weights {
    word_embeddings: Embedding,
    layers: Vec<Block>,
    final_layernorm: RmsNorm,
    output_layer: Linear,
    vision: Option<VisionEncoder>,
}

struct SelfAttention {
    query_key_value: Linear,
    dense: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, config: &ModelConfig) -> candle_core::Result<Self> {
        let head_dim = config.head_dim();
        let qkv_size = (config.num_attention_heads + 2 * config.num_key_value_heads) * head_dim;
        Ok(Self {
            query_key_value: candle_nn::linear(config.hidden_size, qkv_size, vb.pp("query_key_value"))?,
            dense: candle_nn::linear_no_bias(
                config.num_attention_heads * head_dim,
                config.hidden_size,
                vb.pp("dense"),
            )?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
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
        let (b, t, _) = xs.dims3()?;
        let qkv = self.query_key_value.forward(xs)?;
        let (q, k, v) = split_qkv(&qkv, self.num_heads, self.num_kv_heads, self.head_dim)?;
        let q = rotary.apply_interleaved(&q, &inputs.position_ids)?;
        let k = rotary.apply_interleaved(&k, &inputs.position_ids)?;

        let (k, v) = cache.append(layer, &k, &v, inputs.n_past)?;
        let groups = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, groups)?.contiguous()?;
        let v = repeat_kv(v, groups)?.contiguous()?;

        let output = attention(&q, &k, &v, inputs.mask.as_ref())?;
        let output = output
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;
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
            dense_h_to_4h: candle_nn::linear_no_bias(
                config.hidden_size,
                2 * config.intermediate_size,
                vb.pp("dense_h_to_4h"),
            )?,
            dense_4h_to_h: candle_nn::linear_no_bias(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("dense_4h_to_h"),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.dense_h_to_4h.forward(xs)?;
        let halves = xs.chunk(2, D::Minus1)?;
        let xs = (candle_nn::ops::silu(&halves[0])? * &halves[1])?;
        Ok(self.dense_4h_to_h.forward(&xs)?)
    }
}

struct Block {
    input_layernorm: RmsNorm,
    self_attention: SelfAttention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, config: &ModelConfig) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            input_layernorm: candle_nn::rms_norm(hidden, config.norm_eps, vb.pp("input_layernorm"))?,
            self_attention: SelfAttention::load(vb.pp("self_attention"), config)?,
            post_attention_layernorm: candle_nn::rms_norm(
                hidden,
                config.norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
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
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self.self_attention.forward(&xs, layer, inputs, rotary, cache)?;
        let xs = (xs + residual)?;

        let residual = &xs;
        let hidden = self.post_attention_layernorm.forward(&xs)?;
        let hidden = self.mlp.forward(&hidden)?;
        Ok((hidden + residual)?)
    }
}

impl Weights {
    fn load(vb: VarBuilder, config: &ModelConfig) -> candle_core::Result<Self> {
        let encoder = vb.pp("encoder");
        let layers = (0..config.num_hidden_layers)
            .map(|i| Block::load(encoder.pp(format!("layers.{i}")), config))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let vision = match &config.vision {
            Some(vision_config) => Some(VisionEncoder::load(vb.pp("vision"), vision_config, config)?),
            None => None,
        };
        Ok(Self {
            word_embeddings: candle_nn::embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("embedding").pp("word_embeddings"),
            )?,
            layers,
            final_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.norm_eps,
                encoder.pp("final_layernorm"),
            )?,
            output_layer: candle_nn::linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("output_layer"),
            )?,
            vision,
        })
    }

    /// Token embeddings with image embeddings inserted after the
    /// begin-of-image marker.
    fn embed(&self, inputs: &GraphInputs) -> Result<Tensor> {
        let embeddings = self.word_embeddings.forward(&inputs.input_ids)?;
        let (Some(image), Some(offset)) = (&inputs.image, inputs.image_offset) else {
            return Ok(embeddings);
        };
        let encoder = self
            .vision
            .as_ref()
            .ok_or_else(|| EngineError::model("image input without a vision encoder"))?;
        let image_embeddings = encoder.forward(image)?;
        let num_ids = embeddings.dim(1)?;
        let before = embeddings.narrow(1, 0, offset + 1)?;
        let after = embeddings.narrow(1, offset + 1, num_ids - offset - 1)?;
        Ok(Tensor::cat(&[&before, &image_embeddings, &after], 1)?)
    }
}

impl ChatGlm2ForCausalLm {
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        let head_dim = config.head_dim();
        let cache = KvCache::new(
            config.num_hidden_layers,
            config.num_key_value_heads,
            head_dim,
            config.max_length,
            DType::F32,
            device,
        )?;
        let rotary = RotaryEmbedding::new(head_dim / 2, config.rope_theta, config.max_length, device)?;
        Ok(Self {
            config,
            device: device.clone(),
            weights: None,
            cache,
            rotary,
        })
    }
}

impl CausalLm for ChatGlm2ForCausalLm {
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
        _n_ctx: usize,
    ) -> Result<GraphInputs> {
        check_input_ids(input_ids)?;
        let (image, image_offset) = match (image, &self.config.vision) {
            (None, _) => (None, None),
            (Some(_), None) => {
                return Err(EngineError::Capability {
                    model: self.config.model_type_name().to_string(),
                    capability: "image input".to_string(),
                })
            }
            (Some(image), Some(vision_config)) => match find_image_slot(input_ids, &self.config) {
                Some(offset) => (
                    Some(vision::preprocess_image(image, vision_config, &self.device)?),
                    Some(offset),
                ),
                None => {
                    debug!("No image markers in input, ignoring image");
                    (None, None)
                }
            },
        };
        let seq_len = input_ids.len()
            + match (&image, &self.config.vision) {
                (Some(_), Some(vision_config)) => vision_config.num_positions,
                _ => 0,
            };

        let positions: Vec<u32> = (n_past..n_past + seq_len).map(|p| p as u32).collect();
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, n_past, &self.device)?)
        } else {
            None
        };
        Ok(GraphInputs {
            input_ids: Tensor::new(input_ids, &self.device)?.unsqueeze(0)?,
            image,
            image_offset,
            position_ids: Tensor::new(positions.as_slice(), &self.device)?,
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

        let mut hidden = weights.embed(inputs)?;
        for (layer, block) in weights.layers.iter().enumerate() {
            hidden = block.forward(&hidden, layer, inputs, &self.rotary, &self.cache)?;
        }
        let last = hidden.narrow(1, inputs.seq_len - 1, 1)?;
        let last = weights.final_layernorm.forward(&last)?;
        let logits = weights.output_layer.forward(&last)?.flatten_all()?;

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
    let head_dim = config.head_dim();
    let q_size = config.num_attention_heads * head_dim;
    let qkv_size = q_size + 2 * config.num_key_value_heads * head_dim;

    let mut weights = vec![(
        "transformer.embedding.word_embeddings.weight".to_string(),
        vec![config.vocab_size, h],
    )];
    for i in 0..config.num_hidden_layers {
        let prefix = format!("transformer.encoder.layers.{i}");
        let entries: [(&str, Vec<usize>); 7] = [
            ("input_layernorm.weight", vec![h]),
            ("self_attention.query_key_value.weight", vec![qkv_size, h]),
            ("self_attention.query_key_value.bias", vec![qkv_size]),
            ("self_attention.dense.weight", vec![h, q_size]),
            ("post_attention_layernorm.weight", vec![h]),
            ("mlp.dense_h_to_4h.weight", vec![2 * f, h]),
            ("mlp.dense_4h_to_h.weight", vec![h, f]),
        ];
        weights.extend(
            entries
                .into_iter()
                .map(|(name, shape)| (format!("{prefix}.{name}"), shape)),
        );
    }
    weights.push(("transformer.encoder.final_layernorm.weight".to_string(), vec![h]));
    weights.push(("transformer.output_layer.weight".to_string(), vec![config.vocab_size, h]));
    if let Some(vision_config) = &config.vision {
        weights.extend(vision::expected_weights(vision_config, config, "transformer.vision"));
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelType;
    use crate::test_utils::{tiny_config, tiny_model};

    fn image() -> Image {
        let pixels: Vec<u8> = (0..6 * 6 * 3).map(|v| (v * 7 % 256) as u8).collect();
        Image::new(6, 6, 3, pixels).unwrap()
    }

    #[test]
    fn test_image_slots_extend_sequence() -> anyhow::Result<()> {
        let model = tiny_model(ModelType::ChatGlm4v, 5);
        let config = model.config().clone();
        let (boi, eoi) = config.image_markers().unwrap();
        let positions = config.vision.as_ref().unwrap().num_positions;

        let ids = vec![3, 7, 10, boi, eoi, 70, 71, 11];
        let inputs = model.set_graph_inputs(&ids, Some(&image()), 0, ids.len())?;
        assert_eq!(inputs.image_offset, Some(3));
        assert_eq!(inputs.seq_len, ids.len() + positions);
        assert_eq!(inputs.image.as_ref().unwrap().dims(), &[1, 3, 8, 8]);
        assert_eq!(model.count_tokens(&ids, Some(&image())), inputs.seq_len);
        Ok(())
    }

    #[test]
    fn test_vision_prefill_then_decode() -> anyhow::Result<()> {
        let mut model = tiny_model(ModelType::ChatGlm4v, 5);
        let (boi, eoi) = model.config().image_markers().unwrap();
        let ids = vec![3, 7, 10, boi, eoi, 70, 71, 11];

        let inputs = model.set_graph_inputs(&ids, Some(&image()), 0, ids.len())?;
        let logits = model.forward(&inputs, false)?;
        assert_eq!(logits.dims(), &[model.config().vocab_size]);
        let n_past = model.cache_len();
        assert_eq!(n_past, inputs.seq_len);

        let inputs = model.set_graph_inputs(&[72], None, n_past, ids.len())?;
        model.forward(&inputs, true)?;
        assert_eq!(model.cache_len(), n_past + 1);
        Ok(())
    }

    #[test]
    fn test_image_changes_logits() -> anyhow::Result<()> {
        let mut model = tiny_model(ModelType::ChatGlm4v, 5);
        let (boi, eoi) = model.config().image_markers().unwrap();
        let ids = vec![3, 7, 10, boi, eoi, 70, 71, 11];

        let inputs = model.set_graph_inputs(&ids, Some(&image()), 0, ids.len())?;
        let with_image: Vec<f32> = model.forward(&inputs, false)?.to_vec1()?;
        model.reset_cache();
        let inputs = model.set_graph_inputs(&ids, None, 0, ids.len())?;
        let without_image: Vec<f32> = model.forward(&inputs, false)?.to_vec1()?;

        let diff: f32 = with_image
            .iter()
            .zip(&without_image)
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(diff > 0.0);
        Ok(())
    }

    #[test]
    fn test_text_model_rejects_images() {
        let model = tiny_model(ModelType::ChatGlm3, 1);
        assert!(matches!(
            model.set_graph_inputs(&[70], Some(&image()), 0, 1),
            Err(EngineError::Capability { .. })
        ));
    }

    #[test]
    fn test_grouped_query_weight_shapes() {
        let config = tiny_config(ModelType::ChatGlm2);
        let weights = expected_weights(&config);
        let (_, qkv_shape) = weights
            .iter()
            .find(|(name, _)| name == "transformer.encoder.layers.0.self_attention.query_key_value.weight")
            .unwrap();
        let head_dim = config.head_dim();
        assert_eq!(
            qkv_shape[0],
            (config.num_attention_heads + 2 * config.num_key_value_heads) * head_dim
        );
    }
}
