//! Vision tower of the multimodal GLM4 variant.
//!
//! An image is resized to the configured square size, cut into patches and
//! encoded by a post-norm transformer. A gated projector maps the result,
//! class token included, to `num_positions` text embeddings.

use candle_core::{Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};

use super::layers::{attention, split_qkv};
use crate::config::{ModelConfig, VisionModelConfig};
use crate::error::Result;
use crate::types::Image;

/// CLIP normalization statistics per RGB channel.
const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Converts an RGB image into a normalized `(1, 3, image_size, image_size)`
/// tensor.
pub fn preprocess_image(image: &Image, config: &VisionModelConfig, device: &Device) -> Result<Tensor> {
    let pixels: Vec<f32> = image.as_bytes().iter().map(|&b| b as f32 / 255.0).collect();
    let pixels = Tensor::from_vec(pixels, image.shape().as_slice(), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?
        .contiguous()?;
    let pixels = pixels.upsample_nearest2d(config.image_size, config.image_size)?;
    let mean = Tensor::new(&IMAGE_MEAN, device)?.reshape((1, 3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, device)?.reshape((1, 3, 1, 1))?;
    Ok(pixels.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

struct PatchEmbedding {
    proj: Conv2d,
    cls_embedding: Tensor,
    position_embedding: Tensor,
}

impl PatchEmbedding {
    fn load(vb: VarBuilder, config: &VisionModelConfig) -> candle_core::Result<Self> {
        let conv_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        Ok(Self {
            proj: candle_nn::conv2d(
                config.in_channels,
                config.hidden_size,
                config.patch_size,
                conv_config,
                vb.pp("proj"),
            )?,
            cls_embedding: vb.get((1, config.hidden_size), "cls_embedding")?,
            position_embedding: vb
                .pp("position_embedding")
                .get((config.num_positions, config.hidden_size), "weight")?,
        })
    }

    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let patches = self.proj.forward(images)?.flatten_from(2)?.transpose(1, 2)?;
        let batch = patches.dim(0)?;
        let cls = self
            .cls_embedding
            .unsqueeze(0)?
            .expand((batch, 1, self.cls_embedding.dim(1)?))?;
        let xs = Tensor::cat(&[&cls, &patches], 1)?;
        Ok(xs.broadcast_add(&self.position_embedding)?)
    }
}

struct VisionAttention {
    query_key_value: Linear,
    dense: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl VisionAttention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, hidden) = xs.dims3()?;
        let qkv = self.query_key_value.forward(xs)?;
        let (q, k, v) = split_qkv(&qkv, self.num_heads, self.num_heads, self.head_dim)?;
        let output = attention(&q, &k, &v, None)?;
        let output = output.transpose(1, 2)?.reshape((b, t, hidden))?;
        Ok(self.dense.forward(&output)?)
    }
}

struct VisionLayer {
    input_layernorm: LayerNorm,
    attention: VisionAttention,
    fc1: Linear,
    fc2: Linear,
    post_attention_layernorm: LayerNorm,
}

impl VisionLayer {
    fn load(vb: VarBuilder, config: &VisionModelConfig) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        let attention_vb = vb.pp("attention");
        let mlp_vb = vb.pp("mlp");
        Ok(Self {
            input_layernorm: candle_nn::layer_norm(hidden, config.norm_eps, vb.pp("input_layernorm"))?,
            attention: VisionAttention {
                query_key_value: candle_nn::linear(hidden, 3 * hidden, attention_vb.pp("query_key_value"))?,
                dense: candle_nn::linear(hidden, hidden, attention_vb.pp("dense"))?,
                num_heads: config.num_attention_heads,
                head_dim: config.head_dim(),
            },
            fc1: candle_nn::linear(hidden, config.intermediate_size, mlp_vb.pp("fc1"))?,
            fc2: candle_nn::linear(config.intermediate_size, hidden, mlp_vb.pp("fc2"))?,
            post_attention_layernorm: candle_nn::layer_norm(
                hidden,
                config.norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    /// Post-norm: each sublayer output is normalized before the residual add.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let attention_output = self.attention.forward(xs)?;
        let xs = (xs + self.input_layernorm.forward(&attention_output)?)?;
        let mlp_output = self.fc2.forward(&self.fc1.forward(&xs)?.gelu_erf()?)?;
        Ok((&xs + self.post_attention_layernorm.forward(&mlp_output)?)?)
    }
}

/// Gated projection from vision features to text embeddings.
struct GluProjector {
    linear_proj: Linear,
    norm1: LayerNorm,
    gate_proj: Linear,
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
}

impl GluProjector {
    fn load(vb: VarBuilder, in_features: usize, text: &ModelConfig) -> candle_core::Result<Self> {
        let hidden = text.hidden_size;
        let ffn = text.intermediate_size;
        Ok(Self {
            linear_proj: candle_nn::linear_no_bias(in_features, hidden, vb.pp("linear_proj"))?,
            norm1: candle_nn::layer_norm(hidden, 1e-5, vb.pp("norm1"))?,
            gate_proj: candle_nn::linear_no_bias(hidden, ffn, vb.pp("gate_proj"))?,
            dense_h_to_4h: candle_nn::linear_no_bias(hidden, ffn, vb.pp("dense_h_to_4h"))?,
            dense_4h_to_h: candle_nn::linear_no_bias(ffn, hidden, vb.pp("dense_4h_to_h"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.linear_proj.forward(xs)?;
        let xs = self.norm1.forward(&xs)?.gelu_erf()?;
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(&xs)?)?;
        let xs = (gate * self.dense_h_to_4h.forward(&xs)?)?;
        Ok(self.dense_4h_to_h.forward(&xs)?)
    }
}

pub(crate) struct VisionEncoder {
    patch_embedding: PatchEmbedding,
    layers: Vec<VisionLayer>,
    projector: GluProjector,
    scaling_factor: f64,
}

impl VisionEncoder {
    pub fn load(vb: VarBuilder, config: &VisionModelConfig, text: &ModelConfig) -> candle_core::Result<Self> {
        let layers_vb = vb.pp("transformer").pp("layers");
        let layers = (0..config.num_hidden_layers)
            .map(|i| VisionLayer::load(layers_vb.pp(i.to_string()), config))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            patch_embedding: PatchEmbedding::load(vb.pp("patch_embedding"), config)?,
            layers,
            projector: GluProjector::load(vb.pp("linear_proj"), config.hidden_size, text)?,
            scaling_factor: config.scaling_factor,
        })
    }

    /// Maps `(1, 3, size, size)` pixels to `(1, num_positions, text_hidden)`.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let mut xs = self.patch_embedding.forward(images)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        let xs = self.projector.forward(&xs)?;
        Ok(xs.affine(1.0 / self.scaling_factor, 0.0)?)
    }
}

pub(crate) fn expected_weights(
    config: &VisionModelConfig,
    text: &ModelConfig,
    prefix: &str,
) -> Vec<(String, Vec<usize>)> {
    let vh = config.hidden_size;
    let vi = config.intermediate_size;
    let h = text.hidden_size;
    let f = text.intermediate_size;
    let k = config.patch_size;

    let mut weights = vec![
        (
            format!("{prefix}.patch_embedding.proj.weight"),
            vec![vh, config.in_channels, k, k],
        ),
        (format!("{prefix}.patch_embedding.proj.bias"), vec![vh]),
        (format!("{prefix}.patch_embedding.cls_embedding"), vec![1, vh]),
        (
            format!("{prefix}.patch_embedding.position_embedding.weight"),
            vec![config.num_positions, vh],
        ),
    ];
    for i in 0..config.num_hidden_layers {
        let layer = format!("{prefix}.transformer.layers.{i}");
        let entries: [(&str, Vec<usize>); 12] = [
            ("input_layernorm.weight", vec![vh]),
            ("input_layernorm.bias", vec![vh]),
            ("attention.query_key_value.weight", vec![3 * vh, vh]),
            ("attention.query_key_value.bias", vec![3 * vh]),
            ("attention.dense.weight", vec![vh, vh]),
            ("attention.dense.bias", vec![vh]),
            ("mlp.fc1.weight", vec![vi, vh]),
            ("mlp.fc1.bias", vec![vi]),
            ("mlp.fc2.weight", vec![vh, vi]),
            ("mlp.fc2.bias", vec![vh]),
            ("post_attention_layernorm.weight", vec![vh]),
            ("post_attention_layernorm.bias", vec![vh]),
        ];
        weights.extend(
            entries
                .into_iter()
                .map(|(name, shape)| (format!("{layer}.{name}"), shape)),
        );
    }
    let projector = format!("{prefix}.linear_proj");
    weights.extend([
        (format!("{projector}.linear_proj.weight"), vec![h, vh]),
        (format!("{projector}.norm1.weight"), vec![h]),
        (format!("{projector}.norm1.bias"), vec![h]),
        (format!("{projector}.gate_proj.weight"), vec![f, h]),
        (format!("{projector}.dense_h_to_4h.weight"), vec![f, h]),
        (format!("{projector}.dense_4h_to_h.weight"), vec![h, f]),
    ]);
    weights
}
