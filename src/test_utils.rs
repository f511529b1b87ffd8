//! Fixtures shared by unit tests: a byte-level codec and tiny model configs.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{ModelConfig, ModelType, VisionModelConfig};
use crate::error::{EngineError, Result};
use crate::model::{self, CausalLm, StateDict};
use crate::tokenizer::{create_tokenizer, SubwordCodec, Tokenizer, TruncationPolicy};

/// Special tokens of [`ByteCodec`], the position is the id.
pub(crate) const SPECIAL_TOKENS: [&str; 16] = [
    "<unk>",
    "<pad>",
    "[MASK]",
    "[gMASK]",
    "[sMASK]",
    "sop",
    "eop",
    "<sop>",
    "<eop>",
    "<|system|>",
    "<|user|>",
    "<|assistant|>",
    "<|observation|>",
    "<|endoftext|>",
    "<|begin_of_image|>",
    "<|end_of_image|>",
];

pub(crate) const BYTE_OFFSET: u32 = 64;

pub(crate) fn special_id(name: &str) -> u32 {
    SPECIAL_TOKENS
        .iter()
        .position(|token| *token == name)
        .map(|index| index as u32)
        .unwrap_or_else(|| panic!("unknown special token {name}"))
}

/// Encodes every UTF-8 byte `b` as id `64 + b`. Ids below 64 are special.
/// Rejects NUL so tests can exercise encoding failures.
#[derive(Debug, Default)]
pub(crate) struct ByteCodec;

impl SubwordCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        if text.contains('\0') {
            return Err(EngineError::encoding("NUL byte in input", None));
        }
        Ok(text.bytes().map(|b| BYTE_OFFSET + b as u32).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::new();
        for &id in ids {
            if id < BYTE_OFFSET {
                if let Some(token) = SPECIAL_TOKENS.get(id as usize) {
                    bytes.extend_from_slice(token.as_bytes());
                }
            } else {
                bytes.push((id - BYTE_OFFSET) as u8);
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        (BYTE_OFFSET + 256) as usize
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        SPECIAL_TOKENS
            .iter()
            .position(|t| *t == token)
            .map(|index| index as u32)
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        if id < BYTE_OFFSET {
            SPECIAL_TOKENS.get(id as usize).map(|t| t.to_string())
        } else if id < BYTE_OFFSET + 256 {
            Some(format!("<0x{:02X}>", id - BYTE_OFFSET))
        } else {
            None
        }
    }
}

pub(crate) fn byte_ids(text: &str) -> Vec<u32> {
    text.bytes().map(|b| BYTE_OFFSET + b as u32).collect()
}

/// A small config of the given family sized for fast CPU tests.
pub(crate) fn tiny_config(model_type: ModelType) -> ModelConfig {
    let (num_key_value_heads, bos, eos, extra_eos) = match model_type {
        ModelType::ChatGlm => (4, Some(special_id("<sop>")), special_id("<eop>"), vec![]),
        ModelType::ChatGlm2 => (2, None, special_id("eop"), vec![]),
        ModelType::ChatGlm3 => (
            2,
            None,
            special_id("eop"),
            vec![special_id("<|user|>"), special_id("<|observation|>")],
        ),
        ModelType::ChatGlm4 | ModelType::ChatGlm4v => (
            2,
            None,
            special_id("<|endoftext|>"),
            vec![special_id("<|user|>"), special_id("<|observation|>")],
        ),
    };
    let vision = (model_type == ModelType::ChatGlm4v).then(|| VisionModelConfig {
        hidden_size: 16,
        image_size: 8,
        in_channels: 3,
        intermediate_size: 32,
        norm_eps: 1e-6,
        num_attention_heads: 2,
        num_hidden_layers: 1,
        num_positions: 5,
        patch_size: 4,
        scaling_factor: 8.0,
    });
    let (boi, eoi) = if vision.is_some() {
        (
            Some(special_id("<|begin_of_image|>")),
            Some(special_id("<|end_of_image|>")),
        )
    } else {
        (None, None)
    };
    ModelConfig {
        model_type,
        vocab_size: (BYTE_OFFSET + 256) as usize,
        hidden_size: 32,
        num_attention_heads: 4,
        num_key_value_heads,
        num_hidden_layers: 2,
        intermediate_size: 64,
        norm_eps: 1e-5,
        rope_theta: 10000.0,
        max_length: 128,
        bos_token_id: bos,
        eos_token_id: Some(eos),
        pad_token_id: Some(special_id("<pad>")),
        sep_token_id: None,
        extra_eos_token_ids: extra_eos,
        boi_token_id: boi,
        eoi_token_id: eoi,
        vision,
    }
}

pub(crate) fn tiny_tokenizer(model_type: ModelType) -> Arc<dyn Tokenizer> {
    let config = tiny_config(model_type);
    create_tokenizer(&config, Arc::new(ByteCodec), TruncationPolicy::default())
        .map(Arc::from)
        .expect("tokenizer for tiny config")
}

/// Deterministic random weights covering every tensor the model expects.
pub(crate) fn random_state_dict(config: &ModelConfig, seed: u64) -> StateDict {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut state_dict = HashMap::new();
    for (name, shape) in model::expected_weights(config) {
        let numel: usize = shape.iter().product();
        let is_norm = name.contains("norm") && name.ends_with(".weight");
        let data: Vec<f32> = (0..numel)
            .map(|_| {
                let noise = rng.gen_range(-0.2f32..0.2);
                if is_norm {
                    1.0 + noise * 0.1
                } else {
                    noise
                }
            })
            .collect();
        let tensor = Tensor::from_vec(data, shape.as_slice(), &Device::Cpu).expect("tensor");
        state_dict.insert(name, tensor);
    }
    state_dict
}

/// A tiny model of the given family with deterministic random weights.
pub(crate) fn tiny_model(model_type: ModelType, seed: u64) -> Box<dyn CausalLm> {
    let config = tiny_config(model_type);
    let state_dict = random_state_dict(&config, seed);
    let mut model = model::create_model(config, &Device::Cpu).expect("model");
    model.load_state_dict(state_dict).expect("weights");
    model
}
