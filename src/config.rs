// Location: src/config.rs

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{EngineError, Result};

/// Model family tag stored in `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelType {
    #[serde(rename = "chatglm")]
    ChatGlm,
    #[serde(rename = "chatglm2")]
    ChatGlm2,
    #[serde(rename = "chatglm3")]
    ChatGlm3,
    #[serde(rename = "chatglm4")]
    ChatGlm4,
    #[serde(rename = "chatglm4v")]
    ChatGlm4v,
}

impl ModelType {
    /// Numeric tag used by converted checkpoints.
    pub fn tag(self) -> i32 {
        match self {
            ModelType::ChatGlm => 1,
            ModelType::ChatGlm2 => 2,
            ModelType::ChatGlm3 => 3,
            ModelType::ChatGlm4 => 4,
            ModelType::ChatGlm4v => 1004,
        }
    }

    pub fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            1 => Ok(ModelType::ChatGlm),
            2 => Ok(ModelType::ChatGlm2),
            3 => Ok(ModelType::ChatGlm3),
            4 => Ok(ModelType::ChatGlm4),
            1004 => Ok(ModelType::ChatGlm4v),
            other => Err(EngineError::UnsupportedModel {
                model_type: other.to_string(),
            }),
        }
    }

    /// Human readable family name.
    pub fn name(self) -> &'static str {
        match self {
            ModelType::ChatGlm => "ChatGLM",
            ModelType::ChatGlm2 => "ChatGLM2",
            ModelType::ChatGlm3 => "ChatGLM3",
            ModelType::ChatGlm4 => "ChatGLM4",
            ModelType::ChatGlm4v => "ChatGLM4V",
        }
    }

    pub fn supports_vision(self) -> bool {
        self == ModelType::ChatGlm4v
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionModelConfig {
    /// Vision transformer hidden size
    pub hidden_size: usize,

    /// Side length of the square input image
    pub image_size: usize,

    /// Input channel count
    pub in_channels: usize,

    /// Feed forward size of the vision transformer
    pub intermediate_size: usize,

    /// LayerNorm epsilon
    pub norm_eps: f64,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of vision transformer layers
    pub num_hidden_layers: usize,

    /// Number of position embeddings, one per patch plus the class token.
    /// This is also the number of embedding slots an image occupies in the
    /// text stream.
    pub num_positions: usize,

    /// Patch side length
    pub patch_size: usize,

    /// Divisor applied to the projected image embeddings
    pub scaling_factor: f64,
}

impl VisionModelConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Patches along one image side.
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels != 3 {
            return Err(EngineError::config(
                "vision.in_channels",
                "only RGB input is supported",
            ));
        }
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(EngineError::config(
                "vision.patch_size",
                format!(
                    "image size {} is not divisible by patch size {}",
                    self.image_size, self.patch_size
                ),
            ));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(EngineError::config(
                "vision.num_attention_heads",
                "hidden size must be divisible by the head count",
            ));
        }
        let grid = self.grid_size();
        if self.num_positions != grid * grid + 1 {
            return Err(EngineError::config(
                "vision.num_positions",
                format!(
                    "expected {} positions for a {}x{} patch grid plus class token, got {}",
                    grid * grid + 1,
                    grid,
                    grid,
                    self.num_positions
                ),
            ));
        }
        if self.scaling_factor <= 0.0 {
            return Err(EngineError::config(
                "vision.scaling_factor",
                "scaling factor must be positive",
            ));
        }
        Ok(())
    }
}

fn default_rope_theta() -> f64 {
    10000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model family
    pub model_type: ModelType,

    /// Vocabulary size
    pub vocab_size: usize,

    /// Model hidden size
    pub hidden_size: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key/value heads, smaller than `num_attention_heads` for
    /// grouped-query attention
    pub num_key_value_heads: usize,

    /// Number of hidden layers
    pub num_hidden_layers: usize,

    /// Intermediate size for feed forward layers
    pub intermediate_size: usize,

    /// Normalization epsilon
    pub norm_eps: f64,

    /// Rotary embedding base
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// Maximum sequence length, also the KV cache capacity
    pub max_length: usize,

    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    #[serde(default)]
    pub sep_token_id: Option<u32>,

    /// Ids that end generation in addition to `eos_token_id`
    #[serde(default)]
    pub extra_eos_token_ids: Vec<u32>,

    /// Marker opening the image slot span (vision models only)
    #[serde(default)]
    pub boi_token_id: Option<u32>,
    /// Marker closing the image slot span (vision models only)
    #[serde(default)]
    pub eoi_token_id: Option<u32>,

    #[serde(default)]
    pub vision: Option<VisionModelConfig>,
}

impl ModelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parses a configuration, mapping an unknown `model_type` to
    /// [`EngineError::UnsupportedModel`].
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if let Some(tag) = value.get("model_type") {
            let known = serde_json::from_value::<ModelType>(tag.clone()).is_ok();
            if !known {
                return Err(EngineError::UnsupportedModel {
                    model_type: tag.to_string().trim_matches('"').to_string(),
                });
            }
        }
        let config: ModelConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn model_type_name(&self) -> &'static str {
        self.model_type.name()
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// `(begin_of_image, end_of_image)` ids when the model takes images.
    pub fn image_markers(&self) -> Option<(u32, u32)> {
        if self.vision.is_none() {
            return None;
        }
        Some((self.boi_token_id?, self.eoi_token_id?))
    }

    pub fn is_eos(&self, id: u32) -> bool {
        self.eos_token_id == Some(id) || self.extra_eos_token_ids.contains(&id)
    }

    /// Ids elided by `decode(.., skip_special_tokens = true)`.
    pub fn special_token_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = [
            self.bos_token_id,
            self.eos_token_id,
            self.pad_token_id,
            self.sep_token_id,
        ]
        .into_iter()
        .flatten()
        .collect();
        ids.extend(self.extra_eos_token_ids.iter().copied());
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(EngineError::config("vocab_size", "vocabulary cannot be empty"));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(EngineError::config(
                "num_attention_heads",
                "hidden size must be divisible by the head count",
            ));
        }
        if self.num_key_value_heads == 0
            || self.num_attention_heads % self.num_key_value_heads != 0
        {
            return Err(EngineError::config(
                "num_key_value_heads",
                "attention heads must be a multiple of key/value heads",
            ));
        }
        if self.head_dim() % 4 != 0 {
            return Err(EngineError::config(
                "hidden_size",
                "head dimension must be divisible by 4 for rotary embeddings",
            ));
        }
        if self.max_length == 0 {
            return Err(EngineError::config("max_length", "max length must be positive"));
        }
        match (&self.vision, self.model_type.supports_vision()) {
            (Some(vision), true) => {
                vision.validate()?;
                if self.image_markers().is_none() {
                    return Err(EngineError::config(
                        "boi_token_id",
                        "vision models need both image marker ids",
                    ));
                }
            }
            (None, true) => {
                return Err(EngineError::config(
                    "vision",
                    format!("{} requires a vision config", self.model_type),
                ))
            }
            (Some(_), false) => {
                return Err(EngineError::config(
                    "vision",
                    format!("{} has no vision tower", self.model_type),
                ))
            }
            (None, false) => {}
        }
        Ok(())
    }
}

/// Per-call generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum total sequence length (prompt plus generated tokens)
    pub max_length: usize,

    /// Maximum number of new tokens, `None` leaves it to the other limits.
    /// A negative value in JSON also means no limit.
    #[serde(deserialize_with = "deserialize_token_limit")]
    pub max_new_tokens: Option<usize>,

    /// Maximum context length retained from the conversation
    pub max_context_length: usize,

    /// Sample from the distribution instead of taking the argmax
    pub do_sample: bool,

    /// Top-k cutoff, 0 disables it
    pub top_k: usize,

    /// Nucleus cutoff, 1.0 disables it
    pub top_p: f32,

    /// Temperature for sampling
    pub temperature: f32,

    /// Repetition penalty, 1.0 disables it
    pub repetition_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 2048,
            max_new_tokens: None,
            max_context_length: 512,
            do_sample: true,
            top_k: 0,
            top_p: 0.7,
            temperature: 0.95,
            repetition_penalty: 1.0,
        }
    }
}

fn deserialize_token_limit<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let limit = Option::<i64>::deserialize(deserializer)?;
    Ok(limit.and_then(|n| usize::try_from(n).ok()))
}

impl GenerationConfig {
    /// Deterministic argmax decoding with the remaining defaults.
    pub fn greedy() -> Self {
        Self {
            do_sample: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EngineError::config(
                "top_p",
                format!("top_p must be in (0, 1], got {}", self.top_p),
            ));
        }
        if self.do_sample && !(self.temperature > 0.0) {
            return Err(EngineError::config(
                "temperature",
                format!(
                    "temperature must be positive when sampling, got {}",
                    self.temperature
                ),
            ));
        }
        if !(self.repetition_penalty >= 0.0) {
            return Err(EngineError::config(
                "repetition_penalty",
                format!(
                    "repetition penalty cannot be negative, got {}",
                    self.repetition_penalty
                ),
            ));
        }
        if self.max_length == 0 {
            return Err(EngineError::config("max_length", "max length must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tiny_config;

    #[test]
    fn test_default_generation_config() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_length, 2048);
        assert_eq!(config.max_new_tokens, None);
        assert_eq!(config.max_context_length, 512);
        assert!(config.do_sample);
        assert_eq!(config.top_k, 0);
        assert_eq!(config.top_p, 0.7);
        assert_eq!(config.temperature, 0.95);
        assert_eq!(config.repetition_penalty, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generation_config_validation() {
        let mut config = GenerationConfig::default();
        config.top_p = 0.0;
        assert!(config.validate().is_err());

        config.top_p = 1.0;
        config.temperature = 0.0;
        assert!(config.validate().is_err());

        // temperature is ignored in greedy mode
        config.do_sample = false;
        assert!(config.validate().is_ok());

        config.repetition_penalty = -0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_generation_config_json() {
        let config: GenerationConfig =
            serde_json::from_str(r#"{"do_sample": false, "max_new_tokens": 5}"#).unwrap();
        assert!(!config.do_sample);
        assert_eq!(config.max_new_tokens, Some(5));
        assert_eq!(config.top_p, 0.7);
    }

    #[test]
    fn test_negative_max_new_tokens_is_unbounded() {
        let config: GenerationConfig = serde_json::from_str(r#"{"max_new_tokens": -1}"#).unwrap();
        assert_eq!(config.max_new_tokens, None);
        let config: GenerationConfig = serde_json::from_str(r#"{"max_new_tokens": null}"#).unwrap();
        assert_eq!(config.max_new_tokens, None);
        let config: GenerationConfig = serde_json::from_str(r#"{"max_new_tokens": 0}"#).unwrap();
        assert_eq!(config.max_new_tokens, Some(0));
    }

    #[test]
    fn test_model_type_tags() {
        for ty in [
            ModelType::ChatGlm,
            ModelType::ChatGlm2,
            ModelType::ChatGlm3,
            ModelType::ChatGlm4,
            ModelType::ChatGlm4v,
        ] {
            assert_eq!(ModelType::from_tag(ty.tag()).unwrap(), ty);
        }
        assert!(matches!(
            ModelType::from_tag(7),
            Err(EngineError::UnsupportedModel { .. })
        ));
        assert_eq!(ModelType::ChatGlm4v.to_string(), "ChatGLM4V");
    }

    #[test]
    fn test_model_config_json_round_trip() {
        let config = tiny_config(ModelType::ChatGlm3);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"model_type\":\"chatglm3\""));
        let parsed = ModelConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_unknown_model_type_is_fatal() {
        let mut value = serde_json::to_value(tiny_config(ModelType::ChatGlm2)).unwrap();
        value["model_type"] = serde_json::Value::String("baichuan".to_string());
        let err = ModelConfig::from_json(&value.to_string()).unwrap_err();
        match err {
            EngineError::UnsupportedModel { model_type } => assert_eq!(model_type, "baichuan"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_model_config_validation() {
        let mut config = tiny_config(ModelType::ChatGlm2);
        config.num_key_value_heads = 3;
        assert!(config.validate().is_err());

        let mut config = tiny_config(ModelType::ChatGlm4v);
        assert!(config.validate().is_ok());
        config.vision.as_mut().unwrap().num_positions += 1;
        assert!(config.validate().is_err());

        let mut config = tiny_config(ModelType::ChatGlm4);
        config.vision = tiny_config(ModelType::ChatGlm4v).vision;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_special_token_ids() {
        let config = tiny_config(ModelType::ChatGlm4);
        let ids = config.special_token_ids();
        assert!(ids.contains(&config.eos_token_id.unwrap()));
        for id in &config.extra_eos_token_ids {
            assert!(ids.contains(id));
            assert!(config.is_eos(*id));
        }
    }
}
