//! Text codecs and chat templates for each ChatGLM generation.

mod chatglm;
mod chatglm2;
mod chatglm3;
mod chatglm4;
pub mod template;
pub mod tool_call;

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::config::{ModelConfig, ModelType};
use crate::error::{EngineError, Result};
use crate::types::ChatMessage;

pub use chatglm::ChatGlmTokenizer;
pub use chatglm2::ChatGlm2Tokenizer;
pub use chatglm3::ChatGlm3Tokenizer;
pub use chatglm4::ChatGlm4Tokenizer;
pub use template::TruncationPolicy;

/// Replacement emitted for ids the codec does not know.
pub const UNKNOWN_PLACEHOLDER: &str = "\u{FFFD}";

/// Subword vocabulary underneath every family tokenizer.
pub trait SubwordCodec: Send + Sync {
    /// Encodes raw text without adding any special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decodes ids verbatim, special tokens included.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn vocab_size(&self) -> usize;

    fn token_to_id(&self, token: &str) -> Option<u32>;

    fn id_to_token(&self, id: u32) -> Option<String>;
}

/// [`SubwordCodec`] backed by a HuggingFace `tokenizer.json`.
pub struct HfCodec {
    inner: tokenizers::Tokenizer,
}

impl HfCodec {
    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        Self { inner }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            EngineError::encoding(format!("Failed to load tokenizer from {path:?}"), Some(e))
        })?;
        debug!(
            vocab_size = inner.get_vocab_size(true),
            "Loaded tokenizer from {:?}", path
        );
        Ok(Self { inner })
    }
}

impl SubwordCodec for HfCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| EngineError::encoding("Tokenization failed", Some(e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| EngineError::encoding("Detokenization failed", Some(e)))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }
}

/// Family-specific text and conversation codec.
pub trait Tokenizer: Send + Sync {
    /// Encodes free text with the family's prompt markers, truncated to
    /// `max_length` ids.
    fn encode(&self, text: &str, max_length: usize) -> Result<Vec<u32>>;

    /// Decodes ids to text. With `skip_special_tokens` the family's structural
    /// markers and the configured special ids are elided.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Renders a conversation into prompt ids, ending with the open assistant
    /// marker, in at most `max_length` positions.
    fn apply_chat_template(&self, messages: &[ChatMessage], max_length: usize) -> Result<Vec<u32>>;

    /// Turns generated ids into an assistant message, extracting a tool call
    /// when the family's format is matched.
    fn decode_message(&self, ids: &[u32]) -> Result<ChatMessage>;
}

/// Builds the tokenizer for `config.model_type` on top of `codec`.
pub fn create_tokenizer(
    config: &ModelConfig,
    codec: Arc<dyn SubwordCodec>,
    truncation: TruncationPolicy,
) -> Result<Box<dyn Tokenizer>> {
    debug!(model_type = %config.model_type, ?truncation, "Creating tokenizer");
    let tokenizer: Box<dyn Tokenizer> = match config.model_type {
        ModelType::ChatGlm => Box::new(ChatGlmTokenizer::new(config, codec, truncation)?),
        ModelType::ChatGlm2 => Box::new(ChatGlm2Tokenizer::new(config, codec, truncation)?),
        ModelType::ChatGlm3 => Box::new(ChatGlm3Tokenizer::new(config, codec, truncation)?),
        ModelType::ChatGlm4 | ModelType::ChatGlm4v => {
            Box::new(ChatGlm4Tokenizer::new(config, codec, truncation)?)
        }
    };
    Ok(tokenizer)
}

/// Looks up a special token the family cannot work without.
pub(crate) fn require_token(codec: &dyn SubwordCodec, token: &str) -> Result<u32> {
    codec.token_to_id(token).ok_or_else(|| {
        EngineError::config(
            "tokenizer",
            format!("vocabulary has no special token {token:?}"),
        )
    })
}

/// Sorted, deduplicated set of ids hidden by `decode(.., true)`.
pub(crate) fn skip_set(config: &ModelConfig, structural: &[u32]) -> Vec<u32> {
    let mut ids = config.special_token_ids();
    ids.extend_from_slice(structural);
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Decodes `ids`, dropping members of the sorted `skip` set and replacing ids
/// outside the vocabulary with [`UNKNOWN_PLACEHOLDER`].
pub(crate) fn decode_with(codec: &dyn SubwordCodec, ids: &[u32], skip: &[u32]) -> Result<String> {
    let vocab_size = codec.vocab_size();
    let mut text = String::new();
    let mut run = Vec::with_capacity(ids.len());
    for &id in ids {
        if skip.binary_search(&id).is_ok() {
            continue;
        }
        if id as usize >= vocab_size {
            if !run.is_empty() {
                text.push_str(&codec.decode(&run)?);
                run.clear();
            }
            text.push_str(UNKNOWN_PLACEHOLDER);
        } else {
            run.push(id);
        }
    }
    if !run.is_empty() {
        text.push_str(&codec.decode(&run)?);
    }
    Ok(text)
}

/// Splits a generated response at its first newline into the metadata line
/// and the body. A response without a newline has no metadata.
pub(crate) fn split_metadata(text: &str) -> (&str, &str) {
    match text.split_once('\n') {
        Some((meta, body)) => (meta, body),
        None => ("", text),
    }
}

/// Fails when a family without a vision tower receives an image.
pub(crate) fn reject_images(model_type: ModelType, messages: &[ChatMessage]) -> Result<()> {
    if messages.iter().any(|m| m.image.is_some()) {
        return Err(EngineError::Capability {
            model: model_type.name().to_string(),
            capability: "image input".to_string(),
        });
    }
    Ok(())
}
