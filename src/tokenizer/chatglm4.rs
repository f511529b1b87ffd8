use std::sync::Arc;

use tracing::debug;

use super::chatglm3::RoleTokens;
use super::template::{truncate_keep_prefix, RenderedPrompt, RenderedTurn, TruncationPolicy};
use super::tool_call::{self, GLM4_CODE_TOOL};
use super::{
    decode_with, reject_images, require_token, skip_set, split_metadata, SubwordCodec, Tokenizer,
};
use crate::config::{ModelConfig, ModelType};
use crate::error::{EngineError, Result};
use crate::types::{ChatMessage, Role, ToolCallMessage};

#[derive(Debug, Clone, Copy)]
struct ImageMarkers {
    begin: u32,
    end: u32,
    /// Embedding slots spliced between the markers
    positions: usize,
}

/// Fourth-generation tokenizer, also used by the vision variant.
pub struct ChatGlm4Tokenizer {
    codec: Arc<dyn SubwordCodec>,
    model_type: ModelType,
    gmask_token_id: u32,
    sop_token_id: u32,
    roles: RoleTokens,
    image: Option<ImageMarkers>,
    skip_ids: Vec<u32>,
    truncation: TruncationPolicy,
}

impl ChatGlm4Tokenizer {
    pub fn new(
        config: &ModelConfig,
        codec: Arc<dyn SubwordCodec>,
        truncation: TruncationPolicy,
    ) -> Result<Self> {
        let gmask_token_id = require_token(codec.as_ref(), "[gMASK]")?;
        let sop_token_id = require_token(codec.as_ref(), "<sop>")?;
        let roles = RoleTokens::resolve(codec.as_ref())?;

        let image = match (&config.vision, config.image_markers()) {
            (Some(vision), Some((begin, end))) => Some(ImageMarkers {
                begin,
                end,
                positions: vision.num_positions,
            }),
            _ => None,
        };

        let mut structural = vec![gmask_token_id, sop_token_id];
        structural.extend(roles.all());
        if let Some(markers) = image {
            structural.extend([markers.begin, markers.end]);
        }
        Ok(Self {
            skip_ids: skip_set(config, &structural),
            codec,
            model_type: config.model_type,
            gmask_token_id,
            sop_token_id,
            roles,
            image,
            truncation,
        })
    }

    fn prefix(&self) -> Vec<u32> {
        vec![self.gmask_token_id, self.sop_token_id]
    }

    /// `<|role|>{metadata}\n[<boi><eoi>]{content}`
    fn render_message(&self, message: &ChatMessage, with_image: bool) -> Result<RenderedTurn> {
        let mut turn = RenderedTurn::default();

        if message.role == Role::Assistant && !message.tool_calls.is_empty() {
            if !message.content.is_empty() {
                turn.ids.push(self.roles.assistant);
                turn.ids.extend(self.codec.encode(&format!("\n{}", message.content))?);
            }
            for call in &message.tool_calls {
                let (metadata, payload) = match call {
                    ToolCallMessage::Function(function) => (function.name.as_str(), &function.arguments),
                    ToolCallMessage::Code(code) => (GLM4_CODE_TOOL, &code.input),
                };
                turn.ids.push(self.roles.assistant);
                turn.ids.extend(self.codec.encode(&format!("{metadata}\n{payload}"))?);
            }
            return Ok(turn);
        }

        turn.ids.push(self.roles.id(message.role));
        match self.image.filter(|_| with_image) {
            Some(markers) => {
                turn.ids.extend(self.codec.encode("\n")?);
                turn.ids.extend([markers.begin, markers.end]);
                turn.ids.extend(self.codec.encode(&message.content)?);
                turn.extra_positions = markers.positions;
            }
            None => turn.ids.extend(self.codec.encode(&format!("\n{}", message.content))?),
        }
        Ok(turn)
    }
}

impl Tokenizer for ChatGlm4Tokenizer {
    fn encode(&self, text: &str, max_length: usize) -> Result<Vec<u32>> {
        let mut ids = self.prefix();
        ids.extend(self.codec.encode(text)?);
        Ok(truncate_keep_prefix(ids, 2, max_length))
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let skip: &[u32] = if skip_special_tokens { &self.skip_ids } else { &[] };
        decode_with(self.codec.as_ref(), ids, skip)
    }

    fn apply_chat_template(&self, messages: &[ChatMessage], max_length: usize) -> Result<Vec<u32>> {
        if self.image.is_none() {
            reject_images(self.model_type, messages)?;
        }
        if messages.is_empty() {
            return Err(EngineError::template("conversation is empty"));
        }

        // only the most recent image is fed to the vision tower
        let image_index = messages.iter().rposition(|m| m.image.is_some());
        let ignored = messages.iter().filter(|m| m.image.is_some()).count().saturating_sub(1);
        if ignored > 0 {
            debug!(ignored, "Ignoring images older than the most recent one");
        }

        let mut prompt = RenderedPrompt {
            prefix: self.prefix(),
            suffix: vec![self.roles.assistant],
            ..Default::default()
        };
        for (i, message) in messages.iter().enumerate() {
            prompt.turns.push(self.render_message(message, image_index == Some(i))?);
        }
        prompt.pin_system_and_last(messages[0].role == Role::System);
        Ok(prompt.fit(max_length, self.truncation))
    }

    fn decode_message(&self, ids: &[u32]) -> Result<ChatMessage> {
        // tool calls end on the observation role token
        let wants_observation = ids.last() == Some(&self.roles.observation);
        let text = self.decode(ids, true)?;
        if wants_observation {
            if let Some(parsed) = tool_call::parse_glm4(&text) {
                debug!(tool = parsed.call.type_name(), "Parsed tool call");
                return Ok(ChatMessage::assistant(parsed.content).with_tool_calls(vec![parsed.call]));
            }
        }
        let (metadata, body) = split_metadata(&text);
        let content = if metadata.trim().is_empty() { body } else { text.as_str() };
        Ok(ChatMessage::assistant(content.trim()))
    }
}
