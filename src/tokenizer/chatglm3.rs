use std::sync::Arc;

use tracing::debug;

use super::template::{truncate_keep_prefix, RenderedPrompt, RenderedTurn, TruncationPolicy};
use super::tool_call::{self, GLM3_CODE_TOOL};
use super::{
    decode_with, reject_images, require_token, skip_set, split_metadata, SubwordCodec, Tokenizer,
};
use crate::config::{ModelConfig, ModelType};
use crate::error::{EngineError, Result};
use crate::types::{ChatMessage, Role, ToolCallMessage};

/// Role marker ids shared by the third and fourth generation formats.
#[derive(Debug, Clone, Copy)]
pub(super) struct RoleTokens {
    pub system: u32,
    pub user: u32,
    pub assistant: u32,
    pub observation: u32,
}

impl RoleTokens {
    pub fn resolve(codec: &dyn SubwordCodec) -> Result<Self> {
        Ok(Self {
            system: require_token(codec, "<|system|>")?,
            user: require_token(codec, "<|user|>")?,
            assistant: require_token(codec, "<|assistant|>")?,
            observation: require_token(codec, "<|observation|>")?,
        })
    }

    pub fn id(&self, role: Role) -> u32 {
        match role {
            Role::System => self.system,
            Role::User => self.user,
            Role::Assistant => self.assistant,
            Role::Observation => self.observation,
        }
    }

    pub fn all(&self) -> [u32; 4] {
        [self.system, self.user, self.assistant, self.observation]
    }
}

/// Third-generation tokenizer with role markers and fenced tool calls.
pub struct ChatGlm3Tokenizer {
    codec: Arc<dyn SubwordCodec>,
    gmask_token_id: u32,
    sop_token_id: u32,
    roles: RoleTokens,
    skip_ids: Vec<u32>,
    truncation: TruncationPolicy,
}

impl ChatGlm3Tokenizer {
    pub fn new(
        config: &ModelConfig,
        codec: Arc<dyn SubwordCodec>,
        truncation: TruncationPolicy,
    ) -> Result<Self> {
        let gmask_token_id = require_token(codec.as_ref(), "[gMASK]")?;
        let sop_token_id = require_token(codec.as_ref(), "sop")?;
        let eop_token_id = require_token(codec.as_ref(), "eop")?;
        let roles = RoleTokens::resolve(codec.as_ref())?;

        let mut structural = vec![gmask_token_id, sop_token_id, eop_token_id];
        structural.extend(roles.all());
        Ok(Self {
            skip_ids: skip_set(config, &structural),
            codec,
            gmask_token_id,
            sop_token_id,
            roles,
            truncation,
        })
    }

    fn prefix(&self) -> Vec<u32> {
        vec![self.gmask_token_id, self.sop_token_id]
    }

    /// `<|role|>{metadata}\n{content}`
    fn encode_single_message(&self, role: Role, metadata: &str, content: &str) -> Result<Vec<u32>> {
        let mut ids = vec![self.roles.id(role)];
        ids.extend(self.codec.encode(metadata)?);
        ids.extend(self.codec.encode("\n")?);
        ids.extend(self.codec.encode(content)?);
        Ok(ids)
    }

    fn render_message(&self, message: &ChatMessage) -> Result<Vec<u32>> {
        if message.role != Role::Assistant || message.tool_calls.is_empty() {
            return self.encode_single_message(message.role, "", &message.content);
        }
        let mut ids = Vec::new();
        if !message.content.is_empty() {
            ids.extend(self.encode_single_message(Role::Assistant, "", &message.content)?);
        }
        for call in &message.tool_calls {
            let (metadata, payload) = match call {
                ToolCallMessage::Function(function) => (function.name.as_str(), &function.arguments),
                ToolCallMessage::Code(code) => (GLM3_CODE_TOOL, &code.input),
            };
            let body = format!(" ```python\n{payload}\n```");
            ids.extend(self.encode_single_message(Role::Assistant, metadata, &body)?);
        }
        Ok(ids)
    }
}

impl Tokenizer for ChatGlm3Tokenizer {
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
        reject_images(ModelType::ChatGlm3, messages)?;
        if messages.is_empty() {
            return Err(EngineError::template("conversation is empty"));
        }
        let mut prompt = RenderedPrompt {
            prefix: self.prefix(),
            suffix: vec![self.roles.assistant],
            ..Default::default()
        };
        for message in messages {
            prompt.turns.push(RenderedTurn::new(self.render_message(message)?));
        }
        prompt.pin_system_and_last(messages[0].role == Role::System);
        Ok(prompt.fit(max_length, self.truncation))
    }

    fn decode_message(&self, ids: &[u32]) -> Result<ChatMessage> {
        let wants_observation = ids.last() == Some(&self.roles.observation);
        let text = self.decode(ids, true)?;

        if wants_observation {
            if let Some(parsed) = tool_call::parse_glm3(&text) {
                debug!(tool = parsed.call.type_name(), "Parsed tool call");
                return Ok(ChatMessage::assistant(parsed.content).with_tool_calls(vec![parsed.call]));
            }
        }
        let (metadata, body) = split_metadata(&text);
        let content = if metadata.trim().is_empty() { body } else { text.as_str() };
        Ok(ChatMessage::assistant(content.trim()))
    }
}
