use std::sync::Arc;

use super::chatglm::split_round_messages;
use super::template::{truncate_keep_prefix, RenderedPrompt, RenderedTurn, TruncationPolicy};
use super::{decode_with, reject_images, require_token, skip_set, SubwordCodec, Tokenizer};
use crate::config::{ModelConfig, ModelType};
use crate::error::Result;
use crate::types::{ChatMessage, Role};

/// Second-generation tokenizer. Prompts start with `[gMASK] sop` and use
/// numbered rounds starting at 1.
pub struct ChatGlm2Tokenizer {
    codec: Arc<dyn SubwordCodec>,
    gmask_token_id: u32,
    sop_token_id: u32,
    skip_ids: Vec<u32>,
    truncation: TruncationPolicy,
}

impl ChatGlm2Tokenizer {
    pub fn new(
        config: &ModelConfig,
        codec: Arc<dyn SubwordCodec>,
        truncation: TruncationPolicy,
    ) -> Result<Self> {
        let gmask_token_id = require_token(codec.as_ref(), "[gMASK]")?;
        let sop_token_id = require_token(codec.as_ref(), "sop")?;
        let eop_token_id = require_token(codec.as_ref(), "eop")?;
        Ok(Self {
            skip_ids: skip_set(config, &[gmask_token_id, sop_token_id, eop_token_id]),
            codec,
            gmask_token_id,
            sop_token_id,
            truncation,
        })
    }

    fn prefix(&self) -> Vec<u32> {
        vec![self.gmask_token_id, self.sop_token_id]
    }
}

impl Tokenizer for ChatGlm2Tokenizer {
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
        reject_images(ModelType::ChatGlm2, messages)?;
        let (system, turns) = split_round_messages(ModelType::ChatGlm2, messages)?;

        let mut prompt = RenderedPrompt {
            prefix: self.prefix(),
            ..Default::default()
        };
        if let Some(system) = system {
            let ids = self.codec.encode(&format!("{}\n\n", system.content))?;
            prompt.turns.push(RenderedTurn::new(ids));
        }
        let mut round = 1;
        for message in turns {
            let piece = match message.role {
                Role::User => format!("[Round {round}]\n\n问：{}\n\n答：", message.content),
                _ => {
                    round += 1;
                    format!("{}\n\n", message.content)
                }
            };
            prompt.turns.push(RenderedTurn::new(self.codec.encode(&piece)?));
        }
        prompt.pin_system_and_last(system.is_some());
        Ok(prompt.fit(max_length, self.truncation))
    }

    fn decode_message(&self, ids: &[u32]) -> Result<ChatMessage> {
        Ok(ChatMessage::assistant(self.decode(ids, true)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{byte_ids, special_id, tiny_config, ByteCodec};
    use pretty_assertions::assert_eq;

    fn tokenizer() -> ChatGlm2Tokenizer {
        ChatGlm2Tokenizer::new(
            &tiny_config(ModelType::ChatGlm2),
            Arc::new(ByteCodec),
            TruncationPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_encode_keeps_prefix_when_truncating() {
        let ids = tokenizer().encode("abcdef", 4).unwrap();
        let mut expected = vec![special_id("[gMASK]"), special_id("sop")];
        expected.extend(byte_ids("ef"));
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_rounds_start_at_one() {
        let tokenizer = tokenizer();
        let messages = vec![
            ChatMessage::user("你好"),
            ChatMessage::assistant("你好👋！"),
            ChatMessage::user("晚上睡不着应该怎么办"),
        ];
        let ids = tokenizer.apply_chat_template(&messages, 256).unwrap();
        assert_eq!(&ids[..2], &[special_id("[gMASK]"), special_id("sop")]);
        assert_eq!(
            tokenizer.decode(&ids, true).unwrap(),
            "[Round 1]\n\n问：你好\n\n答：你好👋！\n\n[Round 2]\n\n问：晚上睡不着应该怎么办\n\n答："
        );
    }

    #[test]
    fn test_system_preamble() {
        let tokenizer = tokenizer();
        let messages = vec![ChatMessage::system("Be brief."), ChatMessage::user("hi")];
        let ids = tokenizer.apply_chat_template(&messages, 256).unwrap();
        assert_eq!(
            tokenizer.decode(&ids, true).unwrap(),
            "Be brief.\n\n[Round 1]\n\n问：hi\n\n答："
        );
    }
}
