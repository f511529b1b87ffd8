use std::sync::Arc;

use super::template::{truncate_keep_tail, RenderedPrompt, RenderedTurn, TruncationPolicy};
use super::{decode_with, reject_images, require_token, skip_set, SubwordCodec, Tokenizer};
use crate::config::{ModelConfig, ModelType};
use crate::error::{EngineError, Result};
use crate::types::{ChatMessage, Role};

const MAX_BLANK_RUN: usize = 80;

/// First-generation tokenizer. Whitespace is spelled out as dedicated
/// tokens and every prompt ends with `[gMASK] <sop>`.
pub struct ChatGlmTokenizer {
    codec: Arc<dyn SubwordCodec>,
    gmask_token_id: u32,
    sop_token_id: u32,
    skip_ids: Vec<u32>,
    truncation: TruncationPolicy,
}

impl ChatGlmTokenizer {
    pub fn new(
        config: &ModelConfig,
        codec: Arc<dyn SubwordCodec>,
        truncation: TruncationPolicy,
    ) -> Result<Self> {
        let gmask_token_id = require_token(codec.as_ref(), "[gMASK]")?;
        let sop_token_id = require_token(codec.as_ref(), "<sop>")?;
        let structural = [
            gmask_token_id,
            sop_token_id,
            require_token(codec.as_ref(), "<eop>")?,
            require_token(codec.as_ref(), "[MASK]")?,
        ];
        Ok(Self {
            skip_ids: skip_set(config, &structural),
            codec,
            gmask_token_id,
            sop_token_id,
            truncation,
        })
    }

    fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        self.codec.encode(&preprocess(text))
    }
}

impl Tokenizer for ChatGlmTokenizer {
    fn encode(&self, text: &str, max_length: usize) -> Result<Vec<u32>> {
        let mut ids = self.encode_text(text)?;
        ids.extend([self.gmask_token_id, self.sop_token_id]);
        Ok(truncate_keep_tail(ids, max_length))
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let skip: &[u32] = if skip_special_tokens { &self.skip_ids } else { &[] };
        let text = decode_with(self.codec.as_ref(), ids, skip)?;
        Ok(postprocess(&text))
    }

    fn apply_chat_template(&self, messages: &[ChatMessage], max_length: usize) -> Result<Vec<u32>> {
        reject_images(ModelType::ChatGlm, messages)?;
        let (system, turns) = split_round_messages(ModelType::ChatGlm, messages)?;

        let mut prompt = RenderedPrompt {
            suffix: vec![self.gmask_token_id, self.sop_token_id],
            ..Default::default()
        };
        if let Some(system) = system {
            prompt
                .turns
                .push(RenderedTurn::new(self.encode_text(&format!("{}\n", system.content))?));
        }

        if let [only] = turns {
            // single-turn prompts are fed bare
            prompt.turns.push(RenderedTurn::new(self.encode_text(&only.content)?));
        } else {
            let mut round = 0;
            for message in turns {
                let piece = match message.role {
                    Role::User => format!("[Round {round}]\n问：{}\n答：", message.content),
                    _ => {
                        round += 1;
                        format!("{}\n", message.content)
                    }
                };
                prompt.turns.push(RenderedTurn::new(self.encode_text(&piece)?));
            }
        }
        prompt.pin_system_and_last(system.is_some());
        Ok(prompt.fit(max_length, self.truncation))
    }

    fn decode_message(&self, ids: &[u32]) -> Result<ChatMessage> {
        Ok(ChatMessage::assistant(self.decode(ids, true)?))
    }
}

/// Validates a round-based conversation: an optional leading system
/// message, then alternating user/assistant turns ending with a user turn.
pub(super) fn split_round_messages(
    model_type: ModelType,
    messages: &[ChatMessage],
) -> Result<(Option<&ChatMessage>, &[ChatMessage])> {
    let (system, turns) = match messages.split_first() {
        Some((first, rest)) if first.role == Role::System => (Some(first), rest),
        _ => (None, messages),
    };
    if turns.is_empty() {
        return Err(EngineError::template("conversation has no user message"));
    }
    for (i, message) in turns.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        if message.role != expected {
            return Err(EngineError::template(format!(
                "{} expects alternating user/assistant turns, found {} at position {i}",
                model_type.name(),
                message.role
            )));
        }
    }
    if turns.len() % 2 == 0 {
        return Err(EngineError::template("conversation must end with a user message"));
    }
    Ok((system, turns))
}

fn preprocess(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut blanks = 0;
    let flush = |output: &mut String, blanks: &mut usize| {
        while *blanks > 0 {
            let run = (*blanks).min(MAX_BLANK_RUN);
            if run == 1 {
                output.push(' ');
            } else {
                output.push_str(&format!("<|blank_{run}|>"));
            }
            *blanks -= run;
        }
    };
    for c in text.chars() {
        if c == ' ' {
            blanks += 1;
            continue;
        }
        flush(&mut output, &mut blanks);
        match c {
            '\n' => output.push_str("<n>"),
            '\t' => output.push_str("<|tab|>"),
            _ => output.push(c),
        }
    }
    flush(&mut output, &mut blanks);
    output
}

fn postprocess(text: &str) -> String {
    let text = text.replace("<n>", "\n").replace("<|tab|>", "\t");
    let mut output = String::with_capacity(text.len());
    let mut rest = text.as_str();
    while let Some(start) = rest.find("<|blank_") {
        output.push_str(&rest[..start]);
        let tail = &rest[start + "<|blank_".len()..];
        let count = tail
            .find("|>")
            .and_then(|end| tail[..end].parse::<usize>().ok().map(|n| (n, end)));
        match count {
            Some((n, end)) => {
                output.extend(std::iter::repeat(' ').take(n));
                rest = &tail[end + 2..];
            }
            None => {
                output.push_str("<|blank_");
                rest = tail;
            }
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{byte_ids, special_id, tiny_config, ByteCodec};
    use pretty_assertions::assert_eq;

    fn tokenizer() -> ChatGlmTokenizer {
        ChatGlmTokenizer::new(
            &tiny_config(ModelType::ChatGlm),
            Arc::new(ByteCodec),
            TruncationPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_whitespace_tokens() {
        assert_eq!(preprocess("a\nb\tc  d e"), "a<n>b<|tab|>c<|blank_2|>d e");
        assert_eq!(postprocess("a<n>b<|tab|>c<|blank_2|>d e"), "a\nb\tc  d e");
        assert_eq!(postprocess("<|blank_x|>"), "<|blank_x|>");

        let long = " ".repeat(MAX_BLANK_RUN + 3);
        assert_eq!(postprocess(&preprocess(&long)), long);
    }

    #[test]
    fn test_encode_appends_generation_markers() {
        let ids = tokenizer().encode("hi", 64).unwrap();
        let mut expected = byte_ids("hi");
        expected.extend([special_id("[gMASK]"), special_id("<sop>")]);
        assert_eq!(ids, expected);

        // the tail survives truncation
        let ids = tokenizer().encode("hello", 3).unwrap();
        assert_eq!(ids, vec![64 + b'o' as u32, special_id("[gMASK]"), special_id("<sop>")]);
    }

    #[test]
    fn test_single_turn_is_bare() {
        let tokenizer = tokenizer();
        let ids = tokenizer
            .apply_chat_template(&[ChatMessage::user("你好")], 64)
            .unwrap();
        assert_eq!(tokenizer.decode(&ids, false).unwrap(), "你好[gMASK]<sop>");
    }

    #[test]
    fn test_multi_turn_rounds() {
        let tokenizer = tokenizer();
        let messages = vec![
            ChatMessage::user("你好"),
            ChatMessage::assistant("你好👋"),
            ChatMessage::user("晚上睡不着应该怎么办"),
        ];
        let ids = tokenizer.apply_chat_template(&messages, 256).unwrap();
        assert_eq!(
            tokenizer.decode(&ids, true).unwrap(),
            "[Round 0]\n问：你好\n答：你好👋\n[Round 1]\n问：晚上睡不着应该怎么办\n答："
        );
    }

    #[test]
    fn test_rejects_observation_and_bad_order() {
        let tokenizer = tokenizer();
        let messages = vec![ChatMessage::user("hi"), ChatMessage::observation("{}")];
        assert!(matches!(
            tokenizer.apply_chat_template(&messages, 64),
            Err(EngineError::Template { .. })
        ));
        let messages = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        assert!(tokenizer.apply_chat_template(&messages, 64).is_err());
        assert!(tokenizer.apply_chat_template(&[], 64).is_err());
    }
}
