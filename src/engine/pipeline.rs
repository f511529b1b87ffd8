use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, error, info, info_span, trace, warn};

use super::builder::PipelineBuilder;
use super::session::{
    CancellationFlag, DecodeSession, GenerationOutput, GenerationStats, StopReason,
};
use super::streamer::Streamer;
use crate::config::{GenerationConfig, ModelConfig};
use crate::error::{EngineError, ErrorExt, Result};
use crate::model::{self, CausalLm};
use crate::tokenizer::Tokenizer;
use crate::types::{ChatMessage, Image};

/// Assistant reply together with how its generation went.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub stop_reason: StopReason,
    pub stats: GenerationStats,
}

/// One model with its tokenizer, running prompt-to-reply generation.
///
/// A pipeline runs one generation at a time; every call starts from an
/// empty KV cache.
pub struct Pipeline {
    model: Box<dyn CausalLm>,
    tokenizer: Arc<dyn Tokenizer>,
    generation_config: GenerationConfig,
    rng: StdRng,
}

impl Pipeline {
    /// Loads the model directory (or single `.safetensors` file) at `path`
    /// on the preferred device.
    pub fn new(path: impl AsRef<Path>, max_length: Option<usize>) -> Result<Self> {
        let mut builder = Self::builder(path);
        if let Some(max_length) = max_length {
            builder = builder.with_max_length(max_length);
        }
        builder.build()
    }

    pub fn builder(path: impl AsRef<Path>) -> PipelineBuilder {
        PipelineBuilder::new(path)
    }

    /// Assembles a pipeline from an already loaded model and tokenizer.
    pub fn from_parts(model: Box<dyn CausalLm>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            model,
            tokenizer,
            generation_config: GenerationConfig::default(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Reseeds the sampler so runs are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Replaces the settings used by [`Pipeline::chat_default`].
    pub fn with_generation_config(mut self, generation_config: GenerationConfig) -> Self {
        self.generation_config = generation_config;
        self
    }

    pub fn model(&self) -> &dyn CausalLm {
        self.model.as_ref()
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn config(&self) -> &ModelConfig {
        self.model.config()
    }

    /// Settings shipped with the model, or the defaults.
    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    /// Ids a prompt may occupy under `gen_config`.
    fn prompt_budget(&self, gen_config: &GenerationConfig) -> usize {
        gen_config
            .max_context_length
            .min(gen_config.max_length)
            .min(self.model.config().max_length)
    }

    /// Runs the decode loop on `input_ids` until a stop rule matches.
    ///
    /// The first step prefills the whole prompt, each later step decodes
    /// one id. `streamer` sees every generated id, eos included, and is
    /// closed when the loop ends. `cancel` is checked before each step and
    /// leaves the KV cache consistent with the ids produced so far.
    pub fn generate(
        &mut self,
        input_ids: &[u32],
        image: Option<&Image>,
        gen_config: &GenerationConfig,
        mut streamer: Option<&mut dyn Streamer>,
        cancel: Option<&CancellationFlag>,
    ) -> Result<GenerationOutput> {
        gen_config.validate()?;
        if input_ids.is_empty() {
            return Err(EngineError::Validation {
                message: "prompt is empty".to_string(),
            });
        }

        let config = self.model.config();
        let image = match image {
            Some(_) if config.vision.is_some() && model::find_image_slot(input_ids, config).is_none() => {
                debug!("Prompt has no image slot, ignoring image");
                None
            }
            image => image,
        };
        let prompt_positions = self.model.count_tokens(input_ids, image);
        if prompt_positions > config.max_length {
            return Err(EngineError::ContextOverflow {
                required: prompt_positions,
                capacity: config.max_length,
            });
        }

        let mut session = DecodeSession::new(input_ids.to_vec(), prompt_positions, gen_config, config);
        let mut stats = GenerationStats {
            prompt_tokens: prompt_positions,
            ..Default::default()
        };

        let span = info_span!("generate", prompt_tokens = prompt_positions);
        let _guard = span.enter();

        self.model.reset_cache();
        let stop_reason = match session.stop_before_start() {
            Some(reason) => reason,
            None => match self.decode_loop(&mut session, image, gen_config, &mut stats, &mut streamer, cancel) {
                Ok(reason) => reason,
                Err(e) => {
                    // a failed step can leave a partial prefix in the KV cache
                    self.model.reset_cache();
                    if e.is_fatal() {
                        error!(error = %e, n_past = session.n_past(), "Generation failed");
                    } else {
                        warn!(
                            error = %e,
                            recoverable = e.is_recoverable(),
                            n_past = session.n_past(),
                            "Generation step failed"
                        );
                    }
                    return Err(e);
                }
            },
        };
        if let Some(streamer) = streamer.as_mut() {
            streamer.end()?;
        }

        stats.generated_tokens = session.generated().len();
        info!(
            %stop_reason,
            generated = stats.generated_tokens,
            prefill_tps = stats.prefill_tokens_per_second(),
            decode_tps = stats.decode_tokens_per_second(),
            "Generation finished"
        );
        Ok(GenerationOutput {
            ids: session.generated().to_vec(),
            stop_reason,
            stats,
        })
    }

    fn decode_loop(
        &mut self,
        session: &mut DecodeSession,
        image: Option<&Image>,
        gen_config: &GenerationConfig,
        stats: &mut GenerationStats,
        streamer: &mut Option<&mut dyn Streamer>,
        cancel: Option<&CancellationFlag>,
    ) -> Result<StopReason> {
        let prefill_start = Instant::now();
        let mut decode_start = None;
        loop {
            if cancel.is_some_and(CancellationFlag::is_cancelled) {
                debug!(n_past = session.n_past(), "Generation cancelled");
                break Ok(StopReason::Cancelled);
            }

            let token = self.model.generate_next_token(
                session.history(),
                image,
                gen_config,
                session.n_past(),
                session.n_ctx(),
                &mut self.rng,
            )?;
            if session.is_prefill() {
                stats.prefill_time = prefill_start.elapsed();
                decode_start = Some(Instant::now());
            } else if let Some(start) = decode_start {
                stats.decode_time = start.elapsed();
            }
            session.record(token);
            trace!(token, n_past = session.n_past(), "Generated token");

            if let Some(streamer) = streamer.as_mut() {
                streamer.put(&[token])?;
            }
            if let Some(reason) = session.stop_reason(token, self.model.config()) {
                break Ok(reason);
            }
        }
    }

    /// Completes a plain text prompt.
    pub fn generate_text(&mut self, prompt: &str, gen_config: &GenerationConfig) -> Result<String> {
        let input_ids = self.tokenizer.encode(prompt, self.prompt_budget(gen_config))?;
        let output = self.generate(&input_ids, None, gen_config, None, None)?;
        self.tokenizer.decode(&output.ids, true)
    }

    /// Replies to a conversation.
    pub fn chat(&mut self, messages: &[ChatMessage], gen_config: &GenerationConfig) -> Result<ChatMessage> {
        Ok(self.chat_with(messages, gen_config, None, None)?.message)
    }

    /// Replies to a conversation with the pipeline's own generation settings.
    pub fn chat_default(&mut self, messages: &[ChatMessage]) -> Result<ChatMessage> {
        let gen_config = self.generation_config.clone();
        self.chat(messages, &gen_config)
    }

    /// Replies to a conversation, streaming ids and honoring `cancel`.
    ///
    /// The most recent image in `messages` is used when the rendered prompt
    /// still holds its slot.
    pub fn chat_with(
        &mut self,
        messages: &[ChatMessage],
        gen_config: &GenerationConfig,
        streamer: Option<&mut dyn Streamer>,
        cancel: Option<&CancellationFlag>,
    ) -> Result<ChatResponse> {
        let input_ids = self
            .tokenizer
            .apply_chat_template(messages, self.prompt_budget(gen_config))?;
        let image = messages.iter().rev().find_map(|m| m.image.as_ref());
        let output = self.generate(&input_ids, image, gen_config, streamer, cancel)?;
        let message = self.tokenizer.decode_message(&output.ids)?;
        Ok(ChatResponse {
            message,
            stop_reason: output.stop_reason,
            stats: output.stats,
        })
    }
}
