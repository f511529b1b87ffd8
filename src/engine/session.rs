use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{GenerationConfig, ModelConfig};

/// Why a generation run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// An end-of-sequence id was produced
    Eos,
    /// The sequence reached `max_length`
    MaxLength,
    /// `max_new_tokens` ids were produced
    MaxNewTokens,
    /// The sequence reached `max_context_length`
    ContextExhausted,
    /// The caller cancelled the run
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Eos => "eos",
            StopReason::MaxLength => "max_length",
            StopReason::MaxNewTokens => "max_new_tokens",
            StopReason::ContextExhausted => "context_exhausted",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Timing and size figures of one generation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    /// Positions occupied by the prompt, image slots included
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prefill_time: Duration,
    pub decode_time: Duration,
}

impl GenerationStats {
    pub fn prefill_tokens_per_second(&self) -> f64 {
        rate(self.prompt_tokens, self.prefill_time)
    }

    /// Throughput of the steps after the first generated token.
    pub fn decode_tokens_per_second(&self) -> f64 {
        rate(self.generated_tokens.saturating_sub(1), self.decode_time)
    }
}

fn rate(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Generated ids with the reason generation ended.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub ids: Vec<u32>,
    pub stop_reason: StopReason,
    pub stats: GenerationStats,
}

/// Shared flag for stopping a run between decoding steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bookkeeping for one prompt-to-stop run.
///
/// `n_past` counts positions already in the KV cache. The first step
/// consumes every prompt position, each later step consumes one.
#[derive(Debug, Clone)]
pub struct DecodeSession {
    history: Vec<u32>,
    prompt_len: usize,
    prompt_positions: usize,
    n_past: usize,
    max_length: usize,
    max_new_tokens: Option<usize>,
    max_context_length: usize,
}

impl DecodeSession {
    pub fn new(
        prompt: Vec<u32>,
        prompt_positions: usize,
        gen_config: &GenerationConfig,
        model_config: &ModelConfig,
    ) -> Self {
        Self {
            prompt_len: prompt.len(),
            history: prompt,
            prompt_positions,
            n_past: 0,
            max_length: gen_config.max_length.min(model_config.max_length),
            max_new_tokens: gen_config.max_new_tokens,
            max_context_length: gen_config.max_context_length,
        }
    }

    /// Prompt followed by every generated id.
    pub fn history(&self) -> &[u32] {
        &self.history
    }

    pub fn generated(&self) -> &[u32] {
        &self.history[self.prompt_len..]
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    /// Prompt length in ids.
    pub fn n_ctx(&self) -> usize {
        self.prompt_len
    }

    pub fn is_prefill(&self) -> bool {
        self.n_past == 0
    }

    /// Records `token` as the output of the step that just ran.
    pub fn record(&mut self, token: u32) {
        self.n_past += if self.is_prefill() {
            self.prompt_positions
        } else {
            1
        };
        self.history.push(token);
    }

    /// Positions in the sequence so far. The most recent id is not in the
    /// KV cache yet.
    fn seq_len(&self) -> usize {
        self.n_past + 1
    }

    /// Stop rule that holds before any step runs: a prompt already filling
    /// `max_length` or `max_context_length`, or a zero `max_new_tokens`.
    pub fn stop_before_start(&self) -> Option<StopReason> {
        if self.prompt_positions >= self.max_length {
            Some(StopReason::MaxLength)
        } else if self.max_new_tokens == Some(0) {
            Some(StopReason::MaxNewTokens)
        } else if self.prompt_positions >= self.max_context_length {
            Some(StopReason::ContextExhausted)
        } else {
            None
        }
    }

    /// First matching stop rule for the most recently recorded `token`.
    pub fn stop_reason(&self, token: u32, model_config: &ModelConfig) -> Option<StopReason> {
        if model_config.is_eos(token) {
            Some(StopReason::Eos)
        } else if self.seq_len() >= self.max_length {
            Some(StopReason::MaxLength)
        } else if self
            .max_new_tokens
            .is_some_and(|limit| self.generated().len() >= limit)
        {
            Some(StopReason::MaxNewTokens)
        } else if self.seq_len() >= self.max_context_length {
            Some(StopReason::ContextExhausted)
        } else {
            None
        }
    }
}
