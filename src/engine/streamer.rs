//! Incremental delivery of generated text.

use std::io::Write;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::session::CancellationFlag;
use crate::error::{EngineError, Result};
use crate::tokenizer::{Tokenizer, UNKNOWN_PLACEHOLDER};

/// Receives token ids as they are generated.
pub trait Streamer: Send {
    fn put(&mut self, token_ids: &[u32]) -> Result<()>;

    /// Called once after the last token of a run.
    fn end(&mut self) -> Result<()>;
}

/// Turns a growing id sequence into printable text deltas, holding back
/// output while the tail decodes to an incomplete character.
pub(crate) struct IncrementalDecoder {
    tokenizer: Arc<dyn Tokenizer>,
    token_cache: Vec<u32>,
    print_len: usize,
}

impl IncrementalDecoder {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            token_cache: Vec::new(),
            print_len: 0,
        }
    }

    pub fn push(&mut self, token_ids: &[u32]) -> Result<String> {
        self.token_cache.extend_from_slice(token_ids);
        let text = self.tokenizer.decode(&self.token_cache, true)?;
        let delta = text.get(self.print_len..).unwrap_or_default().to_string();
        if text.ends_with('\n') {
            // a finished line never changes, start over
            self.token_cache.clear();
            self.print_len = 0;
            return Ok(delta);
        }
        if text.ends_with(UNKNOWN_PLACEHOLDER) {
            return Ok(String::new());
        }
        self.print_len = text.len();
        Ok(delta)
    }

    pub fn finish(&mut self) -> Result<String> {
        let text = self.tokenizer.decode(&self.token_cache, true)?;
        let delta = text.get(self.print_len..).unwrap_or_default().to_string();
        self.token_cache.clear();
        self.print_len = 0;
        Ok(delta)
    }
}

/// Writes decoded text to `writer` as it becomes printable.
pub struct TextStreamer<W: Write + Send> {
    decoder: IncrementalDecoder,
    writer: W,
}

impl<W: Write + Send> TextStreamer<W> {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, writer: W) -> Self {
        Self {
            decoder: IncrementalDecoder::new(tokenizer),
            writer,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_all(text.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(EngineError::Stream)
    }
}

impl TextStreamer<std::io::Stdout> {
    pub fn stdout(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self::new(tokenizer, std::io::stdout())
    }
}

impl<W: Write + Send> Streamer for TextStreamer<W> {
    fn put(&mut self, token_ids: &[u32]) -> Result<()> {
        let delta = self.decoder.push(token_ids)?;
        if !delta.is_empty() {
            self.write(&delta)?;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let delta = self.decoder.finish()?;
        self.write(&format!("{delta}\n"))
    }
}

/// Forwards text deltas over a channel. A closed receiver cancels the run.
pub(crate) struct ChannelStreamer {
    decoder: IncrementalDecoder,
    sender: mpsc::Sender<String>,
    cancel: CancellationFlag,
}

impl ChannelStreamer {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, sender: mpsc::Sender<String>, cancel: CancellationFlag) -> Self {
        Self {
            decoder: IncrementalDecoder::new(tokenizer),
            sender,
            cancel,
        }
    }

    fn send(&mut self, delta: String) {
        if delta.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        if self.sender.blocking_send(delta).is_err() {
            self.cancel.cancel();
        }
    }
}

impl Streamer for ChannelStreamer {
    fn put(&mut self, token_ids: &[u32]) -> Result<()> {
        let delta = self.decoder.push(token_ids)?;
        self.send(delta);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let delta = self.decoder.finish()?;
        self.send(delta);
        Ok(())
    }
}
