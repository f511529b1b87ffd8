//! Tokio front end for sharing one [`Pipeline`] between tasks.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::pipeline::{ChatResponse, Pipeline};
use super::session::CancellationFlag;
use super::streamer::ChannelStreamer;
use crate::config::GenerationConfig;
use crate::error::{EngineError, Result};
use crate::tokenizer::Tokenizer;
use crate::types::ChatMessage;

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Runs generation on the blocking thread pool. Calls are serialized on
/// the inner pipeline.
#[derive(Clone)]
pub struct AsyncPipeline {
    inner: Arc<Mutex<Pipeline>>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl AsyncPipeline {
    pub fn new(pipeline: Pipeline) -> Self {
        let tokenizer = pipeline.tokenizer().clone();
        Self {
            inner: Arc::new(Mutex::new(pipeline)),
            tokenizer,
        }
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub async fn chat(&self, messages: Vec<ChatMessage>, gen_config: GenerationConfig) -> Result<ChatResponse> {
        let inner = self.inner.clone();
        join(tokio::task::spawn_blocking(move || {
            inner.lock().chat_with(&messages, &gen_config, None, None)
        }))
        .await
    }

    pub async fn generate_text(&self, prompt: String, gen_config: GenerationConfig) -> Result<String> {
        let inner = self.inner.clone();
        join(tokio::task::spawn_blocking(move || {
            inner.lock().generate_text(&prompt, &gen_config)
        }))
        .await
    }

    /// Starts a reply and returns its text deltas as they are produced.
    ///
    /// Must be called from within a Tokio runtime. Dropping the stream
    /// cancels the generation at its next step.
    pub fn chat_stream(&self, messages: Vec<ChatMessage>, gen_config: GenerationConfig) -> ChatStream {
        let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationFlag::new();
        let inner = self.inner.clone();
        let tokenizer = self.tokenizer.clone();
        let flag = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut streamer = ChannelStreamer::new(tokenizer, sender, flag.clone());
            inner
                .lock()
                .chat_with(&messages, &gen_config, Some(&mut streamer), Some(&flag))
        });
        ChatStream {
            receiver,
            cancel,
            handle: Some(handle),
        }
    }
}

async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .await
        .map_err(|e| EngineError::model(format!("generation task failed: {e}")))?
}

/// Text deltas of a reply in progress.
pub struct ChatStream {
    receiver: mpsc::Receiver<String>,
    cancel: CancellationFlag,
    handle: Option<JoinHandle<Result<ChatResponse>>>,
}

impl ChatStream {
    /// Asks the generation to stop before its next step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Discards any deltas not yet read and waits for the final reply.
    pub async fn finish(mut self) -> Result<ChatResponse> {
        while self.receiver.recv().await.is_some() {}
        match self.handle.take() {
            Some(handle) => join(handle).await,
            None => Err(EngineError::model("reply was already collected")),
        }
    }
}

impl Stream for ChatStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!("Chat stream dropped, cancelling generation");
            self.cancel.cancel();
        }
    }
}
