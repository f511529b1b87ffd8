//! Engine module: the generation loop and its synchronous and async front ends

mod async_pipeline;
mod builder;
mod pipeline;
mod session;
mod streamer;

pub use async_pipeline::{AsyncPipeline, ChatStream};
pub use builder::PipelineBuilder;
pub use pipeline::{ChatResponse, Pipeline};
pub use session::{
    CancellationFlag, DecodeSession, GenerationOutput, GenerationStats, StopReason,
};
pub use streamer::{Streamer, TextStreamer};
