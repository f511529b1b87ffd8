//! Conversation types shared by tokenizers, models and the pipeline

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Observation,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Observation => "observation",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMessage {
    pub name: String,
    /// Serialized arguments, verbatim as the model produced them
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMessage {
    pub input: String,
}

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolCallMessage {
    Function(FunctionMessage),
    Code(CodeMessage),
}

impl ToolCallMessage {
    pub fn function(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        ToolCallMessage::Function(FunctionMessage {
            name: name.into(),
            arguments: arguments.into(),
        })
    }

    pub fn code(input: impl Into<String>) -> Self {
        ToolCallMessage::Code(CodeMessage {
            input: input.into(),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ToolCallMessage::Function(_) => "function",
            ToolCallMessage::Code(_) => "code",
        }
    }
}

impl fmt::Display for ToolCallMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolCallMessage::Function(func) => {
                write!(f, "FunctionMessage(name={:?}, arguments={:?})", func.name, func.arguments)
            }
            ToolCallMessage::Code(code) => write!(f, "CodeMessage(input={:?})", code.input),
        }
    }
}

/// Row-major, contiguous RGB pixel buffer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ImageParts")]
pub struct Image {
    width: usize,
    height: usize,
    channels: usize,
    pixels: Vec<u8>,
}

impl Image {
    pub const CHANNELS: usize = 3;

    /// Builds an image from a packed `height x width x channels` buffer.
    pub fn new(width: usize, height: usize, channels: usize, pixels: Vec<u8>) -> Result<Self> {
        let expected = Self::packed_len(width, height, channels)?;
        if pixels.len() != expected {
            return Err(EngineError::Validation {
                message: format!(
                    "pixel buffer holds {} bytes, expected {width}x{height}x{channels} = {expected}",
                    pixels.len()
                ),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            pixels,
        })
    }

    /// Byte length of a packed buffer, rejecting empty or oversized shapes.
    fn packed_len(width: usize, height: usize, channels: usize) -> Result<usize> {
        if channels != Self::CHANNELS {
            return Err(EngineError::Validation {
                message: format!("only RGB images are supported, got {channels} channels"),
            });
        }
        if width == 0 || height == 0 {
            return Err(EngineError::Validation {
                message: format!("image must not be empty, got {width}x{height}"),
            });
        }
        width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(channels))
            .ok_or_else(|| EngineError::Validation {
                message: format!("image size {width}x{height}x{channels} overflows"),
            })
    }

    /// Builds an image from a strided `(height, width, channels)` view.
    ///
    /// `strides` are in bytes and must describe a packed layout: each
    /// dimension's stride times its extent equals the stride of the
    /// enclosing dimension, and the channel stride is 1.
    pub fn from_strided(
        width: usize,
        height: usize,
        channels: usize,
        data: &[u8],
        strides: [usize; 3],
    ) -> Result<Self> {
        Self::packed_len(width, height, channels)?;
        let shape = [height, width, channels];
        if strides[2] != 1 {
            return Err(EngineError::Validation {
                message: "only contiguous arrays are supported".to_string(),
            });
        }
        for i in 1..shape.len() {
            if strides[i].checked_mul(shape[i]) != Some(strides[i - 1]) {
                return Err(EngineError::Validation {
                    message: "only contiguous arrays are supported".to_string(),
                });
            }
        }
        Self::new(width, height, channels, data.to_vec())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }

    /// Byte strides matching [`Image::shape`].
    pub fn strides(&self) -> [usize; 3] {
        [self.width * self.channels, self.channels, 1]
    }
}

#[derive(Deserialize)]
struct ImageParts {
    width: usize,
    height: usize,
    channels: usize,
    pixels: Vec<u8>,
}

impl TryFrom<ImageParts> for Image {
    type Error = EngineError;

    fn try_from(parts: ImageParts) -> Result<Self> {
        Image::new(parts.width, parts.height, parts.channels, parts.pixels)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image(width={}, height={}, channels={})",
            self.width, self.height, self.channels
        )
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallMessage>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn observation(content: impl Into<String>) -> Self {
        Self::new(Role::Observation, content)
    }

    pub fn with_image(mut self, image: Image) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallMessage>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChatMessage(role={}, content={:?}", self.role, self.content)?;
        if let Some(image) = &self.image {
            write!(f, ", image={image:?}")?;
        }
        if !self.tool_calls.is_empty() {
            write!(f, ", tool_calls=[")?;
            for (i, call) in self.tool_calls.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{call}")?;
            }
            write!(f, "]")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_image_rejects_wrong_channel_count() {
        let result = Image::new(2, 2, 4, vec![0; 16]);
        assert!(matches!(result, Err(EngineError::Validation { .. })));
    }

    #[test]
    fn test_image_rejects_short_buffer() {
        let result = Image::new(2, 2, 3, vec![0; 11]);
        assert!(matches!(result, Err(EngineError::Validation { .. })));
    }

    #[test]
    fn test_image_rejects_empty_dimensions() {
        for (width, height) in [(0, 0), (0, 4), (4, 0)] {
            let result = Image::new(width, height, 3, Vec::new());
            assert!(matches!(result, Err(EngineError::Validation { .. })), "{width}x{height}");
            let result = Image::from_strided(width, height, 3, &[], [width * 3, 3, 1]);
            assert!(matches!(result, Err(EngineError::Validation { .. })), "{width}x{height}");
        }
    }

    #[test]
    fn test_image_rejects_overflowing_size() {
        let result = Image::new(usize::MAX / 2, 3, 3, vec![0; 9]);
        assert!(matches!(result, Err(EngineError::Validation { .. })));
        let result = Image::from_strided(usize::MAX / 2, 3, 3, &[0; 9], [usize::MAX, 3, 1]);
        assert!(matches!(result, Err(EngineError::Validation { .. })));
    }

    #[test]
    fn test_image_round_trip() {
        let pixels: Vec<u8> = (0..4 * 3 * 3).map(|v| v as u8).collect();
        let image = Image::new(4, 3, 3, pixels.clone()).unwrap();
        assert_eq!(image.shape(), [3, 4, 3]);
        assert_eq!(image.strides(), [12, 3, 1]);
        assert_eq!(image.as_bytes(), pixels.as_slice());

        let rebuilt = Image::from_strided(4, 3, 3, image.as_bytes(), image.strides()).unwrap();
        assert_eq!(rebuilt, image);
    }

    #[test]
    fn test_image_rejects_non_contiguous_strides() {
        let data = vec![0u8; 64];
        // row padding
        assert!(Image::from_strided(4, 3, 3, &data, [16, 3, 1]).is_err());
        // channel-planar layout
        assert!(Image::from_strided(4, 3, 3, &data, [4, 1, 12]).is_err());
        assert!(Image::from_strided(4, 3, 4, &data, [16, 4, 1]).is_err());
    }

    #[test]
    fn test_tool_call_serialization() {
        let call = ToolCallMessage::function("get_weather", r#"{"city": "Beijing"}"#);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["name"], "get_weather");
        assert_eq!(call.type_name(), "function");
        assert_eq!(ToolCallMessage::code("print(1)").type_name(), "code");
    }

    #[test]
    fn test_message_display() {
        let message = ChatMessage::assistant("")
            .with_tool_calls(vec![ToolCallMessage::code("print(1)")]);
        assert_eq!(
            message.to_string(),
            r#"ChatMessage(role=assistant, content="", tool_calls=[CodeMessage(input="print(1)")])"#
        );
    }
}
