//! Recognizers for tool invocations in generated assistant text.
//!
//! Both formats put the tool name on the first line of the response and the
//! payload below it. Anything that does not match is left to the caller as
//! plain content.

use super::split_metadata;
use crate::types::ToolCallMessage;

/// Tool name the GLM3 format uses for code execution.
pub const GLM3_CODE_TOOL: &str = "interpreter";
/// Tool name the GLM4 format uses for code execution.
pub const GLM4_CODE_TOOL: &str = "python";

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    /// Text surrounding the call, usually empty
    pub content: String,
    pub call: ToolCallMessage,
}

/// Parses `name\n```python\n{payload}\n```` responses.
pub fn parse_glm3(text: &str) -> Option<ParsedToolCall> {
    let (meta, body) = split_metadata(text);
    let meta = meta.trim();
    if meta.is_empty() {
        return None;
    }
    let block = extract_code_block(body)?;
    let call = if meta == GLM3_CODE_TOOL {
        ToolCallMessage::code(block.code)
    } else {
        ToolCallMessage::function(meta, block.code)
    };
    Some(ParsedToolCall {
        content: block.outside.trim().to_string(),
        call,
    })
}

/// Parses `name\n{json}` responses, or `python\n{code}` for code execution.
pub fn parse_glm4(text: &str) -> Option<ParsedToolCall> {
    let (meta, body) = split_metadata(text);
    let meta = meta.trim();
    if !is_identifier(meta) {
        return None;
    }
    let body = body.trim();
    let call = if meta == GLM4_CODE_TOOL {
        let code = match extract_code_block(body) {
            Some(block) => block.code,
            None => body.to_string(),
        };
        ToolCallMessage::code(code)
    } else {
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) if value.is_object() => ToolCallMessage::function(meta, body),
            _ => return None,
        }
    };
    Some(ParsedToolCall {
        content: String::new(),
        call,
    })
}

struct CodeBlock {
    code: String,
    outside: String,
}

/// Finds the first fenced block. The language tag after the opening fence is
/// discarded. An unterminated block runs to the end of the text.
fn extract_code_block(text: &str) -> Option<CodeBlock> {
    const FENCE: &str = "```";
    let start = text.find(FENCE)?;
    let after_fence = &text[start + FENCE.len()..];
    let code_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
    let inner = &after_fence[code_start..];
    let (code, trailing) = match inner.find(FENCE) {
        Some(end) => (&inner[..end], &inner[end + FENCE.len()..]),
        None => (inner, ""),
    };
    Some(CodeBlock {
        code: code.strip_suffix('\n').unwrap_or(code).to_string(),
        outside: format!("{}{}", &text[..start], trailing),
    })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_glm3_function_call() {
        let parsed = parse_glm3("get_weather\n ```python\ntool_call(city_name='beijing')\n```").unwrap();
        assert_eq!(parsed.content, "");
        assert_eq!(
            parsed.call,
            ToolCallMessage::function("get_weather", "tool_call(city_name='beijing')")
        );
    }

    #[test]
    fn test_glm3_code_call() {
        let parsed = parse_glm3("interpreter\n```python\nprint(1 + 1)\n```").unwrap();
        assert_eq!(parsed.call, ToolCallMessage::code("print(1 + 1)"));
    }

    #[test]
    fn test_glm3_rejects_plain_text() {
        assert_eq!(parse_glm3("just an answer"), None);
        assert_eq!(parse_glm3("\nleading newline"), None);
        assert_eq!(parse_glm3("name\nno fenced block here"), None);
    }

    #[test]
    fn test_glm4_function_call() {
        let parsed = parse_glm4("get_weather\n{\"city\": \"Beijing\"}").unwrap();
        assert_eq!(
            parsed.call,
            ToolCallMessage::function("get_weather", "{\"city\": \"Beijing\"}")
        );
    }

    #[test]
    fn test_glm4_code_call() {
        let parsed = parse_glm4("python\n```python\nimport math\nprint(math.pi)\n```").unwrap();
        assert_eq!(parsed.call, ToolCallMessage::code("import math\nprint(math.pi)"));

        let parsed = parse_glm4("python\nprint(2)").unwrap();
        assert_eq!(parsed.call, ToolCallMessage::code("print(2)"));
    }

    #[test]
    fn test_glm4_rejects_non_json_or_bad_name() {
        assert_eq!(parse_glm4("get_weather\nnot json"), None);
        assert_eq!(parse_glm4("get_weather\n[1, 2]"), None);
        assert_eq!(parse_glm4("two words\n{}"), None);
        assert_eq!(parse_glm4("Hello there!"), None);
    }

    #[test]
    fn test_extract_unterminated_block() {
        let block = extract_code_block("before ```python\nx = 1").unwrap();
        assert_eq!(block.code, "x = 1");
        assert_eq!(block.outside, "before ");
    }
}
