//! Prompt token counting with the `cl100k_base` BPE.
//!
//! Message and tool overheads are added on top of the encoded text so the figure lines
//! up with what clients expect from `count_tokens`. The streaming output estimate does
//! not encode anything and uses [`CHARS_PER_TOKEN`] instead.

use super::anthropic_types::{ContentBlock, Message, MessageContent, SystemContent, Tool, ToolResultContent};
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

/// Rough ratio for output produced while streaming.
pub const CHARS_PER_TOKEN: usize = 4;
const PER_MESSAGE: u64 = 3;
const PER_TOOL_DEFINITION: u64 = 5;
const PER_TOOL_USE: u64 = 10;
const PER_TOOL_RESULT: u64 = 5;

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder() -> Option<&'static CoreBPE> {
    ENCODER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!("cl100k_base unavailable, falling back to character estimate: {e}");
                None
            }
        })
        .as_ref()
}

/// Token count of a run of text.
pub fn count_text(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match encoder() {
        Some(bpe) => bpe.encode_ordinary(text).len() as u64,
        None => text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64,
    }
}

/// Count the prompt size of a request.
pub fn estimate_input_tokens(
    messages: &[Message],
    system: Option<&SystemContent>,
    tools: Option<&[Tool]>,
) -> u64 {
    let mut total = system.map_or(0, |s| count_text(&s.as_text()));

    for msg in messages {
        total += match &msg.content {
            MessageContent::Text(t) => count_text(t),
            MessageContent::Blocks(blocks) => blocks.iter().map(count_block).sum(),
        };
    }
    total += messages.len() as u64 * PER_MESSAGE;

    if let Some(tools) = tools {
        for tool in tools {
            let definition = format!(
                "{}{}{}",
                tool.name,
                tool.description.as_deref().unwrap_or_default(),
                tool.input_schema
            );
            total += count_text(&definition) + PER_TOOL_DEFINITION;
        }
    }

    total.max(1)
}

fn count_block(block: &ContentBlock) -> u64 {
    match block {
        ContentBlock::Text { text } => count_text(text),
        ContentBlock::Thinking { thinking, .. } => count_text(thinking),
        ContentBlock::ToolUse { name, input, .. } => {
            count_text(name) + count_text(&input.to_string()) + PER_TOOL_USE
        }
        ContentBlock::ToolResult { content, .. } => {
            let body = match content {
                Some(ToolResultContent::Text(t)) => count_text(t),
                Some(blocks @ ToolResultContent::Blocks(_)) => serde_json::to_string(blocks)
                    .map(|json| count_text(&json))
                    .unwrap_or_default(),
                None => 0,
            };
            body + PER_TOOL_RESULT
        }
        ContentBlock::Image { .. } | ContentBlock::Unsupported => 0,
    }
}
