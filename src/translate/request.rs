//! Translate Anthropic Messages API requests into `OpenAI` Chat Completions requests.
//!
//! Handles system messages, multi-part content (text, images), thinking, tool use, tool
//! results and tool choice mapping. A single Anthropic message can expand into multiple
//! `OpenAI` messages (a user message with `tool_result` blocks becomes separate
//! `tool`-role messages, emitted ahead of the user's own text).

use super::anthropic_types::{
    ContentBlock, ImageSource, Message, MessagesRequest, Role, ToolChoice, ToolChoiceAuto,
    ToolChoiceSpecific, ToolResultContent,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatMessage, ChatTool, ChatToolCall,
    ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction, ChatToolChoiceSpecific,
    ContentPart, ImageUrlDetail, StreamOptions,
};
use crate::config::GatewayConfig;
use crate::error::{ProxyError, Result};

/// Translate an Anthropic Messages API request into an `OpenAI` Chat Completions request.
///
/// Pure: the config supplies the model mapping, sampling defaults for omitted fields, and
/// extra body fields. Fails only when the request carries content the target dialect
/// cannot represent.
pub fn anthropic_to_openai(
    req: &MessagesRequest,
    config: &GatewayConfig,
) -> Result<ChatCompletionRequest> {
    let mut messages = Vec::new();

    if let Some(ref system) = req.system {
        let text = system.as_text();
        if !text.is_empty() {
            messages.push(chat_message("system", Some(ChatContent::Text(text))));
        }
    }

    for (position, msg) in req.messages.iter().enumerate() {
        let mut translated = translate_message(msg).map_err(|e| match e {
            ProxyError::Translation { message } => {
                ProxyError::translation(format!("messages[{position}]: {message}"))
            }
            other => other,
        })?;
        messages.append(&mut translated);
    }

    let tools = req.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        tools
            .iter()
            .map(|t| ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    });

    let tool_choice = tools
        .as_ref()
        .and(req.tool_choice.as_ref())
        .map(translate_tool_choice);

    let stream_options = req.stream.filter(|s| *s).map(|_| StreamOptions {
        include_usage: true,
    });

    let user = req.metadata.as_ref().and_then(|m| m.user_id.clone());

    Ok(ChatCompletionRequest {
        model: config.target_model(&req.model),
        messages,
        max_tokens: Some(req.max_tokens.unwrap_or(config.params.max_tokens)),
        temperature: Some(req.temperature.unwrap_or(config.params.temperature)),
        top_p: req.top_p,
        stream: req.stream,
        stream_options,
        tools,
        tool_choice,
        stop: req.stop_sequences.clone().filter(|s| !s.is_empty()),
        user,
        extra: config.upstream.extra_body.clone(),
    })
}

fn translate_message(msg: &Message) -> Result<Vec<ChatMessage>> {
    let blocks = msg.content.blocks();

    match msg.role {
        Role::User => translate_user_message(&blocks),
        Role::Assistant => translate_assistant_message(&blocks),
    }
}

fn translate_user_message(blocks: &[ContentBlock]) -> Result<Vec<ChatMessage>> {
    let mut messages = Vec::new();
    let mut content_parts: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                content_parts.push(ContentPart::Text { text: text.clone() });
            }
            ContentBlock::Image { source } => {
                content_parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: image_url(source)?,
                        detail: None,
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Tool answers must directly follow the assistant's tool_calls message.
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(ChatContent::Text(tool_result_to_string(
                        content.as_ref(),
                        *is_error,
                    ))),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                    name: None,
                });
            }
            ContentBlock::Thinking { .. } | ContentBlock::ToolUse { .. } => {}
            ContentBlock::Unsupported => {
                return Err(ProxyError::translation(
                    "unsupported content block type in user message",
                ));
            }
        }
    }

    if !content_parts.is_empty() {
        messages.push(chat_message("user", Some(collapse_content_parts(content_parts))));
    }

    if messages.is_empty() {
        messages.push(chat_message("user", Some(ChatContent::Text(String::new()))));
    }

    Ok(messages)
}

fn translate_assistant_message(blocks: &[ContentBlock]) -> Result<Vec<ChatMessage>> {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut reasoning_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::Thinking { thinking, .. } => reasoning_parts.push(thinking),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: serde_json::to_string(input)?,
                    },
                });
            }
            ContentBlock::ToolResult { .. } => {}
            ContentBlock::Image { .. } => {
                return Err(ProxyError::translation(
                    "image blocks are only supported in user messages",
                ));
            }
            ContentBlock::Unsupported => {
                return Err(ProxyError::translation(
                    "unsupported content block type in assistant message",
                ));
            }
        }
    }

    // Prior reasoning goes back inline, the way the model emitted it.
    let mut sections = Vec::new();
    if !reasoning_parts.is_empty() {
        sections.push(format!("<think>\n{}\n</think>", reasoning_parts.join("\n")));
    }
    if !text_parts.is_empty() {
        sections.push(text_parts.join("\n"));
    }
    let mut content = sections.join("\n\n");
    if content.is_empty() && tool_calls.is_empty() {
        content = " ".to_string();
    }

    Ok(vec![ChatMessage {
        role: "assistant".to_string(),
        content: (!content.is_empty()).then(|| ChatContent::Text(content)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
        name: None,
    }])
}

fn chat_message(role: &str, content: Option<ChatContent>) -> ChatMessage {
    ChatMessage {
        role: role.to_string(),
        content,
        tool_calls: None,
        tool_call_id: None,
        name: None,
    }
}

fn image_url(source: &ImageSource) -> Result<String> {
    match source.source_type.as_str() {
        "base64" => Ok(format!("data:{};base64,{}", source.media_type, source.data)),
        "url" => source
            .url
            .clone()
            .ok_or_else(|| ProxyError::translation("image source of type 'url' has no url")),
        other => Err(ProxyError::translation(format!(
            "unsupported image source type '{other}'"
        ))),
    }
}

fn collapse_content_parts(mut parts: Vec<ContentPart>) -> ChatContent {
    if parts.iter().all(|p| matches!(p, ContentPart::Text { .. })) {
        let text = parts
            .drain(..)
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        return ChatContent::Text(text);
    }
    ChatContent::Parts(parts)
}

fn tool_result_to_string(content: Option<&ToolResultContent>, is_error: Option<bool>) -> String {
    let prefix = if is_error == Some(true) { "ERROR: " } else { "" };

    match content {
        Some(ToolResultContent::Text(t)) => format!("{prefix}{t}"),
        Some(ToolResultContent::Blocks(blocks)) => {
            let text = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("{prefix}{text}")
        }
        None => format!("{prefix}(no content)"),
    }
}

fn translate_tool_choice(tc: &ToolChoice) -> ChatToolChoice {
    match tc {
        ToolChoice::Auto(ToolChoiceAuto { choice_type }) => match choice_type.as_str() {
            "any" => ChatToolChoice::String("required".to_string()),
            "none" => ChatToolChoice::String("none".to_string()),
            _ => ChatToolChoice::String("auto".to_string()),
        },
        ToolChoice::Specific(ToolChoiceSpecific { name, .. }) => {
            ChatToolChoice::Specific(ChatToolChoiceSpecific {
                choice_type: "function".to_string(),
                function: ChatToolChoiceFunction { name: name.clone() },
            })
        }
    }
}
