use super::anthropic_types::{ErrorResponse, MessagesResponse, ResponseContentBlock, Usage};
use super::openai_types::{ChatCompletionResponse, ChatErrorResponse};
use super::think::extract_think_content;

/// Translate an `OpenAI` Chat Completion response into an Anthropic Messages response.
/// Pure apart from a warning log: `original_model` is what the client originally requested.
pub fn openai_to_anthropic(resp: &ChatCompletionResponse, original_model: &str) -> MessagesResponse {
    let choice = resp.choices.first();

    let mut content: Vec<ResponseContentBlock> = Vec::new();

    if let Some(c) = choice {
        let mut thinking = c.message.reasoning();
        let mut text = c.message.content.clone().unwrap_or_default();

        // Inline tags only count when the provider sent no separate reasoning.
        if thinking.is_none() && (text.contains("<think>") || text.contains("</think>")) {
            let (inline, rest) = extract_think_content(&text);
            thinking = inline;
            text = rest;
        }

        if let Some(thinking) = thinking {
            content.push(ResponseContentBlock::Thinking {
                thinking,
                signature: None,
            });
        }
        if !text.is_empty() {
            content.push(ResponseContentBlock::Text { text });
        }

        if let Some(ref tool_calls) = c.message.tool_calls {
            for tc in tool_calls {
                content.push(ResponseContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    input: parse_tool_arguments(&tc.function.name, &tc.function.arguments),
                });
            }
        }
    }

    // Empty text blocks are rejected when the conversation is sent back.
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: " ".to_string(),
        });
    }

    let stop_reason = map_finish_reason(choice.and_then(|c| c.finish_reason.as_deref()));

    let usage = resp.usage.as_ref().map_or_else(Usage::default, |u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: None,
    });

    MessagesResponse {
        id: message_id(&resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: original_model.to_string(),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage,
    }
}

/// Anthropic-style id derived from the remote completion id, or a fresh one.
pub fn message_id(remote_id: &str) -> String {
    let trimmed = remote_id.trim_start_matches("chatcmpl-");
    if trimmed.is_empty() {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    } else {
        format!("msg_{trimmed}")
    }
}

/// Parse tool-call arguments; anything that is not valid JSON is passed on as a string.
pub fn parse_tool_arguments(tool: &str, arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::json!({});
    }
    match serde_json::from_str(arguments) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(tool = %tool, error = %e, "Tool arguments are not valid JSON, passing raw string");
            serde_json::Value::String(arguments.to_string())
        }
    }
}

/// Map `OpenAI` `finish_reason` to Anthropic `stop_reason`
pub fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "max_tokens",
        Some("tool_calls" | "function_call") => "tool_use",
        _ => "end_turn",
    }
}

/// Translate an `OpenAI` error into an Anthropic error response
pub fn openai_error_to_anthropic(err: &ChatErrorResponse) -> ErrorResponse {
    let error_type = match err.error.error_type.as_str() {
        "rate_limit_exceeded" | "rate_limit_error" => "rate_limit_error",
        "invalid_request_error" => "invalid_request_error",
        "authentication_error" => "authentication_error",
        _ => "api_error",
    };

    let message = if err.error.message.is_empty() {
        "Upstream returned an error without a message".to_string()
    } else {
        err.error.message.clone()
    };

    ErrorResponse::new(error_type, message)
}

/// Map a failed remote response body to the Anthropic error shape. Bodies that are not
/// an `OpenAI` error object are wrapped as `api_error`.
pub fn upstream_error_body(status: u16, body: &str) -> ErrorResponse {
    match serde_json::from_str::<ChatErrorResponse>(body) {
        Ok(err) if status == 429 && err.error.error_type.is_empty() => {
            ErrorResponse::rate_limited(err.error.message)
        }
        Ok(err) => openai_error_to_anthropic(&err),
        Err(_) if status == 429 => ErrorResponse::rate_limited(format!("Upstream rate limited: {body}")),
        Err(_) => ErrorResponse::api_error(format!("Upstream returned {status}: {body}")),
    }
}
