//! Recovers tool calls that a model wrote into its text instead of `tool_calls`.
//!
//! Kimi occasionally answers with
//! `● <function=Read><parameter=file_path>src/main.rs</parameter>` in plain `content`.
//! [`ToolParser`] lifts those spans out of the text as they stream past. A call may be
//! cut anywhere across chunks, so anything that could still become a call is buffered
//! until it either completes or clearly is not one.

use serde_json::{Map, Value};

const MARKER: char = '●';
const FUNCTION_OPEN: &str = "<function=";
const FUNCTION_CLOSE: &str = "</function>";
const PARAM_OPEN: &str = "<parameter=";
const PARAM_CLOSE: &str = "</parameter>";

/// Bytes to wait for a `<function=...>` header after the marker before giving up on it.
const MAX_HEADER_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct TextToolCall {
    pub id: String,
    pub name: String,
    pub input: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Text(String),
    ToolCall(TextToolCall),
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Text,
    /// Saw the marker, waiting for the function header.
    Header,
    /// Inside a call, collecting parameters.
    Params(TextToolCall),
}

#[derive(Debug, Default)]
pub struct ToolParser {
    buffer: String,
    state: State,
}

impl ToolParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, text: &str) -> Vec<Parsed> {
        self.buffer.push_str(text);
        let mut out = Vec::new();

        loop {
            match std::mem::take(&mut self.state) {
                State::Text => match self.buffer.find(MARKER) {
                    Some(pos) => {
                        let before: String = self.buffer.drain(..pos).collect();
                        push_text(&mut out, before);
                        self.state = State::Header;
                    }
                    None => {
                        let rest = std::mem::take(&mut self.buffer);
                        push_text(&mut out, rest);
                        return out;
                    }
                },
                State::Header => match self.match_header() {
                    Header::Call(call) => self.state = State::Params(call),
                    Header::NotACall => {
                        // Keep the marker as text and look for the next one.
                        self.buffer.drain(..MARKER.len_utf8());
                        push_text(&mut out, MARKER.to_string());
                    }
                    Header::Incomplete => {
                        self.state = State::Header;
                        return out;
                    }
                },
                State::Params(mut call) => {
                    self.take_parameters(&mut call, &mut out);

                    if let Some(pos) = self.buffer.find(MARKER) {
                        let before: String = self.buffer.drain(..pos).collect();
                        out.push(Parsed::ToolCall(call));
                        push_text(&mut out, before.replacen(FUNCTION_CLOSE, "", 1));
                        continue;
                    }

                    let trimmed = self.buffer.trim_start();
                    if trimmed.starts_with(FUNCTION_CLOSE) {
                        let end = self.buffer.len() - trimmed.len() + FUNCTION_CLOSE.len();
                        self.buffer.drain(..end);
                        out.push(Parsed::ToolCall(call));
                    } else if !trimmed.is_empty()
                        && !trimmed.starts_with('<')
                        && !self.buffer.contains(PARAM_OPEN)
                    {
                        // Prose after the parameters ends the call.
                        let rest = std::mem::take(&mut self.buffer);
                        out.push(Parsed::ToolCall(call));
                        push_text(&mut out, rest);
                    } else {
                        self.state = State::Params(call);
                        return out;
                    }
                }
            }
        }
    }

    /// End of stream: complete a call that is still collecting parameters and release
    /// anything else that was held back.
    pub fn flush(&mut self) -> Vec<Parsed> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.buffer);

        match std::mem::take(&mut self.state) {
            State::Text | State::Header => push_text(&mut out, rest),
            State::Params(mut call) => {
                if let Some(start) = rest.find(PARAM_OPEN) {
                    let after = &rest[start + PARAM_OPEN.len()..];
                    if let Some(name_end) = after.find('>') {
                        let key = after[..name_end].trim();
                        let value = after[name_end + 1..].trim();
                        if !key.is_empty() {
                            call.input
                                .insert(key.to_string(), Value::String(value.to_string()));
                        }
                    }
                }
                out.push(Parsed::ToolCall(call));
            }
        }
        out
    }

    fn match_header(&mut self) -> Header {
        let after_marker = &self.buffer[MARKER.len_utf8()..];
        let candidate = after_marker.trim_start();

        if candidate.len() < FUNCTION_OPEN.len() {
            if !FUNCTION_OPEN.starts_with(candidate) {
                return Header::NotACall;
            }
            return self.incomplete_header();
        }
        let Some(name_part) = candidate.strip_prefix(FUNCTION_OPEN) else {
            return Header::NotACall;
        };
        let Some(name_end) = name_part.find('>') else {
            return self.incomplete_header();
        };
        let name = name_part[..name_end].trim();
        if name.is_empty() {
            return Header::NotACall;
        }

        let call = TextToolCall {
            id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            input: Map::new(),
        };
        let consumed = self.buffer.len() - name_part.len() + name_end + 1;
        self.buffer.drain(..consumed);
        Header::Call(call)
    }

    fn incomplete_header(&self) -> Header {
        if self.buffer.len() > MAX_HEADER_LEN {
            Header::NotACall
        } else {
            Header::Incomplete
        }
    }

    fn take_parameters(&mut self, call: &mut TextToolCall, out: &mut Vec<Parsed>) {
        while let Some(start) = self.buffer.find(PARAM_OPEN) {
            let body = start + PARAM_OPEN.len();
            let Some(name_len) = self.buffer[body..].find('>') else {
                return;
            };
            let value_start = body + name_len + 1;
            let Some(value_len) = self.buffer[value_start..].find(PARAM_CLOSE) else {
                return;
            };

            let key = self.buffer[body..body + name_len].trim().to_string();
            let value = self.buffer[value_start..value_start + value_len].trim().to_string();
            let before: String = self.buffer.drain(..start).collect();
            push_text(out, before.trim().to_string());
            self.buffer
                .drain(..value_start - start + value_len + PARAM_CLOSE.len());
            call.input.insert(key, Value::String(value));
        }
    }
}

enum Header {
    Call(TextToolCall),
    NotACall,
    Incomplete,
}

fn push_text(out: &mut Vec<Parsed>, text: String) {
    if text.is_empty() {
        return;
    }
    if let Some(Parsed::Text(last)) = out.last_mut() {
        last.push_str(&text);
    } else {
        out.push(Parsed::Text(text));
    }
}
