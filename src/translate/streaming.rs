//! State machine for translating `OpenAI` streaming chunks into Anthropic SSE events.
//!
//! The [`StreamTranslator`] processes `OpenAI` `ChatCompletionChunk`s one at a time,
//! maintaining state about which content block is open, and emitting the
//! corresponding Anthropic stream events (`message_start`, `content_block_delta`, etc.).
//!
//! At most one text or thinking block is open at any time. Tool blocks stay open until
//! the message ends, because argument fragments for any tool-call index may arrive after
//! other blocks have started. Reasoning arrives either in `reasoning_content` or inline
//! as `<think>` spans inside `content`; both become `thinking` blocks. Calls the model
//! writes into its text are lifted out by [`ToolParser`] and sent as complete `tool_use`
//! blocks. The closing frame (`message_delta` + `message_stop`) is held back after
//! `finish_reason` until the usage chunk arrives, or until [`StreamTranslator::finish`].

use std::collections::BTreeMap;

use super::anthropic_types::{
    Delta, DeltaUsage, ErrorBody, MessageDeltaBody, MessagesResponse, ResponseContentBlock,
    StreamEvent, Usage,
};
use super::openai_types::{ChatCompletionChunk, ChunkToolCall};
use super::response::map_finish_reason;
use super::think::{Segment, ThinkParser};
use super::tokens::CHARS_PER_TOKEN;
use super::tool_parser::{Parsed, TextToolCall, ToolParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Thinking(usize),
    Text(usize),
}

/// A tool call seen in the stream, keyed by the remote's tool-call index.
#[derive(Debug, Clone)]
struct ToolBlock {
    block_index: usize,
    closed: bool,
}

/// State machine that translates `OpenAI` streaming chunks into Anthropic SSE events.
///
/// ```ignore
/// let mut translator = StreamTranslator::new("claude-sonnet-4-20250514", input_estimate);
/// for chunk in openai_chunks {
///     for event in translator.process_chunk(&chunk) { /* send as SSE */ }
/// }
/// let final_events = translator.finish();
/// ```
#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    msg_id: String,
    started: bool,
    finished: bool,
    next_index: usize,
    open: Option<OpenBlock>,
    tools: BTreeMap<u64, ToolBlock>,
    think: ThinkParser,
    text_tools: ToolParser,
    stop_reason: Option<&'static str>,
    blocks_emitted: usize,
    input_tokens: u64,
    reported_usage: Option<(u64, u64)>,
    output_chars: usize,
}

impl StreamTranslator {
    /// `input_tokens` is the local estimate for `message_start`; remote usage replaces it
    /// in the final `message_delta`.
    pub fn new(model: &str, input_tokens: u64) -> Self {
        Self {
            model: model.to_string(),
            msg_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            finished: false,
            next_index: 0,
            open: None,
            tools: BTreeMap::new(),
            think: ThinkParser::new(),
            text_tools: ToolParser::new(),
            stop_reason: None,
            blocks_emitted: 0,
            input_tokens,
            reported_usage: None,
            output_chars: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Output tokens so far: the remote's count when reported, else the running estimate.
    pub fn output_tokens(&self) -> u64 {
        self.reported_usage
            .map(|(_, output)| output)
            .unwrap_or_else(|| self.output_chars.div_ceil(CHARS_PER_TOKEN) as u64)
    }

    /// Process a single `OpenAI` streaming chunk, returning zero or more Anthropic SSE events.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.ensure_started(&mut events);

        if let Some(ref usage) = chunk.usage {
            self.reported_usage = Some((usage.prompt_tokens, usage.completion_tokens));
        }

        if let Some(choice) = chunk.choices.first() {
            if self.stop_reason.is_none() {
                if let Some(reasoning) = choice.delta.reasoning_content.as_deref() {
                    self.push_thinking(reasoning, &mut events);
                }

                if let Some(content) = choice.delta.content.as_deref() {
                    for segment in self.think.feed(content) {
                        self.push_segment(segment, &mut events);
                    }
                }

                if let Some(ref tool_calls) = choice.delta.tool_calls {
                    for tc in tool_calls {
                        self.push_tool_call(tc, &mut events);
                    }
                }
            }

            if let Some(ref reason) = choice.finish_reason {
                if self.stop_reason.is_none() {
                    self.flush_text(&mut events);
                    self.close_all(&mut events);
                    self.stop_reason = Some(map_finish_reason(Some(reason.as_str())));
                }
            }
        }

        if self.stop_reason.is_some() && self.reported_usage.is_some() {
            self.push_closing(&mut events);
        }

        events
    }

    /// Call when the stream ends (`[DONE]` or EOF) to flush any remaining events.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.ensure_started(&mut events);
        self.flush_text(&mut events);
        self.close_all(&mut events);
        self.push_closing(&mut events);
        events
    }

    /// Terminate after the upstream connection failed: close what is open and emit an
    /// `error` event in place of `message_stop`.
    pub fn fail(&mut self, message: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.ensure_started(&mut events);
        self.flush_text(&mut events);
        self.close_all(&mut events);
        events.push(StreamEvent::Error {
            error: ErrorBody {
                error_type: "api_error".to_string(),
                message: message.to_string(),
            },
        });
        self.finished = true;
        events
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.msg_id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: 1,
                    cache_creation_input_tokens: None,
                    cache_read_input_tokens: None,
                },
            },
        });
        events.push(StreamEvent::Ping);
    }

    fn push_segment(&mut self, segment: Segment, events: &mut Vec<StreamEvent>) {
        match segment {
            Segment::Thinking(t) => self.push_thinking(&t, events),
            Segment::Text(t) => {
                for parsed in self.text_tools.feed(&t) {
                    self.push_parsed(parsed, events);
                }
            }
        }
    }

    fn push_parsed(&mut self, parsed: Parsed, events: &mut Vec<StreamEvent>) {
        match parsed {
            Parsed::Text(t) => self.push_text(&t, events),
            Parsed::ToolCall(call) => self.push_text_tool(call, events),
        }
    }

    /// A call recovered from the text arrives complete: open, fill and close its block.
    fn push_text_tool(&mut self, call: TextToolCall, events: &mut Vec<StreamEvent>) {
        self.close_open(events);
        let partial_json = serde_json::Value::Object(call.input).to_string();
        self.output_chars += call.name.chars().count() + partial_json.chars().count();

        let index = self.start_block(
            ResponseContentBlock::ToolUse {
                id: call.id,
                name: call.name,
                input: serde_json::Value::Object(serde_json::Map::new()),
            },
            events,
        );
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJsonDelta { partial_json },
        });
        events.push(StreamEvent::ContentBlockStop { index });
    }

    fn push_thinking(&mut self, thinking: &str, events: &mut Vec<StreamEvent>) {
        if thinking.is_empty() {
            return;
        }
        let index = match self.open {
            Some(OpenBlock::Thinking(index)) => index,
            _ => {
                self.close_open(events);
                let index = self.start_block(
                    ResponseContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                    events,
                );
                self.open = Some(OpenBlock::Thinking(index));
                index
            }
        };
        self.output_chars += thinking.chars().count();
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::ThinkingDelta {
                thinking: thinking.to_string(),
            },
        });
    }

    fn push_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        let index = match self.open {
            Some(OpenBlock::Text(index)) => index,
            _ => {
                self.close_open(events);
                let index = self.start_block(
                    ResponseContentBlock::Text {
                        text: String::new(),
                    },
                    events,
                );
                self.open = Some(OpenBlock::Text(index));
                index
            }
        };
        self.output_chars += text.chars().count();
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn push_tool_call(&mut self, tc: &ChunkToolCall, events: &mut Vec<StreamEvent>) {
        let name = tc.function.as_ref().and_then(|f| f.name.clone());
        let arguments = tc
            .function
            .as_ref()
            .and_then(|f| f.arguments.as_deref())
            .unwrap_or_default();

        if !self.tools.contains_key(&tc.index) {
            // Text held back by the parsers belongs before the tool block.
            self.flush_text(events);
            self.close_open(events);

            let id = tc
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
            let name = name.unwrap_or_default();
            self.output_chars += name.chars().count();

            let block_index = self.start_block(
                ResponseContentBlock::ToolUse {
                    id,
                    name,
                    input: serde_json::Value::Object(serde_json::Map::new()),
                },
                events,
            );
            self.tools.insert(
                tc.index,
                ToolBlock {
                    block_index,
                    closed: false,
                },
            );
        }

        if arguments.is_empty() {
            return;
        }
        let Some(tool) = self.tools.get(&tc.index) else {
            return;
        };

        self.output_chars += arguments.chars().count();
        events.push(StreamEvent::ContentBlockDelta {
            index: tool.block_index,
            delta: Delta::InputJsonDelta {
                partial_json: arguments.to_string(),
            },
        });
    }

    fn start_block(&mut self, block: ResponseContentBlock, events: &mut Vec<StreamEvent>) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.blocks_emitted += 1;
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: block,
        });
        index
    }

    /// Close the open text or thinking block, if any.
    fn close_open(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(OpenBlock::Thinking(index) | OpenBlock::Text(index)) = self.open.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    /// Close every block still open, tool blocks in the order they started.
    fn close_all(&mut self, events: &mut Vec<StreamEvent>) {
        self.close_open(events);
        let mut open_tools: Vec<&mut ToolBlock> =
            self.tools.values_mut().filter(|t| !t.closed).collect();
        open_tools.sort_by_key(|t| t.block_index);
        for tool in open_tools {
            tool.closed = true;
            events.push(StreamEvent::ContentBlockStop {
                index: tool.block_index,
            });
        }
    }

    /// Release text held back by the think and tool parsers.
    fn flush_text(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(segment) = self.think.flush() {
            self.push_segment(segment, events);
        }
        for parsed in self.text_tools.flush() {
            self.push_parsed(parsed, events);
        }
    }

    fn push_closing(&mut self, events: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        self.finished = true;

        if self.blocks_emitted == 0 {
            let index = self.start_block(
                ResponseContentBlock::Text {
                    text: String::new(),
                },
                events,
            );
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::TextDelta {
                    text: " ".to_string(),
                },
            });
            events.push(StreamEvent::ContentBlockStop { index });
        }

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(self.stop_reason.unwrap_or("end_turn").to_string()),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                input_tokens: self.reported_usage.map(|(input, _)| input),
                output_tokens: self.output_tokens(),
            },
        });
        events.push(StreamEvent::MessageStop);
    }
}
