//! API translation between Anthropic and `OpenAI` formats.
//!
//! The core of the gateway: converts requests, responses, and streaming events
//! between the two API formats. All translation functions are pure (no I/O).

pub mod anthropic_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
pub mod think;
pub mod tokens;
pub mod tool_parser;
