//! Local answers for requests that do not need the model.
//!
//! The assistant fires a number of housekeeping requests (quota checks, title
//! generation, prompt suggestions, command-prefix and file-path extraction) that each
//! cost a remote call and a rate-limit slot. [`Classifier`] recognizes them from marker
//! strings and produces a [`CannedResponse`] instead. Rules run in a fixed order and the
//! first match wins; rules switched off in config are not in the list at all.

pub mod commands;

use crate::config::{ClassifierConfig, GatewayConfig};
use crate::translate::anthropic_types::{
    Delta, DeltaUsage, MessageDeltaBody, MessagesRequest, MessagesResponse, ResponseContentBlock,
    Role, StreamEvent, Usage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    CommandPrefix,
    QuotaCheck,
    TitleGeneration,
    SuggestionMode,
    FilepathExtraction,
}

impl Rule {
    pub fn name(&self) -> &'static str {
        match self {
            Rule::CommandPrefix => "command_prefix",
            Rule::QuotaCheck => "quota_check",
            Rule::TitleGeneration => "title_generation",
            Rule::SuggestionMode => "suggestion_mode",
            Rule::FilepathExtraction => "filepath_extraction",
        }
    }
}

/// A locally generated answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CannedResponse {
    pub rule: Rule,
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl CannedResponse {
    fn new(rule: Rule, text: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            rule,
            text: text.into(),
            input_tokens,
            output_tokens,
        }
    }

    /// Non-streaming Messages response echoing the requested model.
    pub fn to_response(&self, model: &str) -> MessagesResponse {
        MessagesResponse {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: vec![ResponseContentBlock::Text {
                text: self.text.clone(),
            }],
            model: model.to_string(),
            stop_reason: Some("end_turn".to_string()),
            stop_sequence: None,
            usage: Usage {
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
        }
    }

    /// The same answer as a complete SSE event sequence.
    pub fn to_stream_events(&self, model: &str) -> Vec<StreamEvent> {
        let mut start = self.to_response(model);
        start.content.clear();
        start.stop_reason = None;
        start.usage.output_tokens = 1;

        let mut events = vec![
            StreamEvent::MessageStart { message: start },
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContentBlock::Text {
                    text: String::new(),
                },
            },
        ];
        if !self.text.is_empty() {
            events.push(StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::TextDelta {
                    text: self.text.clone(),
                },
            });
        }
        events.extend([
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some("end_turn".to_string()),
                    stop_sequence: None,
                },
                usage: DeltaUsage {
                    input_tokens: None,
                    output_tokens: self.output_tokens,
                },
            },
            StreamEvent::MessageStop,
        ]);
        events
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<Rule>,
    markers: ClassifierConfig,
}

impl Classifier {
    pub fn new(rules: Vec<Rule>, markers: ClassifierConfig) -> Self {
        Self { rules, markers }
    }

    /// Build the enabled rule list in priority order.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let skip = &config.skip;
        let rules = [
            (skip.fast_prefix_detection, Rule::CommandPrefix),
            (skip.quota_check, Rule::QuotaCheck),
            (skip.title_generation, Rule::TitleGeneration),
            (skip.suggestion_mode, Rule::SuggestionMode),
            (skip.filepath_extraction, Rule::FilepathExtraction),
        ]
        .into_iter()
        .filter_map(|(enabled, rule)| enabled.then_some(rule))
        .collect();

        Self::new(rules, config.classifier.clone())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// First matching rule's answer, or `None` when the request needs the model.
    pub fn classify(&self, req: &MessagesRequest) -> Option<CannedResponse> {
        self.rules.iter().find_map(|rule| self.apply(*rule, req))
    }

    fn apply(&self, rule: Rule, req: &MessagesRequest) -> Option<CannedResponse> {
        match rule {
            Rule::CommandPrefix => self.command_prefix(req),
            Rule::QuotaCheck => self.quota_check(req),
            Rule::TitleGeneration => self.title_generation(req),
            Rule::SuggestionMode => self.suggestion_mode(req),
            Rule::FilepathExtraction => self.filepath_extraction(req),
        }
    }

    fn command_prefix(&self, req: &MessagesRequest) -> Option<CannedResponse> {
        let text = single_user_text(req)?;

        let preview: String = text.chars().take(self.markers.prefix_scan_chars).collect();
        if !preview.contains(&self.markers.policy_marker) || !text.contains("Command:") {
            return None;
        }

        let command = commands::command_after_marker(&text)?;
        let prefix = commands::extract_prefix(command)?;
        Some(CannedResponse::new(Rule::CommandPrefix, prefix, 100, 5))
    }

    fn quota_check(&self, req: &MessagesRequest) -> Option<CannedResponse> {
        if req.max_tokens != Some(1) {
            return None;
        }
        let text = single_user_text(req)?;
        contains_ignore_case(&text, &self.markers.quota_marker)
            .then(|| CannedResponse::new(Rule::QuotaCheck, "Quota check passed.", 10, 5))
    }

    fn title_generation(&self, req: &MessagesRequest) -> Option<CannedResponse> {
        let last = req.messages.last().filter(|m| m.role == Role::User)?;
        let matched = last.content.text_pieces().into_iter().any(|piece| {
            self.markers
                .title_markers
                .iter()
                .any(|marker| contains_ignore_case(piece, marker))
        });
        matched.then(|| CannedResponse::new(Rule::TitleGeneration, "Conversation", 100, 5))
    }

    fn suggestion_mode(&self, req: &MessagesRequest) -> Option<CannedResponse> {
        let marker = self.markers.suggestion_marker.as_str();
        let matched = req
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .flat_map(|m| m.content.text_pieces())
            .any(|piece| piece.contains(marker));
        matched.then(|| CannedResponse::new(Rule::SuggestionMode, "", 100, 1))
    }

    fn filepath_extraction(&self, req: &MessagesRequest) -> Option<CannedResponse> {
        if req.tools.as_ref().is_some_and(|t| !t.is_empty()) {
            return None;
        }
        let text = single_user_text(req)?;
        if !text.contains("Command:")
            || !text.contains("Output:")
            || !contains_ignore_case(&text, "filepaths")
        {
            return None;
        }

        let command = commands::command_before_output(&text)?;
        let answer = commands::extract_filepaths(command)?;
        Some(CannedResponse::new(Rule::FilepathExtraction, answer, 100, 10))
    }
}

/// Text of the only message, when the request is exactly one user message.
fn single_user_text(req: &MessagesRequest) -> Option<String> {
    match req.messages.as_slice() {
        [only] if only.role == Role::User => Some(only.content.plain_text()),
        _ => None,
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
