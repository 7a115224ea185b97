//! Splits `<think>…</think>` spans out of model text.
//!
//! Kimi and other reasoning models sometimes inline their chain of thought in the
//! regular `content` field. [`ThinkParser`] separates it incrementally; a tag may be
//! cut across two chunks, so a possible partial tag at the end of the input is held
//! back until the next [`ThinkParser::feed`] or [`ThinkParser::flush`].

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Thinking(String),
}

#[derive(Debug, Default)]
pub struct ThinkParser {
    buffer: String,
    in_think: bool,
}

impl ThinkParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, content: &str) -> Vec<Segment> {
        self.buffer.push_str(content);
        let mut out = Vec::new();

        loop {
            if self.in_think {
                if let Some(pos) = self.buffer.find(CLOSE_TAG) {
                    let thinking: String = self.buffer.drain(..pos).collect();
                    self.buffer.drain(..CLOSE_TAG.len());
                    push(&mut out, Segment::Thinking(thinking));
                    self.in_think = false;
                    continue;
                }
            } else {
                let open = self.buffer.find(OPEN_TAG);
                let close = self.buffer.find(CLOSE_TAG);
                match (open, close) {
                    // A close tag with no opener: keep the text, drop the tag.
                    (o, Some(c)) if o.map_or(true, |o| c < o) => {
                        let text: String = self.buffer.drain(..c).collect();
                        self.buffer.drain(..CLOSE_TAG.len());
                        push(&mut out, Segment::Text(text));
                        continue;
                    }
                    (Some(o), _) => {
                        let text: String = self.buffer.drain(..o).collect();
                        self.buffer.drain(..OPEN_TAG.len());
                        push(&mut out, Segment::Text(text));
                        self.in_think = true;
                        continue;
                    }
                    _ => {}
                }
            }

            let tag = if self.in_think { CLOSE_TAG } else { OPEN_TAG };
            let keep = partial_tag_len(&self.buffer, tag);
            let emit: String = self.buffer.drain(..self.buffer.len() - keep).collect();
            push(&mut out, self.segment(emit));
            return out;
        }
    }

    /// Release whatever is still buffered.
    pub fn flush(&mut self) -> Option<Segment> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(self.segment(rest))
    }

    fn segment(&self, content: String) -> Segment {
        if self.in_think {
            Segment::Thinking(content)
        } else {
            Segment::Text(content)
        }
    }
}

/// Split a complete response body into `(thinking, remaining text)`.
pub fn extract_think_content(text: &str) -> (Option<String>, String) {
    let mut parser = ThinkParser::new();
    let mut segments = parser.feed(text);
    segments.extend(parser.flush());

    let mut thinking = Vec::new();
    let mut rest = String::new();
    for segment in segments {
        match segment {
            Segment::Thinking(t) => thinking.push(t),
            Segment::Text(t) => rest.push_str(&t),
        }
    }

    if thinking.is_empty() {
        (None, text.to_string())
    } else {
        (Some(thinking.join("\n")), rest.trim().to_string())
    }
}

fn push(out: &mut Vec<Segment>, segment: Segment) {
    let empty = match &segment {
        Segment::Text(s) | Segment::Thinking(s) => s.is_empty(),
    };
    if !empty {
        out.push(segment);
    }
}

/// Length of the longest proper prefix of `tag` that `buffer` ends with.
fn partial_tag_len(buffer: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&k| buffer.ends_with(&tag[..k]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Segment {
        Segment::Text(s.to_string())
    }

    fn thinking(s: &str) -> Segment {
        Segment::Thinking(s.to_string())
    }

    #[test]
    fn test_plain_text_passes_through() {
        let mut parser = ThinkParser::new();
        assert_eq!(parser.feed("hello world"), vec![text("hello world")]);
        assert_eq!(parser.flush(), None);
    }

    #[test]
    fn test_think_span_in_one_chunk() {
        let mut parser = ThinkParser::new();
        assert_eq!(
            parser.feed("<think>plan</think>answer"),
            vec![thinking("plan"), text("answer")]
        );
    }

    #[test]
    fn test_tags_split_across_chunks() {
        let mut parser = ThinkParser::new();
        let mut all = Vec::new();
        for piece in ["<thi", "nk>step one", " and two</th", "ink>done", " <"] {
            all.extend(parser.feed(piece));
        }
        all.extend(parser.flush());

        assert_eq!(
            all,
            vec![
                thinking("step one"),
                thinking(" and two"),
                text("done"),
                text(" "),
                text("<"),
            ]
        );
    }

    #[test]
    fn test_orphan_close_tag_is_dropped() {
        let mut parser = ThinkParser::new();
        assert_eq!(
            parser.feed("reasoning</think>final"),
            vec![text("reasoning"), text("final")]
        );
    }

    #[test]
    fn test_unterminated_think_flushes_as_thinking() {
        let mut parser = ThinkParser::new();
        assert_eq!(parser.feed("<think>still going"), vec![thinking("still going")]);
        assert_eq!(parser.feed("</thin"), Vec::<Segment>::new());
        assert_eq!(parser.flush(), Some(thinking("</thin")));
    }

    #[test]
    fn test_extract_think_content() {
        let (think, rest) = extract_think_content("<think>a</think>\n\nThe answer is 4.");
        assert_eq!(think.as_deref(), Some("a"));
        assert_eq!(rest, "The answer is 4.");

        let (think, rest) = extract_think_content("no tags here");
        assert!(think.is_none());
        assert_eq!(rest, "no tags here");
    }
}
