//! Reasoning block detection.
//!
//! ## Supported Formats
//! - `<think>...</think>` (DeepSeek R1, Qwen QwQ, MiniMax)
//! - `<thinking>...</thinking>`
//!
//! An opening tag without its closing tag is a valid state: the model is
//! still reasoning and has not started answering.

/// Supported reasoning tag formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningFormat {
    /// `<think>...</think>`
    Think,
    /// `<thinking>...</thinking>`
    Thinking,
}

impl ReasoningFormat {
    pub const ALL: [ReasoningFormat; 2] = [ReasoningFormat::Think, ReasoningFormat::Thinking];

    pub fn open_tag(&self) -> &'static str {
        match self {
            ReasoningFormat::Think => "<think>",
            ReasoningFormat::Thinking => "<thinking>",
        }
    }

    pub fn close_tag(&self) -> &'static str {
        match self {
            ReasoningFormat::Think => "</think>",
            ReasoningFormat::Thinking => "</thinking>",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkBlock {
    pub format: ReasoningFormat,
    /// Reasoning text; for an open block, everything after the opening tag.
    pub content: String,
}

/// Earliest opening tag at or after `from`.
pub(crate) fn find_open(text: &str, from: usize) -> Option<(usize, ReasoningFormat)> {
    let haystack = &text[from..];
    ReasoningFormat::ALL
        .iter()
        .filter_map(|format| haystack.find(format.open_tag()).map(|idx| (from + idx, *format)))
        .min_by_key(|(idx, _)| *idx)
}

/// Parse a think block whose opening tag starts at `start`.
///
/// Returns the block and the byte offset just past the closing tag, or
/// `None` for the offset when the block is still open.
pub(crate) fn parse_block(
    text: &str,
    start: usize,
    format: ReasoningFormat,
) -> (ThinkBlock, Option<usize>) {
    let body_start = start + format.open_tag().len();
    match text[body_start..].find(format.close_tag()) {
        Some(idx) => {
            let close = body_start + idx;
            (
                ThinkBlock {
                    format,
                    content: text[body_start..close].to_string(),
                },
                Some(close + format.close_tag().len()),
            )
        }
        None => (
            ThinkBlock {
                format,
                content: text[body_start..].to_string(),
            },
            None,
        ),
    }
}

/// Remove every reasoning block (closed or still open) from `text`.
pub fn strip_think(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some((start, format)) = find_open(text, pos) {
        out.push_str(&text[pos..start]);
        match parse_block(text, start, format).1 {
            Some(end) => pos = end,
            None => return out,
        }
    }
    out.push_str(&text[pos..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_think_block() {
        let text = "<think>This is reasoning</think>And this is text";
        let (start, format) = find_open(text, 0).unwrap();
        let (block, end) = parse_block(text, start, format);
        assert_eq!(block.content, "This is reasoning");
        assert_eq!(&text[end.unwrap()..], "And this is text");
    }

    #[test]
    fn test_unterminated_block_is_open() {
        let text = "Hello <think>still going";
        let (start, format) = find_open(text, 0).unwrap();
        let (block, end) = parse_block(text, start, format);
        assert_eq!(start, 6);
        assert_eq!(block.content, "still going");
        assert!(end.is_none());
    }

    #[test]
    fn test_thinking_format_and_strip() {
        assert_eq!(
            strip_think("<thinking>Deep thought</thinking>Answer"),
            "Answer"
        );
        assert_eq!(
            strip_think("<think>First</think>Text<think>Second</think>More text"),
            "TextMore text"
        );
        assert_eq!(strip_think("Before <think>open"), "Before ");
    }
}
