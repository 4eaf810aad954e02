//! Structural marker extraction over a growing response.
//!
//! [`scan_spans`] is a pure left-to-right scanner: at each position it takes
//! the earliest of a think tag, a pointer block, a `function_call:` marker or
//! a line-initial fence, consumes that construct whole and continues after
//! it. Markers inside an earlier construct are therefore never seen. An open
//! construct ends the scan, since everything after it belongs to it.
//!
//! [`MarkerExtractor`] memoizes the settled prefix so each new snapshot only
//! scans what was appended.

pub mod code_block;
pub mod think;
pub mod tool_call;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tracing::debug;

use crate::protocol::ToolCall;

pub use code_block::{BlockStyle, CodeBlock, CommandBlock, CommandMode};
pub use think::{strip_think, ReasoningFormat, ThinkBlock};
pub use tool_call::{ParsedToolCall, PartialToolCall};

use code_block::FencedBody;

#[derive(Debug, Clone, PartialEq)]
pub enum SpanKind {
    CodeBlock(CodeBlock),
    CommandBlock(CommandBlock),
    ToolCall(ParsedToolCall),
    Think(ThinkBlock),
}

/// A recognized construct in a snapshot. `end` is `None` while the closing
/// marker has not arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralSpan {
    pub start: usize,
    pub end: Option<usize>,
    pub kind: SpanKind,
}

impl StructuralSpan {
    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }
}

/// A completed code block, ready for path resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOperation {
    pub path: Option<String>,
    pub language: Option<String>,
    pub content: String,
}

impl From<&CodeBlock> for FileOperation {
    fn from(block: &CodeBlock) -> Self {
        Self {
            path: block.filename.clone(),
            language: block.language.clone(),
            content: block.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub spans: Vec<StructuralSpan>,
    /// Offset up to which every construct is closed for good.
    pub settled_at: usize,
}

#[derive(Clone, Copy)]
enum Candidate {
    Think(ReasoningFormat),
    Pointer,
    ToolCall,
    Fence,
}

fn next_candidate(text: &str, pos: usize) -> Option<(usize, Candidate)> {
    [
        think::find_open(text, pos).map(|(idx, format)| (idx, Candidate::Think(format))),
        code_block::find_pointer_start(text, pos).map(|idx| (idx, Candidate::Pointer)),
        tool_call::find_marker(text, pos).map(|idx| (idx, Candidate::ToolCall)),
        code_block::find_fence_open(text, pos).map(|idx| (idx, Candidate::Fence)),
    ]
    .into_iter()
    .flatten()
    .min_by_key(|(idx, _)| *idx)
}

/// Scan `text` from byte offset `from`, which must be a settled boundary.
pub fn scan_spans(text: &str, from: usize) -> ScanResult {
    let mut spans = Vec::new();
    let mut pos = from;
    let mut settled_at = from;

    while let Some((start, candidate)) = next_candidate(text, pos) {
        let (kind, end, resume) = match candidate {
            Candidate::Think(format) => {
                let (block, end) = think::parse_block(text, start, format);
                (SpanKind::Think(block), end, end)
            }
            Candidate::Pointer => {
                let Some(m) = code_block::parse_pointer_block(text, start) else {
                    break;
                };
                (SpanKind::CodeBlock(m.block), m.end, m.end)
            }
            Candidate::ToolCall => match tool_call::parse_at(text, start) {
                Some(m) => (SpanKind::ToolCall(m.parsed), m.end, m.resume),
                None => {
                    pos = start + tool_call::FUNCTION_CALL_MARKER.len();
                    settled_at = pos;
                    continue;
                }
            },
            Candidate::Fence => {
                let m = code_block::parse_fence(text, start);
                let kind = match m.body {
                    FencedBody::Code(block) => SpanKind::CodeBlock(block),
                    FencedBody::Command(command) => SpanKind::CommandBlock(command),
                };
                (kind, m.end, m.end.filter(|_| m.settled))
            }
        };

        spans.push(StructuralSpan { start, end, kind });
        match resume {
            Some(next) => {
                pos = next;
                settled_at = next;
            }
            None => break,
        }
    }

    ScanResult { spans, settled_at }
}

fn prefix_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Incremental front end over [`scan_spans`].
#[derive(Debug)]
pub struct MarkerExtractor {
    settled: Vec<StructuralSpan>,
    settled_at: usize,
    settled_hash: u64,
}

impl Default for MarkerExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerExtractor {
    pub fn new() -> Self {
        Self {
            settled: Vec::new(),
            settled_at: 0,
            settled_hash: prefix_hash(""),
        }
    }

    /// All spans in `snapshot`, completed ones first in document order,
    /// followed by any still-open construct.
    pub fn extract(&mut self, snapshot: &str) -> Vec<StructuralSpan> {
        if !self.extends_settled_prefix(snapshot) {
            debug!(settled_at = self.settled_at, "snapshot does not extend memo, rescanning");
            self.reset();
        }

        let scan = scan_spans(snapshot, self.settled_at);
        let mut pending = Vec::new();
        for span in scan.spans {
            if span.end.is_some_and(|end| end <= scan.settled_at) {
                self.settled.push(span);
            } else {
                pending.push(span);
            }
        }
        if scan.settled_at != self.settled_at {
            self.settled_at = scan.settled_at;
            self.settled_hash = prefix_hash(&snapshot[..scan.settled_at]);
        }

        let mut spans = self.settled.clone();
        spans.extend(pending);
        spans
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn settled_at(&self) -> usize {
        self.settled_at
    }

    fn extends_settled_prefix(&self, snapshot: &str) -> bool {
        snapshot.len() >= self.settled_at
            && snapshot.is_char_boundary(self.settled_at)
            && prefix_hash(&snapshot[..self.settled_at]) == self.settled_hash
    }
}

pub fn file_operations(spans: &[StructuralSpan]) -> Vec<FileOperation> {
    spans
        .iter()
        .filter(|span| span.is_complete())
        .filter_map(|span| match &span.kind {
            SpanKind::CodeBlock(block) => Some(FileOperation::from(block)),
            _ => None,
        })
        .collect()
}

pub fn tool_calls(spans: &[StructuralSpan]) -> Vec<ToolCall> {
    spans
        .iter()
        .filter(|span| span.is_complete())
        .filter_map(|span| match &span.kind {
            SpanKind::ToolCall(parsed) => parsed.as_complete().cloned(),
            _ => None,
        })
        .collect()
}

/// True once any tool-call marker is present, complete or not.
pub fn has_tool_call(spans: &[StructuralSpan]) -> bool {
    spans.iter().any(|span| {
        matches!(
            span.kind,
            SpanKind::ToolCall(ParsedToolCall::Complete(_) | ParsedToolCall::Partial(_))
        )
    })
}

pub fn command_blocks(spans: &[StructuralSpan]) -> Vec<&CommandBlock> {
    spans
        .iter()
        .filter(|span| span.is_complete())
        .filter_map(|span| match &span.kind {
            SpanKind::CommandBlock(command) => Some(command),
            _ => None,
        })
        .collect()
}

/// The model is inside an unterminated think block.
pub fn is_reasoning(spans: &[StructuralSpan]) -> bool {
    spans
        .last()
        .is_some_and(|span| !span.is_complete() && matches!(span.kind, SpanKind::Think(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_block_gated_on_end_marker() {
        let mut extractor = MarkerExtractor::new();
        let open = "Pointer:Code+a.py:start\nprint(1)\n";
        assert!(file_operations(&extractor.extract(open)).is_empty());

        let closed = format!("{open}Pointer:Code+a.py:end");
        let ops = file_operations(&extractor.extract(&closed));
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].content, "print(1)");
        assert_eq!(ops[0].path.as_deref(), Some("a.py"));
    }

    #[test]
    fn test_markers_inside_think_are_ignored() {
        let text = "<think>maybe ```rust:a.rs\nfn a() {}\n``` or function_call: {\"name\":\"x\"}</think>Answer";
        let spans = scan_spans(text, 0).spans;
        assert_eq!(spans.len(), 1);
        assert!(matches!(spans[0].kind, SpanKind::Think(_)));
        assert!(file_operations(&spans).is_empty());
        assert!(tool_calls(&spans).is_empty());
    }

    #[test]
    fn test_open_think_is_reasoning_state() {
        let spans = scan_spans("<think>pondering ```python\nx", 0).spans;
        assert!(is_reasoning(&spans));
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn test_incremental_matches_full_scan() {
        let full = "Intro\n```rust:src/a.rs\nfn a() {}\n```\nthen <think>hm</think>\n\
                    ```command-normal\ncargo test\n```\n\
                    function_call: {\"id\":\"abc123xyz\",\"name\":\"read_file\",\"arguments\":{\"path\":\"x\"}}\n\
                    Pointer:Code+b.py:start\nprint(2)\nPointer:Code+b.py:end\nbye";
        let mut extractor = MarkerExtractor::new();
        let boundaries: Vec<usize> = (0..=full.len()).filter(|i| full.is_char_boundary(*i)).collect();
        for end in boundaries {
            let prefix = &full[..end];
            assert_eq!(extractor.extract(prefix), scan_spans(prefix, 0).spans, "prefix {end}");
        }
        let spans = extractor.extract(full);
        assert_eq!(file_operations(&spans).len(), 2);
        assert_eq!(command_blocks(&spans).len(), 1);
        assert_eq!(tool_calls(&spans)[0].name, "read_file");
        assert_eq!(extractor.settled_at(), full.rfind("\nbye").unwrap());
    }

    #[test]
    fn test_non_extending_snapshot_resets() {
        let mut extractor = MarkerExtractor::new();
        extractor.extract("```js\nlet a;\n```\n");
        assert!(extractor.settled_at() > 0);

        let spans = extractor.extract("fresh exchange");
        assert!(spans.is_empty());
        assert_eq!(extractor.settled_at(), 0);
    }

    #[test]
    fn test_partial_tool_call_detected_but_not_complete() {
        let spans = scan_spans("Let me look.\nfunction_call: {\"name\": \"read_", 0).spans;
        assert!(has_tool_call(&spans));
        assert!(tool_calls(&spans).is_empty());
    }
}
