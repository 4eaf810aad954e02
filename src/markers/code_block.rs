use lazy_static::lazy_static;
use regex::Regex;

pub const POINTER_OPEN: &str = "Pointer:Code";

lazy_static! {
    static ref POINTER_START: Regex = Regex::new(r"Pointer:Code\+([^\r\n]+?):start").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStyle {
    /// `Pointer:Code+<file>:start … Pointer:Code+<file>:end`
    Pointer,
    /// Markdown fence, optionally with a `language:filename` header.
    Fenced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub style: BlockStyle,
    pub language: Option<String>,
    pub filename: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    /// `command-execute`: runs without asking.
    Execute,
    /// `command-normal`: waits for the user.
    Normal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBlock {
    pub mode: CommandMode,
    pub command: String,
}

/// A fenced block is either a command or code, depending on its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FencedBody {
    Code(CodeBlock),
    Command(CommandBlock),
}

pub(crate) struct PointerMatch {
    pub start: usize,
    pub block: CodeBlock,
    pub end: Option<usize>,
}

pub(crate) fn find_pointer_start(text: &str, from: usize) -> Option<usize> {
    POINTER_START.find_at(text, from).map(|m| m.start())
}

/// Parse the pointer block whose start marker begins at `start`.
pub(crate) fn parse_pointer_block(text: &str, start: usize) -> Option<PointerMatch> {
    let caps = POINTER_START.captures_at(text, start)?;
    let marker = caps.get(0)?;
    let filename = caps.get(1)?.as_str().trim().to_string();
    let body_start = marker.end();
    let end_marker = format!("{POINTER_OPEN}+{filename}:end");

    let (content, end) = match text[body_start..].find(&end_marker) {
        Some(idx) => (
            &text[body_start..body_start + idx],
            Some(body_start + idx + end_marker.len()),
        ),
        None => (&text[body_start..], None),
    };

    Some(PointerMatch {
        start: marker.start(),
        block: CodeBlock {
            style: BlockStyle::Pointer,
            language: language_from_filename(&filename),
            filename: Some(filename),
            content: trim_block_content(content),
        },
        end,
    })
}

/// Offset of the next line-initial ``` at or after `from`.
pub(crate) fn find_fence_open(text: &str, from: usize) -> Option<usize> {
    let mut search = from;
    while let Some(idx) = text[search..].find("```") {
        let pos = search + idx;
        if is_line_start(text, pos) {
            return Some(pos);
        }
        search = pos + 3;
    }
    None
}

fn is_line_start(text: &str, pos: usize) -> bool {
    text[..pos]
        .chars()
        .rev()
        .take_while(|c| *c != '\n')
        .all(|c| c == ' ' || c == '\t')
}

pub(crate) struct FenceMatch {
    pub body: FencedBody,
    pub end: Option<usize>,
    /// Closed and followed by a newline, so later text cannot reopen it.
    pub settled: bool,
}

/// Parse the fence opening at `start`. Open fences return `end: None`.
pub(crate) fn parse_fence(text: &str, start: usize) -> FenceMatch {
    let after_ticks = start + 3;
    let Some(header_len) = text[after_ticks..].find('\n') else {
        // Header still streaming.
        let header = text[after_ticks..].trim_start_matches('`').trim();
        return FenceMatch {
            body: fenced_body(header, String::new()),
            end: None,
            settled: false,
        };
    };

    let header = text[after_ticks..after_ticks + header_len]
        .trim_start_matches('`')
        .trim();
    let body_start = after_ticks + header_len + 1;
    let (content, end, settled) = match find_fence_close(text, body_start) {
        Some((close_start, close_end)) => (
            &text[body_start..close_start],
            Some(close_end),
            text[..close_end].ends_with('\n'),
        ),
        None => (&text[body_start..], None, false),
    };

    FenceMatch {
        body: fenced_body(header, strip_trailing_newline(content).to_string()),
        end,
        settled,
    }
}

/// A closing fence is a line holding only backticks (and whitespace).
fn find_fence_close(text: &str, body_start: usize) -> Option<(usize, usize)> {
    let mut line_start = body_start;
    loop {
        let line_end = text[line_start..]
            .find('\n')
            .map(|i| line_start + i)
            .unwrap_or(text.len());
        let line = text[line_start..line_end].trim();
        if line.starts_with("```") && line.chars().all(|c| c == '`') {
            let close_end = if line_end < text.len() { line_end + 1 } else { line_end };
            return Some((line_start, close_end));
        }
        if line_end >= text.len() {
            return None;
        }
        line_start = line_end + 1;
    }
}

fn fenced_body(header: &str, content: String) -> FencedBody {
    match header {
        "command-execute" => {
            return FencedBody::Command(CommandBlock {
                mode: CommandMode::Execute,
                command: content.trim().to_string(),
            })
        }
        "command-normal" => {
            return FencedBody::Command(CommandBlock {
                mode: CommandMode::Normal,
                command: content.trim().to_string(),
            })
        }
        _ => {}
    }

    let (language, filename) = parse_fence_header(header);
    FencedBody::Code(CodeBlock {
        style: BlockStyle::Fenced,
        language,
        filename,
        content,
    })
}

/// `rust:src/main.rs` → (rust, src/main.rs); `src/main.rs` → (rs, src/main.rs);
/// `python` → (python, none).
pub(crate) fn parse_fence_header(header: &str) -> (Option<String>, Option<String>) {
    let header = header.split_whitespace().next().unwrap_or("");
    if header.is_empty() {
        return (None, None);
    }
    if let Some((lang, file)) = header.split_once(':') {
        let lang = lang.trim();
        let file = file.trim();
        let language = (!lang.is_empty()).then(|| lang.to_lowercase());
        let filename = (!file.is_empty()).then(|| file.to_string());
        let language = language.or_else(|| filename.as_deref().and_then(language_from_filename));
        return (language, filename);
    }
    if header.contains('/') || header.contains('\\') || looks_like_filename(header) {
        return (language_from_filename(header), Some(header.to_string()));
    }
    (Some(header.to_lowercase()), None)
}

fn looks_like_filename(header: &str) -> bool {
    match header.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty() && !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn language_from_filename(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn trim_block_content(content: &str) -> String {
    content.trim_matches(|c| c == '\n' || c == '\r').trim_end().to_string()
}

fn strip_trailing_newline(content: &str) -> &str {
    content
        .strip_suffix("\r\n")
        .or_else(|| content.strip_suffix('\n'))
        .unwrap_or(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_block_open_then_closed() {
        let open = "Pointer:Code+a.py:start\nprint(1)\n";
        let m = parse_pointer_block(open, 0).unwrap();
        assert!(m.end.is_none());
        assert_eq!(m.block.content, "print(1)");

        let closed = format!("{open}Pointer:Code+a.py:end");
        let m = parse_pointer_block(&closed, 0).unwrap();
        assert_eq!(m.end, Some(closed.len()));
        assert_eq!(m.block.filename.as_deref(), Some("a.py"));
        assert_eq!(m.block.language.as_deref(), Some("py"));
        assert_eq!(m.block.content, "print(1)");
    }

    #[test]
    fn test_fence_header_variants() {
        assert_eq!(
            parse_fence_header("rust:src/main.rs"),
            (Some("rust".to_string()), Some("src/main.rs".to_string()))
        );
        assert_eq!(
            parse_fence_header("src/lib.rs"),
            (Some("rs".to_string()), Some("src/lib.rs".to_string()))
        );
        assert_eq!(parse_fence_header("Python"), (Some("python".to_string()), None));
        assert_eq!(parse_fence_header(""), (None, None));
    }

    #[test]
    fn test_fence_requires_line_start() {
        let text = "inline ```not a fence``` here\n```js\nlet a = 1;\n```\n";
        let pos = find_fence_open(text, 0).unwrap();
        assert_eq!(&text[pos..pos + 5], "```js");
    }

    #[test]
    fn test_command_fence() {
        let text = "```command-execute\nnpm install\n```\n";
        let m = parse_fence(text, 0);
        assert_eq!(m.end, Some(text.len()));
        assert!(m.settled);
        assert_eq!(
            m.body,
            FencedBody::Command(CommandBlock {
                mode: CommandMode::Execute,
                command: "npm install".to_string(),
            })
        );
    }

    #[test]
    fn test_fence_closed_at_end_of_text_is_unsettled() {
        let text = "```\nplain\n```";
        let m = parse_fence(text, 0);
        assert_eq!(m.end, Some(text.len()));
        assert!(!m.settled);
    }

    #[test]
    fn test_open_fence_keeps_partial_content() {
        let text = "```python:app.py\ndef main():\n    pass\n";
        let m = parse_fence(text, 0);
        assert!(m.end.is_none());
        match m.body {
            FencedBody::Code(block) => {
                assert_eq!(block.filename.as_deref(), Some("app.py"));
                assert_eq!(block.content, "def main():\n    pass");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
