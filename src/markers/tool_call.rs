//! `function_call:` detection.
//!
//! Models emit calls as `function_call:` followed by a JSON object, sometimes
//! wrapped in a ```` ```json ```` fence. While the object is still streaming
//! the call is reported as [`ParsedToolCall::Partial`] with whatever fields a
//! regex can already see; it only becomes [`ParsedToolCall::Complete`] once
//! the braces balance.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

use crate::protocol::ToolCall;

pub const FUNCTION_CALL_MARKER: &str = "function_call:";

lazy_static! {
    static ref NAME_FIELD: Regex = Regex::new(r#""name"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap();
    static ref ID_FIELD: Regex = Regex::new(r#""id"\s*:\s*"?([A-Za-z0-9_\-]+)"?"#).unwrap();
    static ref ARGUMENTS_FIELD: Regex =
        Regex::new(r#"(?s)"(?:arguments|parameters|args)"\s*:\s*(.*)$"#).unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartialToolCall {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Raw argument text seen so far; not valid JSON until the call completes.
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedToolCall {
    Complete(ToolCall),
    Partial(PartialToolCall),
    /// A balanced object that does not describe a call.
    None,
}

impl ParsedToolCall {
    pub fn as_complete(&self) -> Option<&ToolCall> {
        match self {
            ParsedToolCall::Complete(call) => Some(call),
            _ => None,
        }
    }
}

pub(crate) struct ToolCallMatch {
    pub parsed: ParsedToolCall,
    /// Offset just past the JSON object; `None` while it is unbalanced.
    pub end: Option<usize>,
    /// Where scanning may resume. Past the closing fence for fenced calls,
    /// `None` while that fence has not arrived.
    pub resume: Option<usize>,
}

pub(crate) fn find_marker(text: &str, from: usize) -> Option<usize> {
    text[from..].find(FUNCTION_CALL_MARKER).map(|idx| from + idx)
}

/// Parse the call whose marker starts at `start`.
///
/// Returns `None` when the marker is followed by prose, i.e. the model was
/// talking about a function call rather than making one.
pub(crate) fn parse_at(text: &str, start: usize) -> Option<ToolCallMatch> {
    let mut pos = skip_whitespace(text, start + FUNCTION_CALL_MARKER.len());
    let mut fenced = false;

    if pos < text.len() && "```".starts_with(&text[pos..]) {
        // Fence still arriving one backtick at a time.
        return Some(open_match(PartialToolCall::default()));
    }
    if text[pos..].starts_with("```") {
        fenced = true;
        match text[pos..].find('\n') {
            Some(idx) => pos = skip_whitespace(text, pos + idx + 1),
            None => return Some(open_match(PartialToolCall::default())),
        }
    }

    if pos >= text.len() {
        return Some(open_match(PartialToolCall::default()));
    }
    if !text[pos..].starts_with('{') {
        return None;
    }

    let Some(json_end) = balanced_object_end(text, pos) else {
        return Some(open_match(partial_fields(&text[pos..])));
    };

    let resume = if fenced {
        closing_fence_end(text, json_end)
    } else {
        Some(json_end)
    };

    Some(ToolCallMatch {
        parsed: parse_object(&text[pos..json_end]),
        end: Some(json_end),
        resume,
    })
}

fn open_match(partial: PartialToolCall) -> ToolCallMatch {
    ToolCallMatch {
        parsed: ParsedToolCall::Partial(partial),
        end: None,
        resume: None,
    }
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    let trimmed = text[from..].trim_start();
    text.len() - trimmed.len()
}

fn closing_fence_end(text: &str, json_end: usize) -> Option<usize> {
    let pos = skip_whitespace(text, json_end);
    if pos >= text.len() || "```".starts_with(&text[pos..]) {
        return None;
    }
    if text[pos..].starts_with("```") {
        let mut end = pos + 3;
        if text[end..].starts_with('\n') {
            end += 1;
        }
        return Some(end);
    }
    // Fence never closed; the object itself is the whole construct.
    Some(json_end)
}

/// Offset just past the `}` matching the `{` at `open`, honoring strings.
pub(crate) fn balanced_object_end(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, byte) in text.as_bytes()[open..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Two-stage parse of a balanced object: strict JSON first, field regexes
/// for near-JSON the model sometimes produces.
pub(crate) fn parse_object(json: &str) -> ParsedToolCall {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(json) {
        return from_map(&map);
    }

    let fields = partial_fields(json);
    match fields.name {
        Some(name) if !name.trim().is_empty() => {
            let arguments = fields
                .arguments
                .as_deref()
                .map(lenient_arguments)
                .unwrap_or(Value::Null);
            ParsedToolCall::Complete(ToolCall::new(fields.id.unwrap_or_default(), name, arguments))
        }
        _ => ParsedToolCall::None,
    }
}

fn from_map(map: &Map<String, Value>) -> ParsedToolCall {
    let function = map.get("function").and_then(Value::as_object);

    let name = map
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| function.and_then(|f| f.get("name")).and_then(Value::as_str))
        .map(str::trim)
        .filter(|name| !name.is_empty());
    let Some(name) = name else {
        return ParsedToolCall::None;
    };

    let arguments = ["arguments", "parameters", "args"]
        .iter()
        .find_map(|key| map.get(*key))
        .or_else(|| function.and_then(|f| f.get("arguments")))
        .cloned()
        .unwrap_or(Value::Null);

    let id = match map.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    };

    ParsedToolCall::Complete(ToolCall::new(id, name, arguments))
}

fn partial_fields(text: &str) -> PartialToolCall {
    PartialToolCall {
        id: ID_FIELD.captures(text).map(|c| c[1].to_string()),
        name: NAME_FIELD.captures(text).map(|c| c[1].to_string()),
        arguments: ARGUMENTS_FIELD
            .captures(text)
            .map(|c| argument_text(&c[1]).to_string()),
    }
}

/// The arguments capture runs to the end of the text; cut it down to the
/// value itself when that value is already closed.
fn argument_text(raw: &str) -> &str {
    let raw = raw.trim();
    if raw.starts_with('{') {
        return match balanced_object_end(raw, 0) {
            Some(end) => &raw[..end],
            None => raw,
        };
    }
    if raw.starts_with('"') {
        let mut escaped = false;
        for (i, byte) in raw.as_bytes().iter().enumerate().skip(1) {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => return &raw[..=i],
                _ => {}
            }
        }
    }
    raw
}

fn lenient_arguments(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw.trim()).unwrap_or_else(|_| Value::String(raw.to_string()))
}
