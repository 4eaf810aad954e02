use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SamplingParams;

lazy_static! {
    static ref TOOL_CALL_ID: Regex = Regex::new(r"^[a-z0-9]{9}$").unwrap();
}

pub const TOOL_CALL_ID_LEN: usize = 9;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System => "system",
            ChatRole::Tool => "tool",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn tool_result(result: &ToolResult) -> Self {
        let mut msg = Self::new(ChatRole::Tool, result.to_tool_content());
        msg.tool_call_id = Some(result.tool_call_id.clone());
        msg
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// A function call requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Copy of this call with a contract-conforming id and object arguments.
    pub fn normalized(&self) -> Self {
        Self {
            id: normalize_tool_call_id(&self.id),
            name: self.name.trim().to_string(),
            arguments: normalize_arguments(&self.arguments),
        }
    }

    /// Stable key used to avoid executing the same call twice.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.name.trim(), normalize_arguments(&self.arguments))
    }
}

pub fn is_valid_tool_call_id(id: &str) -> bool {
    TOOL_CALL_ID.is_match(id)
}

/// Keep `id` when it already matches `^[a-z0-9]{9}$`, otherwise mint a new one.
pub fn normalize_tool_call_id(id: &str) -> String {
    if is_valid_tool_call_id(id) {
        id.to_string()
    } else {
        generate_tool_call_id()
    }
}

pub fn generate_tool_call_id() -> String {
    // Simple-format uuids are lowercase hex, a subset of the allowed alphabet.
    uuid::Uuid::new_v4().simple().to_string()[..TOOL_CALL_ID_LEN].to_string()
}

/// Tool arguments may arrive as a JSON string or an object; dispatch always
/// sees an object.
pub fn normalize_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::Object(_) => arguments.clone(),
        Value::Null => Value::Object(serde_json::Map::new()),
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Value::Object(serde_json::Map::new());
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => Value::Object(map),
                Ok(other) => serde_json::json!({ "value": other }),
                Err(_) => serde_json::json!({ "value": raw }),
            }
        }
        other => serde_json::json!({ "value": other }),
    }
}

/// What an external tool returned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            continuation: None,
        }
    }

    pub fn err(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
            continuation: None,
        }
    }
}

/// Outcome of one tool call, correlated back by `tool_call_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_hint: Option<String>,
}

impl ToolResult {
    pub fn from_output(call: &ToolCall, output: ToolOutput) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            success: output.success,
            content: output.content,
            continuation_hint: output.continuation,
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>, user_query: Option<&str>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            success: false,
            content: error.into(),
            continuation_hint: user_query.map(|q| format!("The user originally asked: {q}")),
        }
    }

    pub fn to_tool_content(&self) -> String {
        let body = if self.success {
            self.content.clone()
        } else {
            format!("tool_error: {}", self.content)
        };
        match &self.continuation_hint {
            Some(hint) if !hint.trim().is_empty() => format!("{body}\n\n{hint}"),
            _ => body,
        }
    }
}

/// Body of an OpenAI-style streaming chat completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: &[ChatMessage], params: &SamplingParams) -> Self {
        Self {
            model: model.into(),
            messages: messages.iter().map(OpenAiMessage::from).collect(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            tools: None,
            tool_choice: None,
            stream: true,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        if !tools.is_empty() {
            self.tools = Some(tools);
            self.tool_choice = Some(Value::String("auto".to_string()));
        }
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct OpenAiMessage {
    pub role: String,
    pub content: String,
}

impl From<&ChatMessage> for OpenAiMessage {
    fn from(msg: &ChatMessage) -> Self {
        let mut content = msg.content.clone();
        for attachment in &msg.attachments {
            content.push_str(&format!(
                "\n\n[Attachment: {}]\n{}",
                attachment.name, attachment.content
            ));
        }
        Self {
            role: msg.role.as_str().to_string(),
            content,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}
