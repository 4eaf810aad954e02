use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{ChatMessage, ChatRole};

pub const DEFAULT_TITLE: &str = "New Conversation";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Ordered, append-only message log for one conversation.
///
/// Past messages are never edited; a failed or timed-out reply is recorded
/// as a new assistant message carrying the error text.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
    pub metadata: ConversationMetadata,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationHistory {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            messages: Vec::new(),
            metadata: ConversationMetadata {
                id: Uuid::new_v4().to_string(),
                title: DEFAULT_TITLE.to_string(),
                created_at: now,
                updated_at: now,
                message_count: 0,
            },
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        // Title from the first user message
        if message.role == ChatRole::User && !self.messages.iter().any(|m| m.role == ChatRole::User) {
            self.metadata.title = generate_title(&message.content);
        }

        self.messages.push(message);
        self.metadata.message_count = self.messages.len();
        self.metadata.updated_at = Utc::now();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == ChatRole::User)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages for a model request: `system_prompt` first, then history
    /// without earlier system messages or empty assistant turns.
    ///
    /// Tool calls are written inline by the model rather than sent as
    /// structured `tool_calls`, so a tool-role message would have no call to
    /// answer. Each result is folded into the assistant turn that made it.
    pub fn request_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut out: Vec<ChatMessage> = Vec::with_capacity(self.messages.len() + 1);
        if !system_prompt.trim().is_empty() {
            out.push(ChatMessage::system(system_prompt));
        }
        for message in &self.messages {
            match message.role {
                ChatRole::System => {}
                ChatRole::Assistant if message.content.trim().is_empty() => {}
                ChatRole::User | ChatRole::Assistant => out.push(message.clone()),
                ChatRole::Tool => {
                    let result = format!(
                        "Result of call {}:\n{}",
                        message.tool_call_id.as_deref().unwrap_or("unknown"),
                        message.content
                    );
                    match out.last_mut() {
                        Some(last) if last.role == ChatRole::Assistant => {
                            last.content.push_str("\n\n");
                            last.content.push_str(&result);
                        }
                        _ => out.push(ChatMessage::assistant(result)),
                    }
                }
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Deterministic title: slash commands are capitalized, anything else is
/// cut at 50 characters on a word boundary.
pub fn generate_title(first_message: &str) -> String {
    let trimmed = first_message.trim();

    if let Some(without_slash) = trimmed.strip_prefix('/') {
        let mut chars = without_slash.chars();
        return match chars.next() {
            Some(first) => format!("{}{}", first.to_uppercase(), chars.as_str()),
            None => String::new(),
        };
    }

    if trimmed.chars().count() <= 50 {
        return trimmed.to_string();
    }

    let truncated: String = trimmed.chars().take(50).collect();
    match truncated.rfind(' ') {
        Some(last_space) => format!("{}...", &truncated[..last_space]),
        None => format!("{truncated}..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ToolCall, ToolOutput, ToolResult};
    use tempfile::TempDir;

    #[test]
    fn test_generate_title() {
        assert_eq!(generate_title("Fix the parser"), "Fix the parser");
        assert_eq!(generate_title("/explain this"), "Explain this");
        let long = "Please refactor the configuration loader so that it reads environment overrides";
        let title = generate_title(long);
        assert!(title.ends_with("..."));
        assert!(title.len() <= 53);
        assert!(!title.contains("environment"));
    }

    #[test]
    fn test_title_from_first_user_message_only() {
        let mut history = ConversationHistory::new();
        history.push(ChatMessage::system("be brief"));
        history.push(ChatMessage::user("first question"));
        history.push(ChatMessage::user("second question"));
        assert_eq!(history.metadata.title, "first question");
        assert_eq!(history.metadata.message_count, 3);
    }

    #[test]
    fn test_request_messages_filters_history() {
        let mut history = ConversationHistory::new();
        history.push(ChatMessage::system("old prompt"));
        history.push(ChatMessage::user("hi"));
        history.push(ChatMessage::assistant("  "));
        history.push(ChatMessage::assistant("hello"));

        let messages = history.request_messages("new prompt");
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ChatRole::System, ChatRole::User, ChatRole::Assistant]);
        assert_eq!(messages[0].content, "new prompt");
    }

    #[test]
    fn test_tool_results_fold_into_calling_assistant_turn() {
        let call = ToolCall::new("abc123xyz", "read_file", serde_json::json!({"path": "a.rs"}));
        let mut history = ConversationHistory::new();
        history.push(ChatMessage::user("what is in a.rs?"));
        history.push(ChatMessage::assistant("function_call: {\"name\": \"read_file\"}"));
        history.push(ChatMessage::tool_result(&ToolResult::from_output(&call, ToolOutput::ok("fn a() {}"))));
        history.push(ChatMessage::assistant("It defines a."));
        history.push(ChatMessage::user("thanks"));

        let messages = history.request_messages("");
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::User, ChatRole::Assistant, ChatRole::Assistant, ChatRole::User]
        );
        assert!(messages[1].content.starts_with("function_call:"));
        assert!(messages[1].content.ends_with("Result of call abc123xyz:\nfn a() {}"));
        assert!(messages.iter().all(|m| m.tool_call_id.is_none()));
    }

    #[test]
    fn test_save_and_resume() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conversations/one.json");
        let mut history = ConversationHistory::new();
        history.push(ChatMessage::user("resume me"));
        history.save(&path).unwrap();

        let loaded = ConversationHistory::load(&path).unwrap();
        assert_eq!(loaded.metadata.id, history.metadata.id);
        assert_eq!(loaded.messages()[0].content, "resume me");
    }
}
