//! Drives one conversation: streams a reply, turns completed code blocks
//! into pending diffs, runs commands and tool calls, and continues the
//! answer after tool results.
//!
//! Every piece of mutable state (chain flag, executed-command registry,
//! pending diffs) lives on the [`Orchestrator`] instance, so independent
//! conversations never share it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, SamplingParams};
use crate::conversation::{generate_title, ConversationHistory, DEFAULT_TITLE};
use crate::diff_bus::DiffBus;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, Listeners};
use crate::file_resolver::FileResolver;
use crate::file_store::FileStore;
use crate::markers::{
    has_tool_call, scan_spans, tool_calls, CommandBlock, CommandMode, FileOperation, MarkerExtractor, SpanKind,
};
use crate::merge::MergeEngine;
use crate::models::{ModelGateway, Purpose};
use crate::protocol::{Attachment, ChatMessage, ChatRole, ToolResult};
use crate::stream_decoder::ContentSnapshot;
use crate::tool_loop::ToolExecutionLoop;
use crate::tool_service::{ToolService, RUN_COMMAND};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a coding assistant working inside the user's project.\n\
When you change a file, put the code in a fenced block whose header names the language and the path, \
for example ```rust:src/main.rs. You may instead wrap it in Pointer:Code+<path>:start and \
Pointer:Code+<path>:end lines.\n\
To run a shell command immediately use a ```command-execute block; to suggest one for the user use a \
```command-normal block.\n\
To call a tool write function_call: followed by a JSON object with \"name\" and \"arguments\".";

const SUMMARY_PROMPT: &str = "Give this conversation a short title of at most six words. \
Reply with the title only.";

/// Cancels the reply in progress. Cheap to clone and valid across turns.
#[derive(Clone, Default)]
pub struct CancelHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.current().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.current().is_cancelled()
    }

    fn current(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Token for a new turn. A cancellation that landed between turns is
    /// discarded.
    fn fresh(&self) -> CancellationToken {
        let mut token = self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }
}

/// Run `work` unless `token` fires first.
async fn unless_cancelled<F: Future>(token: &CancellationToken, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        output = work => Some(output),
    }
}

/// How one streamed exchange ended.
enum ExchangeEnd {
    Completed { text: String, results: Vec<ToolResult> },
    Failed { text: String, error: EngineError },
    Cancelled,
}

pub struct Orchestrator {
    config: EngineConfig,
    gateway: Arc<ModelGateway>,
    store: Arc<dyn FileStore>,
    tools: Arc<dyn ToolService>,
    diff_bus: DiffBus,
    extractor: MarkerExtractor,
    resolver: FileResolver,
    merger: MergeEngine,
    tool_loop: ToolExecutionLoop,
    conversation: ConversationHistory,
    listeners: Listeners,
    system_prompt: String,
    purpose: Purpose,
    executed_commands: HashSet<String>,
    consumed_spans: HashSet<usize>,
    next_exchange_id: u64,
    is_processing: bool,
    cancel: CancelHandle,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        gateway: Arc<ModelGateway>,
        store: Arc<dyn FileStore>,
        tools: Arc<dyn ToolService>,
    ) -> Self {
        let listeners = Listeners::new();
        Self {
            diff_bus: DiffBus::with_listeners(store.clone(), listeners.clone()),
            extractor: MarkerExtractor::new(),
            resolver: FileResolver::new(store.clone(), gateway.clone(), config.resolver.clone()),
            merger: MergeEngine::new(gateway.clone(), store.clone(), config.max_project_listing),
            tool_loop: ToolExecutionLoop::new(config.max_tool_rounds, config.debounce_window()),
            conversation: ConversationHistory::new(),
            listeners,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            purpose: Purpose::Chat,
            executed_commands: HashSet::new(),
            consumed_spans: HashSet::new(),
            next_exchange_id: 0,
            is_processing: false,
            cancel: CancelHandle::default(),
            config,
            gateway,
            store,
            tools,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Continue a saved conversation.
    pub fn with_conversation(mut self, conversation: ConversationHistory) -> Self {
        self.conversation = conversation;
        self
    }

    /// `Chat` or `Agent`; selects the model and endpoint for replies.
    pub fn with_purpose(mut self, purpose: Purpose) -> Self {
        self.purpose = purpose;
        self
    }

    pub fn diff_bus(&self) -> &DiffBus {
        &self.diff_bus
    }

    pub fn conversation(&self) -> &ConversationHistory {
        &self.conversation
    }

    pub fn tool_loop(&self) -> &ToolExecutionLoop {
        &self.tool_loop
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener);
    }

    /// Send a user message and drive the reply, including any tool rounds,
    /// to completion. Returns the text of the last assistant message.
    pub async fn send(&mut self, user_message: &str) -> Result<String> {
        self.send_with_attachments(user_message, Vec::new()).await
    }

    /// Like [`send`](Self::send), with file contents attached to the message.
    pub async fn send_with_attachments(&mut self, user_message: &str, attachments: Vec<Attachment>) -> Result<String> {
        let token = self.cancel.fresh();
        self.is_processing = true;

        // 1. Record the user message
        self.conversation
            .push(ChatMessage::user(user_message).with_attachments(attachments));
        self.tool_loop.begin_turn(user_message);

        // 2. Stream the reply, then follow the tool chain
        let result = self.run_turn(&token).await;

        self.is_processing = false;
        result
    }

    async fn run_turn(&mut self, token: &CancellationToken) -> Result<String> {
        let messages = self.conversation.request_messages(&self.system_prompt);
        let (mut text, mut results) = match self.run_exchange(&messages, token).await {
            ExchangeEnd::Completed { text, results } => (text, results),
            ExchangeEnd::Failed { text, error } => return Err(self.fail_exchange(&text, error)),
            ExchangeEnd::Cancelled => return Err(self.cancelled()),
        };
        self.conversation.push(ChatMessage::assistant(text.clone()));

        // 3. Continue while tool results keep coming
        loop {
            if results.is_empty() {
                if self.tool_loop.in_chain() {
                    self.tool_loop.abort("no complete tool call to execute");
                } else {
                    self.tool_loop.finish_turn();
                }
                return Ok(text);
            }

            self.tool_loop.inject(&mut self.conversation, &results);
            if !self.tool_loop.begin_continuation() {
                return Ok(text);
            }

            let messages = self.tool_loop.continuation_messages(&results);
            let timeout = self.config.continuation_timeout();
            let outcome = tokio::time::timeout(timeout, self.run_exchange(&messages, token)).await;
            match outcome {
                Err(_) => {
                    let message = format!("Error: the continuation timed out after {}s.", timeout.as_secs());
                    warn!(?timeout, round = self.tool_loop.rounds(), "continuation timed out");
                    self.conversation.push(ChatMessage::assistant(message.clone()));
                    self.listeners.emit(&EngineEvent::Error { message });
                    self.tool_loop.abort("continuation timed out");
                    return Err(EngineError::Timeout(timeout));
                }
                Ok(ExchangeEnd::Cancelled) => return Err(self.cancelled()),
                Ok(ExchangeEnd::Failed { text, error }) => {
                    self.tool_loop.abort("continuation failed");
                    return Err(self.fail_exchange(&text, error));
                }
                Ok(ExchangeEnd::Completed {
                    text: next_text,
                    results: next_results,
                }) => {
                    self.conversation.push(ChatMessage::assistant(next_text.clone()));
                    self.tool_loop.finish_continuation(!next_results.is_empty());
                    text = next_text;
                    results = next_results;
                }
            }
        }
    }

    /// Stream one exchange to its end, acting on each snapshot.
    async fn run_exchange(&mut self, messages: &[ChatMessage], token: &CancellationToken) -> ExchangeEnd {
        self.next_exchange_id += 1;
        let exchange_id = self.next_exchange_id;
        self.extractor.reset();
        self.consumed_spans.clear();
        self.executed_commands.clear();
        self.tool_loop.begin_exchange();

        let mut decoder = match self
            .gateway
            .open_stream(
                self.purpose,
                messages,
                &self.config.sampling,
                self.tools.definitions(),
                exchange_id,
            )
            .await
        {
            Ok(decoder) => decoder,
            Err(error) => {
                return ExchangeEnd::Failed {
                    text: String::new(),
                    error,
                }
            }
        };

        let mut results = Vec::new();
        let mut latest = String::new();
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!(exchange_id, "reply cancelled");
                    return ExchangeEnd::Cancelled;
                }
                _ = self.tool_loop.debouncer().wait(), if self.tool_loop.debouncer().is_armed() => {
                    if let Some(stable) = self.tool_loop.take_stable_snapshot() {
                        let Some(batch) = unless_cancelled(token, self.execute_tool_calls(&stable)).await else {
                            info!(exchange_id, "reply cancelled during tool execution");
                            return ExchangeEnd::Cancelled;
                        };
                        results.extend(batch);
                    }
                }
                next = decoder.next_snapshot() => match next {
                    Some(Ok(snapshot)) => {
                        latest.clone_from(&snapshot.text);
                        if unless_cancelled(token, self.handle_snapshot(&snapshot)).await.is_none() {
                            info!(exchange_id, "reply cancelled while acting on a snapshot");
                            return ExchangeEnd::Cancelled;
                        }
                        if snapshot.is_final {
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        return ExchangeEnd::Failed {
                            text: decoder.current().text,
                            error,
                        };
                    }
                    None => break,
                },
            }
        }

        // Calls still inside the debounce window are parsed from the final text.
        if self.tool_loop.debouncer().is_armed() {
            self.tool_loop.take_stable_snapshot();
            let Some(batch) = unless_cancelled(token, self.execute_tool_calls(&latest)).await else {
                info!(exchange_id, "reply cancelled during tool execution");
                return ExchangeEnd::Cancelled;
            };
            results.extend(batch);
        }

        debug!(exchange_id, chars = latest.len(), tool_results = results.len(), "exchange finished");
        ExchangeEnd::Completed { text: latest, results }
    }

    async fn handle_snapshot(&mut self, snapshot: &ContentSnapshot) {
        self.listeners.emit(&EngineEvent::SnapshotUpdated {
            exchange_id: snapshot.exchange_id,
            text: snapshot.text.clone(),
        });

        let spans = self.extractor.extract(&snapshot.text);
        let settled_at = self.extractor.settled_at();

        for span in &spans {
            // A fence closed at the very end may still turn into something
            // else until the next byte arrives.
            let ready = span.end.is_some_and(|end| end <= settled_at || snapshot.is_final);
            if !ready {
                continue;
            }
            match &span.kind {
                SpanKind::CodeBlock(block) => {
                    if self.consumed_spans.insert(span.start) {
                        self.apply_file_operation(FileOperation::from(block)).await;
                    }
                }
                SpanKind::CommandBlock(command) => {
                    if self.consumed_spans.insert(span.start) {
                        self.handle_command(command).await;
                    }
                }
                SpanKind::ToolCall(_) | SpanKind::Think(_) => {}
            }
        }

        if has_tool_call(&spans) {
            self.tool_loop.observe_tool_call(&snapshot.text);
        }
    }

    /// Resolve, merge and publish one completed code block. Never writes.
    async fn apply_file_operation(&mut self, operation: FileOperation) {
        let resolution = match self.resolver.resolve(&operation).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(error = %e, "could not resolve target file");
                self.listeners.emit(&EngineEvent::Error {
                    message: format!("Could not resolve a file for a code block: {e}"),
                });
                return;
            }
        };

        if let Some(notice) = resolution.ambiguity() {
            self.listeners.emit(&EngineEvent::Error {
                message: notice.to_string(),
            });
        }

        // An unreadable file is not a missing one.
        let existing = match self.store.read_file(&resolution.path).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(path = %resolution.path, error = %e, "could not read target, change not proposed");
                self.listeners.emit(&EngineEvent::Error {
                    message: format!("Could not read {}: {e}. The change was not proposed.", resolution.path),
                });
                return;
            }
        };

        let outcome = self
            .merger
            .merge(&resolution.path, existing.as_deref(), &resolution.content)
            .await;
        if existing.as_deref() == Some(outcome.content.as_str()) {
            debug!(path = %resolution.path, "merged content unchanged, nothing to review");
            return;
        }

        info!(path = %resolution.path, strategy = ?outcome.strategy, source = ?resolution.source, "diff ready for review");
        self.diff_bus.publish(&resolution.path, existing, outcome.content);
    }

    async fn handle_command(&mut self, command: &CommandBlock) {
        if command.command.is_empty() {
            return;
        }
        match command.mode {
            CommandMode::Normal => {
                self.listeners.emit(&EngineEvent::CommandProposed {
                    command: command.command.clone(),
                    auto_run: false,
                });
            }
            CommandMode::Execute => {
                if !self.executed_commands.insert(command.command.clone()) {
                    debug!(command = %command.command, "command already executed in this exchange");
                    return;
                }
                self.listeners.emit(&EngineEvent::CommandProposed {
                    command: command.command.clone(),
                    auto_run: true,
                });
                match self
                    .tools
                    .call_tool(RUN_COMMAND, json!({ "command": command.command }))
                    .await
                {
                    Ok(output) => info!(command = %command.command, success = output.success, "command finished"),
                    Err(e) => {
                        warn!(command = %command.command, error = %e, "command failed to run");
                        self.listeners.emit(&EngineEvent::Error {
                            message: format!("Command `{}` failed: {e}", command.command),
                        });
                    }
                }
            }
        }
    }

    /// Execute the complete, not yet executed tool calls found in `text`.
    async fn execute_tool_calls(&mut self, text: &str) -> Vec<ToolResult> {
        let spans = scan_spans(text, 0).spans;
        let calls = self.tool_loop.select_new_calls(tool_calls(&spans));

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            self.listeners.emit(&EngineEvent::ToolCallStarted {
                id: call.id.clone(),
                name: call.name.clone(),
            });
            let mut batch = self
                .tool_loop
                .execute(std::slice::from_ref(&call), self.tools.as_ref())
                .await;
            if let Some(result) = batch.pop() {
                self.listeners.emit(&EngineEvent::ToolCallFinished {
                    id: result.tool_call_id.clone(),
                    success: result.success,
                });
                results.push(result);
            }
        }
        results
    }

    /// Record a failed exchange as a new assistant message and report it.
    fn fail_exchange(&mut self, partial: &str, error: EngineError) -> EngineError {
        warn!(error = %error, partial_chars = partial.len(), "reply failed");
        let notice = format!("Error: {error}");
        let content = if partial.trim().is_empty() {
            notice.clone()
        } else {
            format!("{partial}\n\n{notice}")
        };
        self.conversation.push(ChatMessage::assistant(content));
        self.listeners.emit(&EngineEvent::Error { message: notice });
        error
    }

    fn cancelled(&mut self) -> EngineError {
        self.tool_loop.reset();
        self.extractor.reset();
        self.consumed_spans.clear();
        self.is_processing = false;
        EngineError::Cancelled
    }

    /// Title for the conversation, from the model when it answers and from
    /// the first user message otherwise.
    pub async fn summarize(&mut self) -> String {
        let Some(first_user) = self
            .conversation
            .messages()
            .iter()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.clone())
        else {
            return DEFAULT_TITLE.to_string();
        };

        let transcript = self
            .conversation
            .messages()
            .iter()
            .filter(|m| matches!(m.role, ChatRole::User | ChatRole::Assistant))
            .take(6)
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = [ChatMessage::system(SUMMARY_PROMPT), ChatMessage::user(transcript)];
        let params = SamplingParams::default().with_temperature(0.3).with_max_tokens(20);

        let title = match self.gateway.complete_text(Purpose::Summary, &messages, &params).await {
            Ok(answer) => {
                let cleaned = answer.lines().next().unwrap_or_default().trim().trim_matches('"').trim();
                if cleaned.is_empty() {
                    generate_title(&first_user)
                } else {
                    cleaned.to_string()
                }
            }
            Err(e) => {
                debug!(error = %e, "summary unavailable, using first message");
                generate_title(&first_user)
            }
        };
        self.conversation.metadata.title = title.clone();
        title
    }
}
