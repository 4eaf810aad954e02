//! Tool-call detection, execution and continuation bookkeeping.
//!
//! The loop does not own a stream. The orchestrator reports what it sees
//! and asks the loop what to do next, so the state machine stays testable
//! without a model.

pub mod debounce;

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::conversation::ConversationHistory;
use crate::protocol::{ChatMessage, ToolCall, ToolResult};
use crate::tool_service::ToolService;

pub use debounce::ToolCallDebouncer;

const CONTINUE_INSTRUCTION: &str = "The tool calls above have finished and their results follow. \
Continue answering the user's original question using these results. Refer back to that question \
and do not repeat the tool calls or restate what you already said.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Streaming,
    ToolDetected,
    Debouncing,
    Executing,
    ResultInjected,
    Continuing,
}

/// Per-conversation tool execution state.
#[derive(Debug)]
pub struct ToolExecutionLoop {
    state: LoopState,
    in_chain: bool,
    rounds: usize,
    max_rounds: usize,
    executed: HashSet<String>,
    debouncer: ToolCallDebouncer,
    user_query: Option<String>,
}

impl ToolExecutionLoop {
    pub fn new(max_rounds: usize, debounce_window: Duration) -> Self {
        Self {
            state: LoopState::Idle,
            in_chain: false,
            rounds: 0,
            max_rounds,
            executed: HashSet::new(),
            debouncer: ToolCallDebouncer::new(debounce_window),
            user_query: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The chain flag: a tool call was detected and its continuation has
    /// not yet finished without another one.
    pub fn in_chain(&self) -> bool {
        self.in_chain
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn max_rounds(&self) -> usize {
        self.max_rounds
    }

    pub fn user_query(&self) -> Option<&str> {
        self.user_query.as_deref()
    }

    pub fn debouncer(&self) -> &ToolCallDebouncer {
        &self.debouncer
    }

    /// A user message starts a fresh chain.
    pub fn begin_turn(&mut self, user_query: &str) {
        self.reset();
        self.user_query = Some(user_query.to_string());
        self.state = LoopState::Streaming;
    }

    /// A new exchange (primary or continuation) has its own executed set.
    pub fn begin_exchange(&mut self) {
        self.executed.clear();
        self.debouncer.reset();
    }

    /// Record a snapshot that contains a tool-call marker. The first sighting
    /// in an exchange reports `ToolDetected`; later ones restart the window
    /// and report `Debouncing`.
    pub fn observe_tool_call(&mut self, snapshot: &str) {
        if !self.in_chain {
            info!(round = self.rounds, "tool call detected, chain started");
            self.in_chain = true;
        }
        let first = !self.debouncer.is_armed();
        self.debouncer.observe(snapshot);
        self.state = if first {
            LoopState::ToolDetected
        } else {
            LoopState::Debouncing
        };
    }

    /// Stable snapshot to parse once the debounce window has elapsed.
    pub fn take_stable_snapshot(&mut self) -> Option<String> {
        self.debouncer.take()
    }

    /// Normalize ids and arguments and drop calls already executed in this
    /// exchange.
    pub fn select_new_calls(&mut self, calls: Vec<ToolCall>) -> Vec<ToolCall> {
        calls
            .into_iter()
            .map(|call| call.normalized())
            .filter(|call| {
                let fresh = self.executed.insert(call.signature());
                if !fresh {
                    debug!(name = %call.name, "skipping already executed tool call");
                }
                fresh
            })
            .collect()
    }

    /// Run `calls` in order. Calls must already be normalized
    /// (see [`select_new_calls`](Self::select_new_calls)).
    pub async fn execute(&mut self, calls: &[ToolCall], service: &dyn ToolService) -> Vec<ToolResult> {
        self.state = LoopState::Executing;
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            info!(id = %call.id, name = %call.name, "executing tool call");
            let result = match service.call_tool(&call.name, call.arguments.clone()).await {
                Ok(output) => ToolResult::from_output(call, output),
                Err(e) => {
                    warn!(id = %call.id, name = %call.name, error = %e, "tool call failed");
                    ToolResult::failure(call, e.to_string(), self.user_query.as_deref())
                }
            };
            results.push(result);
        }
        results
    }

    /// Append one tool-role message per result, keyed by its call id.
    pub fn inject(&mut self, conversation: &mut ConversationHistory, results: &[ToolResult]) {
        for result in results {
            conversation.push(ChatMessage::tool_result(result));
        }
        self.state = LoopState::ResultInjected;
    }

    pub fn can_continue(&self) -> bool {
        self.in_chain && self.rounds < self.max_rounds
    }

    /// Request messages for the continuation after `results`.
    pub fn continuation_messages(&self, results: &[ToolResult]) -> Vec<ChatMessage> {
        let original = self.user_query.clone().unwrap_or_default();
        vec![
            ChatMessage::user(original),
            ChatMessage::system(CONTINUE_INSTRUCTION),
            ChatMessage::assistant(aggregate_results(results)),
        ]
    }

    /// Count a continuation round. Returns false when the chain may not
    /// continue, after clearing it.
    pub fn begin_continuation(&mut self) -> bool {
        if !self.can_continue() {
            let reason = if self.in_chain {
                "max tool rounds reached"
            } else {
                "not in a tool chain"
            };
            self.abort(reason);
            return false;
        }
        self.rounds += 1;
        self.state = LoopState::Continuing;
        info!(round = self.rounds, max = self.max_rounds, "continuing after tool results");
        true
    }

    /// A continuation stream ended. Without a further tool call the chain is
    /// over.
    pub fn finish_continuation(&mut self, produced_tool_call: bool) {
        if produced_tool_call {
            self.state = LoopState::ToolDetected;
        } else {
            info!(rounds = self.rounds, "tool chain finished");
            self.in_chain = false;
            self.state = LoopState::Idle;
        }
    }

    /// Stop the chain without further continuations.
    pub fn abort(&mut self, reason: &str) {
        if self.in_chain {
            warn!(reason, rounds = self.rounds, "tool chain stopped");
        }
        self.in_chain = false;
        self.debouncer.reset();
        self.state = LoopState::Idle;
    }

    /// The turn ended without any tool call.
    pub fn finish_turn(&mut self) {
        if !self.in_chain {
            self.state = LoopState::Idle;
        }
    }

    pub fn reset(&mut self) {
        self.state = LoopState::Idle;
        self.in_chain = false;
        self.rounds = 0;
        self.executed.clear();
        self.debouncer.reset();
        self.user_query = None;
    }
}

fn aggregate_results(results: &[ToolResult]) -> String {
    results
        .iter()
        .map(|r| format!("Result of {} ({}):\n{}", r.name, r.tool_call_id, r.to_tool_content()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
