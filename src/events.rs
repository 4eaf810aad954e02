//! Events the engine pushes upward.
//!
//! The UI (or the CLI driver) is a pure subscriber: it renders what it is told
//! and calls back into the engine through its methods, never by mutating
//! engine state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Event names as constants to prevent typos
pub mod event_names {
    // === Streaming ===

    /// Accumulated assistant text changed
    pub const SNAPSHOT_UPDATED: &str = "snapshot-updated";

    /// Error surfaced to the user
    pub const ENGINE_ERROR: &str = "engine-error";

    // === Diff review ===

    /// A proposed file change is waiting for review
    pub const DIFF_PUBLISHED: &str = "diff-published";

    /// Change written to disk
    pub const DIFF_ACCEPTED: &str = "diff-accepted";

    /// Change discarded
    pub const DIFF_REJECTED: &str = "diff-rejected";

    /// File tree should be reloaded
    pub const DIRECTORY_REFRESH: &str = "directory-refresh";

    // === Tools and commands ===

    pub const TOOL_CALL_STARTED: &str = "tool-call-started";
    pub const TOOL_CALL_FINISHED: &str = "tool-call-finished";

    /// Command block that needs an explicit user action
    pub const COMMAND_PROPOSED: &str = "command-proposed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SnapshotUpdated { exchange_id: u64, text: String },
    DiffPublished { path: String },
    DiffAccepted { path: String },
    DiffRejected { path: String },
    DirectoryRefresh,
    ToolCallStarted { id: String, name: String },
    ToolCallFinished { id: String, success: bool },
    CommandProposed { command: String, auto_run: bool },
    Error { message: String },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        use event_names::*;
        match self {
            EngineEvent::SnapshotUpdated { .. } => SNAPSHOT_UPDATED,
            EngineEvent::DiffPublished { .. } => DIFF_PUBLISHED,
            EngineEvent::DiffAccepted { .. } => DIFF_ACCEPTED,
            EngineEvent::DiffRejected { .. } => DIFF_REJECTED,
            EngineEvent::DirectoryRefresh => DIRECTORY_REFRESH,
            EngineEvent::ToolCallStarted { .. } => TOOL_CALL_STARTED,
            EngineEvent::ToolCallFinished { .. } => TOOL_CALL_FINISHED,
            EngineEvent::CommandProposed { .. } => COMMAND_PROPOSED,
            EngineEvent::Error { .. } => ENGINE_ERROR,
        }
    }
}

pub type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Fan-out to any number of subscribers.
///
/// A listener that panics is logged and skipped; the remaining listeners
/// still run and the caller never sees the panic.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<Mutex<Vec<Listener>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.inner.lock() {
            listeners.push(Arc::new(listener));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emit(&self, event: &EngineEvent) {
        // Snapshot the list so a listener may subscribe without deadlocking.
        let listeners: Vec<Listener> = match self.inner.lock() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(event = event.name(), "listener panicked; skipping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_panicking_listener_is_isolated() {
        let listeners = Listeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        listeners.subscribe(|_| panic!("boom"));
        let counter = hits.clone();
        listeners.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&EngineEvent::DirectoryRefresh);
        listeners.emit(&EngineEvent::DirectoryRefresh);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = EngineEvent::DiffPublished {
            path: "src/a.rs".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "diff_published");
        assert_eq!(json["path"], "src/a.rs");
        assert_eq!(event.name(), event_names::DIFF_PUBLISHED);
    }
}
