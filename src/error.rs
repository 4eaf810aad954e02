use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Failure taxonomy for the orchestration engine.
///
/// Best-effort paths (merge, prepare, summary, file-type detection) catch
/// `Transport`, `Status`, `Parse` and `Timeout` locally and fall back. The
/// primary chat stream and `DiffBus::accept` surface them to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error talking to {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("could not confidently resolve a target file: {0}")]
    ResolutionAmbiguity(String),

    #[error("failed to write {path}: {message}")]
    WriteConflict { path: String, message: String },

    #[error("tool `{name}` failed: {message}")]
    ToolExecution { name: String, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request was cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no pending diff for {0}")]
    NoPendingDiff(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn transport(endpoint: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Errors a best-effort caller is expected to swallow and replace with a
    /// deterministic fallback.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Status { .. } | Self::Parse(_) | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        Self::Parse(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(EngineError::transport("http://localhost", "refused").is_recoverable());
        assert!(EngineError::Parse("bad frame".to_string()).is_recoverable());
        assert!(EngineError::Timeout(Duration::from_secs(1)).is_recoverable());
        assert!(!EngineError::Cancelled.is_recoverable());
        assert!(!EngineError::WriteConflict {
            path: "a.rs".to_string(),
            message: "denied".to_string()
        }
        .is_recoverable());
    }

    #[test]
    fn test_display_includes_status() {
        let err = EngineError::Status {
            endpoint: "http://localhost:8080".to_string(),
            status: 503,
            body: "overloaded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "http://localhost:8080 returned HTTP 503: overloaded"
        );
    }
}
