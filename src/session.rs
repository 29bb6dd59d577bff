mod controller;
mod delivery;
mod launcher;
mod multiplexer;
mod workspace;

pub use controller::SessionController;
pub use delivery::{CollectingSink, OutputSink, forward};
pub use launcher::{SandboxProcess, launch};
pub use multiplexer::{ReaderHandles, spawn_readers};
pub use workspace::Workspace;

use serde::Serialize;
use thiserror::Error;

/// Which output stream of the sandboxed program a chunk came from
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamOrigin {
    Stdout,
    Stderr,
}

/// One read from a stream, delivered to the caller exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub bytes: Vec<u8>,
    pub origin: StreamOrigin,
}

/// A decoded run request as handed over by the transport
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub environment_id: String,
    pub source_code: String,
    pub input: Option<Vec<u8>>,
}

impl ExecutionRequest {
    pub fn new(environment_id: impl Into<String>, source_code: impl Into<String>) -> Self {
        Self {
            environment_id: environment_id.into(),
            source_code: source_code.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The live transport failed mid-stream
    Disconnected,
    TimedOut,
    Shutdown,
    /// Cancelled by id through the session tracker
    Requested,
}

/// Final outcome of `run_session`
///
/// A program exiting with a nonzero code is still `Succeeded`: the session
/// did its job and the exit code is part of the result.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Succeeded { exit_code: Option<i32> },
    Failed(SessionError),
    Cancelled { reason: CancelReason },
}

impl SessionStatus {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown environment '{0}'")]
    Configuration(String),
    #[error("workspace error: {0}")]
    Workspace(String),
    #[error("failed to launch sandbox: {0}")]
    Launch(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Stable name of the error kind, used in responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Workspace(_) => "workspace",
            Self::Launch(_) => "launch",
            Self::Transport(_) => "transport",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("output transport failed: {0}")]
pub struct TransportError(pub String);

/// Wire form of a [`SessionStatus`]
#[derive(Serialize, Debug, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StatusReport {
    Succeeded { exit_code: Option<i32> },
    Failed { error: &'static str, message: String },
    Cancelled { reason: CancelReason },
}

impl From<&SessionStatus> for StatusReport {
    fn from(status: &SessionStatus) -> Self {
        match status {
            SessionStatus::Succeeded { exit_code } => Self::Succeeded {
                exit_code: *exit_code,
            },
            SessionStatus::Failed(e) => Self::Failed {
                error: e.kind(),
                message: e.to_string(),
            },
            SessionStatus::Cancelled { reason } => Self::Cancelled { reason: *reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_report_serialization() {
        let succeeded = StatusReport::from(&SessionStatus::Succeeded { exit_code: Some(3) });
        assert_eq!(
            serde_json::to_value(succeeded).unwrap(),
            json!({"state": "succeeded", "exit_code": 3})
        );

        let failed = StatusReport::from(&SessionStatus::Failed(SessionError::Configuration(
            "cobol".to_string(),
        )));
        assert_eq!(
            serde_json::to_value(failed).unwrap(),
            json!({"state": "failed", "error": "configuration", "message": "unknown environment 'cobol'"})
        );

        let cancelled = StatusReport::from(&SessionStatus::Cancelled {
            reason: CancelReason::TimedOut,
        });
        assert_eq!(
            serde_json::to_value(cancelled).unwrap(),
            json!({"state": "cancelled", "reason": "timed_out"})
        );
    }
}
