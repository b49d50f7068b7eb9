// Preload outcomes and lifecycle notifications.

use std::fmt;

/// Why a preload did not reach its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The proxy connection opened but not a single byte arrived.
    EmptyRead,
    /// Connecting, a non-success status, a timeout or a read error.
    Transport,
    /// The stream ended after some bytes but before the target length.
    Incomplete,
}

impl FailureKind {
    /// Small integer code for callers that only log the failure.
    pub fn code(self) -> i32 {
        match self {
            FailureKind::EmptyRead => -1,
            FailureKind::Transport => -2,
            FailureKind::Incomplete => -3,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::EmptyRead => "empty read",
            FailureKind::Transport => "transport error",
            FailureKind::Incomplete => "incomplete read",
        };
        write!(f, "{} ({})", label, self.code())
    }
}

/// Terminal result of a single preload task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadOutcome {
    /// Target reached. `bytes_read` is 0 when the cache already covered it.
    Succeeded { bytes_read: u64 },
    Failed { kind: FailureKind, detail: String },
    Cancelled,
}

impl PreloadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PreloadOutcome::Succeeded { .. })
    }

    /// Failure code, if this outcome is a failure.
    pub fn failure_code(&self) -> Option<i32> {
        match self {
            PreloadOutcome::Failed { kind, .. } => Some(kind.code()),
            _ => None,
        }
    }
}

/// Broadcast to every scheduler subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadEvent {
    Queued { url: String },
    Started { url: String },
    /// Emitted on every cancel call, even for tasks that never ran.
    CancelRequested { url: String },
    /// Exactly once per task, always last.
    Finished { url: String, outcome: PreloadOutcome },
}

impl PreloadEvent {
    pub fn url(&self) -> &str {
        match self {
            PreloadEvent::Queued { url }
            | PreloadEvent::Started { url }
            | PreloadEvent::CancelRequested { url }
            | PreloadEvent::Finished { url, .. } => url,
        }
    }
}
