use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why a step did not go as planned. Every tag is recoverable; the loop
/// records it and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorTag {
    FormatError,
    ObserveError,
    LlmError,
    Timeout,
    Obscured,
    Invisible,
    Detached,
    NotEditable,
    NavigationError,
    TargetNotFound,
    ActionError,
    SecurityBlock,
    ApprovalDenied,
    DeceptiveUi,
}

impl ErrorTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorTag::FormatError => "FORMAT_ERROR",
            ErrorTag::ObserveError => "OBSERVE_ERROR",
            ErrorTag::LlmError => "LLM_ERROR",
            ErrorTag::Timeout => "TIMEOUT",
            ErrorTag::Obscured => "OBSCURED",
            ErrorTag::Invisible => "INVISIBLE",
            ErrorTag::Detached => "DETACHED",
            ErrorTag::NotEditable => "NOT_EDITABLE",
            ErrorTag::NavigationError => "NAVIGATION_ERROR",
            ErrorTag::TargetNotFound => "TARGET_NOT_FOUND",
            ErrorTag::ActionError => "ACTION_ERROR",
            ErrorTag::SecurityBlock => "SECURITY_BLOCK",
            ErrorTag::ApprovalDenied => "APPROVAL_DENIED",
            ErrorTag::DeceptiveUi => "DECEPTIVE_UI",
        }
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged, recoverable failure from one of the loop's suspend points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{tag}: {detail}")]
pub struct ActionFailure {
    pub tag: ErrorTag,
    pub detail: String,
}

impl ActionFailure {
    pub fn new(tag: ErrorTag, detail: impl Into<String>) -> Self {
        Self {
            tag,
            detail: detail.into(),
        }
    }
}

/// Run-level failures. These end the run (after teardown).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("browser failed to start: {0:#}")]
    BrowserStart(anyhow::Error),

    #[error("completion endpoint unreachable: {0}")]
    LlmUnreachable(String),

    #[error("run interrupted")]
    Interrupted,
}
