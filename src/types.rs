use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorTag;
use crate::marks::ElementIndex;

/// The closed set of atomic steps the model may ask the agent to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    PressEnter,
    Navigate,
    ScrollDown,
    ScrollUp,
    Wait,
    Done,
}

impl ActionKind {
    /// Accepts the canonical names plus the spellings models tend to emit
    /// (`pressEnter`, `scroll`, `goto`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        let key = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "click" => Some(Self::Click),
            "type" | "fill" | "type_text" => Some(Self::Type),
            "press_enter" | "pressenter" | "enter" => Some(Self::PressEnter),
            "navigate" | "goto" | "go_to" => Some(Self::Navigate),
            "scroll_down" | "scrolldown" | "scroll" => Some(Self::ScrollDown),
            "scroll_up" | "scrollup" => Some(Self::ScrollUp),
            "wait" => Some(Self::Wait),
            "done" | "finish" => Some(Self::Done),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Type => "type",
            Self::PressEnter => "press_enter",
            Self::Navigate => "navigate",
            Self::ScrollDown => "scroll_down",
            Self::ScrollUp => "scroll_up",
            Self::Wait => "wait",
            Self::Done => "done",
        }
    }

    /// Element actions resolve `targetId` against the current observation.
    pub fn requires_target(self) -> bool {
        matches!(self, Self::Click | Self::Type | Self::PressEnter)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step proposed by the model. Lives for a single iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub thought: String,
    pub kind: ActionKind,
    pub target_id: Option<u32>,
    /// Text to type, or the destination for `navigate`.
    pub value: Option<String>,
    /// Label the model read off the screenshot, when it had one.
    pub visual_label: Option<String>,
}

impl ActionProposal {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            thought: String::new(),
            kind,
            target_id: None,
            value: None,
            visual_label: None,
        }
    }

    pub fn with_target(mut self, id: u32) -> Self {
        self.target_id = Some(id);
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Short description of what the step acts on, used as the history target.
    pub fn target_label(&self) -> String {
        match (self.kind, self.target_id) {
            (ActionKind::Navigate, _) => self
                .navigation_target()
                .unwrap_or_else(|| "(no url)".to_string()),
            (_, Some(id)) => format!("#{id}"),
            (_, None) => "-".to_string(),
        }
    }

    /// Destination of a `navigate` step with a scheme filled in for bare hosts.
    pub fn navigation_target(&self) -> Option<String> {
        let raw = self.value.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        Some(normalize_url(raw))
    }
}

/// `example.com/path` becomes `https://example.com/path`; anything that
/// already names a scheme (`http:`, `javascript:`, `file:`) is left alone.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains("://") || has_opaque_scheme(raw) {
        raw.to_string()
    } else {
        format!("https://{raw}")
    }
}

fn has_opaque_scheme(raw: &str) -> bool {
    let Some((scheme, _)) = raw.split_once(':') else {
        return false;
    };
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        && !scheme.contains('.')
        && scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && !raw[scheme.len() + 1..].chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Metadata read back from a tagged element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub tag: String,
    /// Declared `type` attribute, or the tag name when there is none.
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub name: String,
}

/// What the agent sees at the start of an iteration. Superseded, never mutated.
#[derive(Debug)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub distilled_text: String,
    pub elements: ElementIndex,
}

/// Result of one recorded step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    Success(String),
    /// Executed, but neither the URL nor the page content changed.
    NoEffect(String),
    Failed { tag: ErrorTag, detail: String },
}

impl StepOutcome {
    pub fn tag(&self) -> &'static str {
        match self {
            StepOutcome::Success(_) => "SUCCESS",
            StepOutcome::NoEffect(_) => "NO_EFFECT",
            StepOutcome::Failed {
                tag: ErrorTag::SecurityBlock,
                ..
            } => "BLOCKED",
            StepOutcome::Failed { .. } => "FAILED",
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, StepOutcome::Failed { .. })
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Success(detail) | StepOutcome::NoEffect(detail) => {
                write!(f, "{}: {}", self.tag(), detail)
            }
            StepOutcome::Failed { tag, detail } => {
                write!(f, "{} [{}]: {}", self.tag(), tag, detail)
            }
        }
    }
}

/// One line of the agent's memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: u32,
    /// Action name, or the phase (`observe`, `think`) that failed before one existed.
    pub action: String,
    pub target: String,
    pub outcome: StepOutcome,
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Step {}: {} {} -> {}",
            self.step, self.action, self.target, self.outcome
        )
    }
}

/// A message in the conversation sent to the completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

pub const MAX_HISTORY: usize = 5;
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;
pub const ELEMENT_TEXT_MAX_CHARS: usize = 100;
pub const ELEMENT_LISTING_TEXT_CHARS: usize = 50;
pub const ELEMENT_LISTING_MAX_CHARS: usize = 4000;
pub const DISTILL_MAX_INTERACTIVE: usize = 100;
pub const DISTILL_MAX_CONTENT: usize = 50;
pub const DISTILL_MAX_CHARS: usize = 6000;
pub const FINGERPRINT_TEXT_CHARS: usize = 3000;
pub const FINGERPRINT_HASH_CHARS: usize = 16;
