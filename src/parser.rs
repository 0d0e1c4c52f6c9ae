//! Salvages a structured action from free-form model output.
//!
//! Strategies, in order, until one yields a JSON object:
//!   1. the whole trimmed reply;
//!   2. the content of a fenced code block;
//!   3. balanced `{...}` substrings (one level of nesting), first one that
//!      parses and carries an `action` key;
//!   4. everything between the first `{` and the last `}`.
//!
//! Every failure comes back as `FORMAT_ERROR`; nothing here panics.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::error::{ActionFailure, ErrorTag};
use crate::types::{ActionKind, ActionProposal, truncate_chars};

static FENCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:[A-Za-z]+)?\s*([\s\S]*?)```").expect("valid fence regex")
});

static BALANCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(?:[^{}]|\{[^{}]*\})*\}").expect("valid brace regex")
});

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Find the JSON object in a model reply.
pub fn extract_object(raw: &str) -> Option<Map<String, Value>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(map) = parse_object(text) {
        debug!("Parsed reply as bare JSON");
        return Some(map);
    }

    if text.contains("```") {
        for caps in FENCED.captures_iter(text) {
            if let Some(map) = caps.get(1).and_then(|m| parse_object(m.as_str())) {
                debug!("Parsed reply from fenced block");
                return Some(map);
            }
        }
    }

    for candidate in BALANCED.find_iter(text) {
        if let Some(map) = parse_object(candidate.as_str()) {
            if map.contains_key("action") {
                debug!("Parsed reply from embedded object");
                return Some(map);
            }
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        return parse_object(&text[start..=end]);
    }
    None
}

/// Parse a model reply into a typed proposal.
pub fn extract(raw: &str) -> Result<ActionProposal, ActionFailure> {
    match extract_object(raw) {
        Some(map) => Ok(proposal_from_object(&map)),
        None => {
            warn!("Could not find an action in model reply");
            Err(ActionFailure::new(
                ErrorTag::FormatError,
                format!(
                    "reply was not a JSON action: {}",
                    truncate_chars(raw.trim(), 120)
                ),
            ))
        }
    }
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn id_field(map: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().trim_start_matches('#').parse().ok(),
        _ => None,
    })
}

/// Map a decoded object onto the typed proposal. Objects without a
/// recognized `action` become `wait`.
pub fn proposal_from_object(map: &Map<String, Value>) -> ActionProposal {
    let kind = match map.get("action").and_then(Value::as_str) {
        Some(name) => ActionKind::parse(name).unwrap_or_else(|| {
            warn!("Unrecognized action '{name}', defaulting to wait");
            ActionKind::Wait
        }),
        None => {
            warn!("Reply has no action, defaulting to wait");
            ActionKind::Wait
        }
    };

    let value = match kind {
        ActionKind::Navigate => string_field(map, &["url", "value"]),
        _ => string_field(map, &["value", "text"]),
    };

    ActionProposal {
        thought: string_field(map, &["thought", "reasoning"]).unwrap_or_default(),
        kind,
        target_id: id_field(map, &["targetId", "target_id", "id", "elementId", "element_id"]),
        value,
        visual_label: string_field(map, &["visualLabel", "visual_label"]),
    }
}
