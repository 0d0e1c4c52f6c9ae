use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ActionFailure, ErrorTag};
use crate::hands::{Page, evaluate_json};
use crate::types::{DISTILL_MAX_CHARS, DISTILL_MAX_CONTENT, DISTILL_MAX_INTERACTIVE, truncate_chars};

/// JavaScript injected into the page to produce a compact summary.
/// NON-DESTRUCTIVE: reads the DOM without modifying it.
///
/// The script:
///   1. Collects interactive elements (links, buttons, form fields, anything
///      with a role, tabindex or click handler) that are rendered.
///   2. Collects headings, paragraphs, list items and spans that are rendered,
///      non-trivial, not too long, and not already seen (exact text).
///   3. Reports the Set-of-Mark ID of interactive elements when the current
///      pass tagged them, so both views share one numbering.
pub const DISTILL_SCRIPT: &str = r#"/* agent:distill */
(() => {
  const interactiveSelectors = [
    'a[href]', 'button', 'input', 'select', 'textarea',
    '[role="button"]', '[role="link"]', '[role="textbox"]',
    '[role="searchbox"]', '[role="checkbox"]', '[role="radio"]',
    '[onclick]', '[tabindex]'
  ];
  const contentSelectors = ['h1', 'h2', 'h3', 'h4', 'h5', 'h6', 'p', 'li', 'span'];

  const interactive = [];
  document.querySelectorAll(interactiveSelectors.join(',')).forEach(el => {
    if (!el.offsetParent && el.tagName !== 'INPUT') return;
    const text = (el.innerText || el.value || el.placeholder || el.title || el.getAttribute('aria-label') || '').trim();
    if (!text && el.tagName !== 'INPUT' && el.tagName !== 'BUTTON') return;
    const role = el.getAttribute('role') || el.tagName.toLowerCase();
    const id = el.getAttribute('data-agent-id');
    interactive.push({
      id: id ? Number(id) : null,
      type: el.getAttribute('type') || role,
      text: text.slice(0, 100)
    });
  });

  const seen = new Set();
  const content = [];
  document.querySelectorAll(contentSelectors.join(',')).forEach(el => {
    if (!el.offsetParent) return;
    if (el.closest('[data-agent-tag], [data-agent-highlight]')) return;
    const text = (el.innerText || '').trim();
    if (text.length < 3 || text.length > 200 || seen.has(text)) return;
    seen.add(text);
    content.push({ tag: el.tagName.toLowerCase(), text: text.slice(0, 150) });
  });

  return JSON.stringify({ interactive, content });
})()"#;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InteractiveItem {
    pub id: Option<u32>,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContentItem {
    pub tag: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DistilledPage {
    #[serde(default)]
    pub interactive: Vec<InteractiveItem>,
    #[serde(default)]
    pub content: Vec<ContentItem>,
}

/// Reduce the live page to a bounded text summary.
///
/// A failing extraction script is reported as an `OBSERVE_ERROR`, never
/// propagated as a driver error.
pub async fn distill(page: &dyn Page, limit: Duration) -> Result<String, ActionFailure> {
    debug!("Distilling page DOM...");
    let distilled: DistilledPage = evaluate_json(page, DISTILL_SCRIPT, limit)
        .await
        .map_err(|e| {
            ActionFailure::new(
                ErrorTag::ObserveError,
                truncate_chars(&format!("distillation failed: {e:#}"), 160),
            )
        })?;

    let text = format_page(&distilled);
    info!(
        "Distilled {} interactive / {} content elements (~{} tokens)",
        distilled.interactive.len(),
        distilled.content.len(),
        text.len() / 4
    );
    Ok(text)
}

fn ellipsize(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", truncate_chars(text, max.saturating_sub(3)))
    } else {
        text.to_string()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Interactive elements first (with their tag ID when they have one), then
/// content, capped by count and by total size.
pub fn format_page(page: &DistilledPage) -> String {
    let mut lines = vec!["=== PAGE ELEMENTS ===".to_string()];

    if !page.interactive.is_empty() {
        lines.push("--- Interactive Elements ---".to_string());
        for item in page.interactive.iter().take(DISTILL_MAX_INTERACTIVE) {
            let text = if item.text.is_empty() {
                "(no text)".to_string()
            } else {
                ellipsize(&item.text, 60)
            };
            let id = match item.id {
                Some(id) => format!("ID: {id}"),
                None => "untagged".to_string(),
            };
            lines.push(format!("[{}] \"{}\" ({})", capitalize(&item.kind), text, id));
        }
        lines.push(String::new());
    }

    if !page.content.is_empty() {
        lines.push("--- Page Content ---".to_string());
        for item in page.content.iter().take(DISTILL_MAX_CONTENT) {
            lines.push(format!(
                "{}: {}",
                item.tag.to_uppercase(),
                ellipsize(&item.text, 80)
            ));
        }
        lines.push(String::new());
    }

    lines.push(format!(
        "Total: {} interactive, {} content elements",
        page.interactive.len(),
        page.content.len()
    ));

    let raw = lines.join("\n");
    if raw.len() > DISTILL_MAX_CHARS {
        format!(
            "{}\n... [truncated, {} total chars]",
            truncate_chars(&raw, DISTILL_MAX_CHARS),
            raw.len()
        )
    } else {
        raw
    }
}
