//! Set-of-Mark tagging.
//!
//! Each observation pass numbers the visible, reachable interactive elements
//! `1..=n` in DOM order, stamps the number on the element as
//! `data-agent-id`, and overlays a small badge bearing it. The resulting
//! [`ElementIndex`] is the only way the rest of the agent refers to
//! elements, and it is thrown away at the end of the iteration.
//!
//! Tagging is split in two round trips: the page reports geometry and a
//! center-point hit test for every candidate, the selection happens here,
//! and the chosen candidates are then stamped.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ActionFailure, ErrorTag};
use crate::hands::{Page, evaluate_json, evaluate_within};
use crate::types::{ELEMENT_LISTING_MAX_CHARS, ELEMENT_LISTING_TEXT_CHARS, ELEMENT_TEXT_MAX_CHARS};
use crate::types::{ElementInfo, truncate_chars};

/// Elements smaller than this (in CSS pixels) are treated as invisible.
pub const MIN_ELEMENT_SIZE: f64 = 5.0;

pub const ID_ATTRIBUTE: &str = "data-agent-id";

/// Clears the previous pass, then reports every candidate with its geometry
/// and what sits on top of its center point.
pub const COLLECT_SCRIPT: &str = r#"/* agent:collect */
(() => {
  document.querySelectorAll('[data-agent-tag], [data-agent-highlight]').forEach(t => t.remove());
  document.querySelectorAll('[data-agent-id]').forEach(e => e.removeAttribute('data-agent-id'));
  document.querySelectorAll('[data-agent-candidate]').forEach(e => e.removeAttribute('data-agent-candidate'));

  const selectors = [
    'a[href]',
    'button:not([disabled])',
    'input:not([type="hidden"]):not([disabled])',
    'textarea:not([disabled])',
    'select:not([disabled])',
    '[onclick]',
    '[role="button"]',
    '[role="link"]',
    '[role="textbox"]',
    '[role="searchbox"]',
    '[tabindex]:not([tabindex="-1"])'
  ];

  const candidates = [];
  document.querySelectorAll(selectors.join(',')).forEach((el, index) => {
    el.setAttribute('data-agent-candidate', String(index));
    const style = window.getComputedStyle(el);
    const rect = el.getBoundingClientRect();
    const top = document.elementFromPoint(rect.left + rect.width / 2, rect.top + rect.height / 2);
    let hit = 'none';
    if (top === el) hit = 'self';
    else if (top && el.contains(top)) hit = 'descendant';
    else if (top && top.contains(el)) hit = 'ancestor';
    else if (top) hit = 'other';
    candidates.push({
      index,
      hidden: style.display === 'none' || style.visibility === 'hidden' || style.opacity === '0',
      left: rect.left, top: rect.top, right: rect.right, bottom: rect.bottom,
      width: rect.width, height: rect.height,
      hit
    });
  });

  return JSON.stringify({
    viewportWidth: window.innerWidth,
    viewportHeight: window.innerHeight,
    candidates
  });
})()"#;

/// Body of the stamping script. Expects `chosen` (candidate indices in ID order).
const STAMP_BODY: &str = r#"
  let id = 0;
  chosen.forEach(index => {
    const el = document.querySelector('[data-agent-candidate="' + index + '"]');
    if (!el) return;
    id += 1;
    el.setAttribute('data-agent-id', String(id));
    const rect = el.getBoundingClientRect();
    const badge = document.createElement('div');
    badge.setAttribute('data-agent-tag', 'true');
    badge.style.cssText = [
      'position: fixed', 'left: ' + rect.left + 'px', 'top: ' + rect.top + 'px',
      'min-width: 18px', 'height: 16px', 'padding: 0 2px',
      'background-color: #FF0000', 'color: #FFFFFF', 'border: 1px solid #FFFFFF',
      'border-radius: 3px', 'font: bold 11px Arial, sans-serif',
      'display: flex', 'align-items: center', 'justify-content: center',
      'z-index: 2147483646', 'pointer-events: none'
    ].join(';');
    badge.textContent = String(id);
    document.body.appendChild(badge);
  });
  document.querySelectorAll('[data-agent-candidate]').forEach(e => e.removeAttribute('data-agent-candidate'));
  return id;
"#;

/// Reads back one record per tagged element.
pub const READ_SCRIPT: &str = r#"/* agent:read */
(() => JSON.stringify(Array.from(document.querySelectorAll('[data-agent-id]')).map(el => ({
  id: Number(el.getAttribute('data-agent-id')),
  tag: el.tagName.toLowerCase(),
  type: el.getAttribute('type') || el.tagName.toLowerCase(),
  text: (el.innerText || el.value || el.placeholder || el.getAttribute('aria-label') || el.title || '').trim().slice(0, 100),
  href: el.getAttribute('href') || '',
  name: el.getAttribute('name') || ''
}))))()"#;

pub const CLEANUP_SCRIPT: &str = r#"/* agent:cleanup */
(() => {
  document.querySelectorAll('[data-agent-tag], [data-agent-highlight]').forEach(el => el.remove());
  document.querySelectorAll('[data-agent-id]').forEach(el => el.removeAttribute('data-agent-id'));
  document.querySelectorAll('[data-agent-candidate]').forEach(el => el.removeAttribute('data-agent-candidate'));
  return true;
})()"#;

const HIGHLIGHT_BODY: &str = r#"
  document.querySelectorAll('[data-agent-highlight]').forEach(h => h.remove());
  const el = document.querySelector(selector);
  if (!el) return false;
  const rect = el.getBoundingClientRect();
  const box = document.createElement('div');
  box.setAttribute('data-agent-highlight', 'true');
  box.style.cssText = [
    'position: fixed', 'left: ' + (rect.left - 3) + 'px', 'top: ' + (rect.top - 3) + 'px',
    'width: ' + (rect.width + 6) + 'px', 'height: ' + (rect.height + 6) + 'px',
    'border: 3px solid #FF0000', 'border-radius: 4px', 'background: rgba(255, 0, 0, 0.1)',
    'z-index: 2147483645', 'pointer-events: none'
  ].join(';');
  document.body.appendChild(box);
  setTimeout(() => box.remove(), 2000);
  return true;
"#;

/// What occupies a candidate's center point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitTest {
    #[serde(rename = "self")]
    Itself,
    Descendant,
    Ancestor,
    Other,
    None,
}

impl HitTest {
    /// A click at the center would land on the candidate itself.
    pub fn reaches_candidate(self) -> bool {
        matches!(self, HitTest::Itself | HitTest::Descendant | HitTest::Ancestor)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Candidate {
    pub index: usize,
    pub hidden: bool,
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub width: f64,
    pub height: f64,
    pub hit: HitTest,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSnapshot {
    pub viewport_width: f64,
    pub viewport_height: f64,
    pub candidates: Vec<Candidate>,
}

impl Candidate {
    fn rendered(&self) -> bool {
        !self.hidden && self.width > MIN_ELEMENT_SIZE && self.height > MIN_ELEMENT_SIZE
    }

    fn in_viewport(&self, width: f64, height: f64) -> bool {
        self.top < height && self.bottom > 0.0 && self.left < width && self.right > 0.0
    }
}

/// Candidates that are rendered, on screen, and not covered, in DOM order.
/// Position `i` of the result receives ID `i + 1`.
pub fn select_taggable(snapshot: &CandidateSnapshot) -> Vec<usize> {
    let mut chosen: Vec<&Candidate> = snapshot
        .candidates
        .iter()
        .filter(|c| c.rendered())
        .filter(|c| c.in_viewport(snapshot.viewport_width, snapshot.viewport_height))
        .filter(|c| {
            let reachable = c.hit.reaches_candidate();
            if !reachable {
                debug!(candidate = c.index, "Skipping covered element");
            }
            reachable
        })
        .collect();
    chosen.sort_by_key(|c| c.index);
    chosen.into_iter().map(|c| c.index).collect()
}

fn stamp_script(chosen: &[usize]) -> String {
    let ids = serde_json::to_string(chosen).unwrap_or_else(|_| "[]".to_string());
    format!("/* agent:stamp */\n(() => {{\n  const chosen = {ids};\n{STAMP_BODY}}})()")
}

/// Selector that locates a tagged element during the current pass.
pub fn selector_for(id: u32) -> String {
    format!("[{ID_ATTRIBUTE}=\"{id}\"]")
}

/// One tagged element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRecord {
    pub id: u32,
    pub info: ElementInfo,
}

impl ElementRecord {
    /// Handle into the live page. Only meaningful within the pass that tagged it.
    pub fn selector(&self) -> String {
        selector_for(self.id)
    }

    fn listing_line(&self) -> String {
        let text = truncate_chars(&self.info.text, ELEMENT_LISTING_TEXT_CHARS);
        if text.is_empty() {
            format!("[{}] {}", self.id, self.info.kind)
        } else {
            format!("[{}] {}: \"{}\"", self.id, self.info.kind, text)
        }
    }
}

/// Per-iteration arena of tagged elements, keyed by ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementIndex {
    records: BTreeMap<u32, ElementRecord>,
}

impl ElementIndex {
    pub fn from_records(records: impl IntoIterator<Item = ElementRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub fn get(&self, id: u32) -> Option<&ElementRecord> {
        self.records.get(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ElementRecord> {
        self.records.values()
    }

    /// `[id] type: "text"`, one element per line, bounded in size.
    pub fn listing(&self) -> String {
        if self.records.is_empty() {
            return "(no interactive elements visible)".to_string();
        }
        let mut out = String::new();
        for record in self.records.values() {
            let line = record.listing_line();
            if out.len() + line.len() + 1 > ELEMENT_LISTING_MAX_CHARS {
                out.push_str(&format!(
                    "... [{} more elements not shown]",
                    self.records.range(record.id..).count()
                ));
                break;
            }
            out.push_str(&line);
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

#[derive(Debug, Deserialize)]
struct RawElement {
    id: u32,
    #[serde(flatten)]
    info: ElementInfo,
}

fn observe_error(stage: &str, err: anyhow::Error) -> ActionFailure {
    let detail = truncate_chars(&format!("{stage}: {err:#}"), 160);
    ActionFailure::new(ErrorTag::ObserveError, detail)
}

/// Tag the page. Returns the number of elements that received an ID.
pub async fn tag(page: &dyn Page, limit: Duration) -> Result<usize, ActionFailure> {
    debug!("Injecting Set-of-Mark tags...");

    let snapshot: CandidateSnapshot = evaluate_json(page, COLLECT_SCRIPT, limit)
        .await
        .map_err(|e| observe_error("candidate scan failed", e))?;

    let chosen = select_taggable(&snapshot);
    let stamped = evaluate_within(page, &stamp_script(&chosen), limit)
        .await
        .map_err(|e| observe_error("tagging failed", e))?;

    let count = stamped.as_u64().map(|n| n as usize).unwrap_or(chosen.len());
    info!(
        "Tagged {count} of {} interactive elements (overlap-filtered)",
        snapshot.candidates.len()
    );
    Ok(count)
}

/// Read back the tagged elements of the current pass.
pub async fn observe(page: &dyn Page, limit: Duration) -> Result<ElementIndex, ActionFailure> {
    let raw: Vec<RawElement> = evaluate_json(page, READ_SCRIPT, limit)
        .await
        .map_err(|e| observe_error("element read-back failed", e))?;

    let records = raw.into_iter().filter(|r| r.id > 0).map(|r| {
        let mut info = r.info;
        info.text = truncate_chars(info.text.trim(), ELEMENT_TEXT_MAX_CHARS);
        ElementRecord { id: r.id, info }
    });
    let index = ElementIndex::from_records(records);
    debug!("Extracted {} elements", index.len());
    Ok(index)
}

/// Remove tags and overlays. Never fails; a page that has gone away has
/// nothing left to clean.
pub async fn cleanup(page: &dyn Page, limit: Duration) {
    if let Err(e) = evaluate_within(page, CLEANUP_SCRIPT, limit).await {
        warn!("Tag cleanup failed: {e:#}");
    }
}

/// Draw a red box around an element before acting on it.
pub async fn highlight(page: &dyn Page, id: u32, limit: Duration) -> bool {
    let selector = serde_json::to_string(&selector_for(id)).unwrap_or_default();
    let script = format!(
        "/* agent:highlight */\n(() => {{\n  const selector = {selector};\n{HIGHLIGHT_BODY}}})()"
    );
    match evaluate_within(page, &script, limit).await {
        Ok(value) if value.as_bool() == Some(true) => {
            debug!("Highlighted element #{id}");
            tokio::time::sleep(Duration::from_millis(300)).await;
            true
        }
        Ok(_) => false,
        Err(e) => {
            warn!("Highlight failed: {e:#}");
            false
        }
    }
}
