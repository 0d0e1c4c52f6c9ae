use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ActionFailure, ErrorTag};
use crate::hands::{Page, evaluate_json, evaluate_within};
use crate::marks::{self, ElementIndex};
use crate::types::{ActionKind, ActionProposal, FINGERPRINT_HASH_CHARS, FINGERPRINT_TEXT_CHARS};
use crate::types::truncate_chars;

/// Bounds on every browser interaction.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// click / fill / press on an element.
    pub action: Duration,
    pub navigation: Duration,
    /// How long to wait for network quiet before falling back.
    pub idle: Duration,
    /// Fixed delay used when the page never went quiet.
    pub settle_fallback: Duration,
    pub scroll_pause: Duration,
    /// Any script injected into the page.
    pub script: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            action: Duration::from_secs(5),
            navigation: Duration::from_secs(15),
            idle: Duration::from_secs(3),
            settle_fallback: Duration::from_millis(500),
            scroll_pause: Duration::from_millis(300),
            script: Duration::from_secs(10),
        }
    }
}

pub const SCROLL_STEP_PX: i32 = 500;

/// Map a driver error onto the executor's failure vocabulary.
pub fn classify(err: &anyhow::Error) -> Option<ErrorTag> {
    let message = format!("{err:#}").to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if has(&["navigation timeout", "net::err", "navigation failed"]) {
        Some(ErrorTag::NavigationError)
    } else if has(&["obscured", "intercept"]) {
        Some(ErrorTag::Obscured)
    } else if has(&["not visible", "no box model", "zero size"]) {
        Some(ErrorTag::Invisible)
    } else if has(&["detached", "no node with given id", "could not find node"]) {
        Some(ErrorTag::Detached)
    } else if has(&["not editable", "readonly", "read-only", "disabled"]) {
        Some(ErrorTag::NotEditable)
    } else if has(&["timeout", "timed out", "never came"]) {
        Some(ErrorTag::Timeout)
    } else {
        None
    }
}

fn short(err: &anyhow::Error) -> String {
    truncate_chars(&format!("{err:#}"), 80)
}

/// Runs a typed proposal against the live page.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    timeouts: Timeouts,
    highlight: bool,
}

impl Executor {
    pub fn new(timeouts: Timeouts, highlight: bool) -> Self {
        Self {
            timeouts,
            highlight,
        }
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Execute one step. The `Ok` value describes what was done.
    pub async fn execute(
        &self,
        page: &dyn Page,
        proposal: &ActionProposal,
        index: &ElementIndex,
    ) -> Result<String, ActionFailure> {
        if !proposal.kind.requires_target() {
            return self.page_action(page, proposal).await;
        }

        let id = proposal
            .target_id
            .ok_or_else(|| ActionFailure::new(ErrorTag::TargetNotFound, "No targetId provided"))?;
        let record = index.get(id).ok_or_else(|| {
            ActionFailure::new(ErrorTag::TargetNotFound, format!("Element #{id} not found"))
        })?;
        let selector = record.selector();

        if self.highlight {
            marks::highlight(page, id, self.timeouts.script).await;
        }

        match proposal.kind {
            ActionKind::Click => {
                info!("Clicking element #{id}");
                self.bounded(page.click(&selector, self.timeouts.action), id, "not clickable")
                    .await?;
                self.settle(page).await;
                Ok(format!("Clicked #{id}"))
            }
            ActionKind::Type => {
                let text = proposal.value.as_deref().unwrap_or_default();
                info!("Typing into element #{id}");
                self.bounded(page.fill(&selector, text, self.timeouts.action), id, "not ready")
                    .await?;
                Ok(format!("Typed '{}' into #{id}", truncate_chars(text, 20)))
            }
            _ => {
                info!("Pressing Enter on element #{id}");
                self.bounded(
                    page.press(&selector, "Enter", self.timeouts.action),
                    id,
                    "did not accept Enter",
                )
                .await?;
                self.settle(page).await;
                Ok(format!("Pressed Enter on #{id}"))
            }
        }
    }

    /// Run an element primitive under the action timeout and classify failures.
    async fn bounded<F>(&self, op: F, id: u32, timeout_detail: &str) -> Result<(), ActionFailure>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let limit = self.timeouts.action + Duration::from_secs(1);
        match tokio::time::timeout(limit, op).await {
            Err(_) => Err(ActionFailure::new(
                ErrorTag::Timeout,
                format!("#{id} {timeout_detail}"),
            )),
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(match classify(&e) {
                Some(ErrorTag::Timeout) => {
                    ActionFailure::new(ErrorTag::Timeout, format!("#{id} {timeout_detail}"))
                }
                Some(ErrorTag::Obscured) => ActionFailure::new(
                    ErrorTag::Obscured,
                    format!("#{id} is covered by another element"),
                ),
                Some(ErrorTag::Invisible) => {
                    ActionFailure::new(ErrorTag::Invisible, format!("#{id} not visible"))
                }
                Some(ErrorTag::Detached) => {
                    ActionFailure::new(ErrorTag::Detached, format!("#{id} was removed"))
                }
                Some(ErrorTag::NotEditable) => {
                    ActionFailure::new(ErrorTag::NotEditable, format!("#{id} is not editable"))
                }
                _ => ActionFailure::new(ErrorTag::ActionError, format!("#{id}: {}", short(&e))),
            }),
        }
    }

    async fn navigate(&self, page: &dyn Page, url: &str) -> Result<String, ActionFailure> {
        info!("Navigating to {url}");
        let limit = self.timeouts.navigation + Duration::from_secs(1);
        match tokio::time::timeout(limit, page.goto(url, self.timeouts.navigation)).await {
            Err(_) => Err(ActionFailure::new(
                ErrorTag::Timeout,
                format!("{url} took too long"),
            )),
            Ok(Err(e)) => Err(match classify(&e) {
                Some(ErrorTag::Timeout) => {
                    ActionFailure::new(ErrorTag::Timeout, format!("{url} took too long"))
                }
                _ => ActionFailure::new(ErrorTag::NavigationError, short(&e)),
            }),
            Ok(Ok(())) => {
                self.settle(page).await;
                Ok(format!("Navigated to {url}"))
            }
        }
    }

    /// Actions that act on the page as a whole rather than a tagged element.
    async fn page_action(
        &self,
        page: &dyn Page,
        proposal: &ActionProposal,
    ) -> Result<String, ActionFailure> {
        match proposal.kind {
            ActionKind::Navigate => {
                let url = proposal.navigation_target().ok_or_else(|| {
                    ActionFailure::new(ErrorTag::NavigationError, "No URL provided")
                })?;
                self.navigate(page, &url).await
            }
            ActionKind::ScrollDown => self.scroll(page, SCROLL_STEP_PX).await,
            ActionKind::ScrollUp => self.scroll(page, -SCROLL_STEP_PX).await,
            ActionKind::Wait => Ok(self.settle(page).await),
            ActionKind::Done => Ok("GOAL_COMPLETE".to_string()),
            kind => Err(ActionFailure::new(
                ErrorTag::TargetNotFound,
                format!("{kind} needs a targetId"),
            )),
        }
    }

    async fn scroll(&self, page: &dyn Page, amount: i32) -> Result<String, ActionFailure> {
        let direction = if amount > 0 { "down" } else { "up" };
        evaluate_within(page, &format!("window.scrollBy(0, {amount})"), self.timeouts.script)
            .await
            .map_err(|e| {
                let tag = match classify(&e) {
                    Some(ErrorTag::Timeout) => ErrorTag::Timeout,
                    _ => ErrorTag::ActionError,
                };
                ActionFailure::new(tag, format!("scroll: {}", short(&e)))
            })?;
        tokio::time::sleep(self.timeouts.scroll_pause).await;
        Ok(format!("Scrolled {direction}"))
    }

    /// Wait for the page to go quiet; fall back to a short fixed delay.
    pub async fn settle(&self, page: &dyn Page) -> String {
        let limit = self.timeouts.idle + Duration::from_millis(500);
        match tokio::time::timeout(limit, page.wait_for_network_idle(self.timeouts.idle)).await {
            Ok(Ok(())) => "Page stable".to_string(),
            Ok(Err(e)) => {
                debug!("Idle wait gave up: {e:#}");
                tokio::time::sleep(self.timeouts.settle_fallback).await;
                "Waited (timeout fallback)".to_string()
            }
            Err(_) => {
                tokio::time::sleep(self.timeouts.settle_fallback).await;
                "Waited (timeout fallback)".to_string()
            }
        }
    }
}

/// Visible page text, scroll offset and form values.
pub const FINGERPRINT_SCRIPT: &str = r#"/* agent:fingerprint */
(() => JSON.stringify({
  text: ((document.body && document.body.innerText) || '').slice(0, 3000),
  scroll: Math.round(window.scrollY || 0),
  fields: Array.from(document.querySelectorAll('input, textarea, select')).map(e => e.value || '').join('\u0001')
}))()"#;

#[derive(Debug, Deserialize)]
struct FingerprintProbe {
    text: String,
    #[serde(default)]
    scroll: i64,
    #[serde(default)]
    fields: String,
}

/// Cheap identity of the page state, compared before and after an action.
///
/// The scroll offset is kept apart from the content hash so that a click
/// whose only effect is to move the viewport is not mistaken for progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFingerprint {
    pub url: String,
    pub content_hash: String,
    pub scroll: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageChange {
    Unchanged,
    UrlChanged,
    ContentChanged,
    /// Same URL and content; only the scroll offset moved.
    Scrolled,
}

impl PageChange {
    /// Whether this change counts as an effect of `kind`. Scrolling only
    /// counts for the scroll actions themselves.
    pub fn is_effect_of(self, kind: ActionKind) -> bool {
        match self {
            PageChange::Unchanged => false,
            PageChange::UrlChanged | PageChange::ContentChanged => true,
            PageChange::Scrolled => matches!(kind, ActionKind::ScrollDown | ActionKind::ScrollUp),
        }
    }
}

impl PageFingerprint {
    /// Fingerprint from a URL and the page's visible text.
    pub fn from_parts(url: &str, text: &str) -> Self {
        Self::digest(url, text, "", 0)
    }

    fn digest(url: &str, text: &str, extra: &str, scroll: i64) -> Self {
        let text = truncate_chars(text, FINGERPRINT_TEXT_CHARS);
        let digest = Sha256::digest(format!("{url}:{text}\u{1}{extra}").as_bytes());
        let mut content_hash = hex::encode(digest);
        content_hash.truncate(FINGERPRINT_HASH_CHARS);
        Self {
            url: url.to_string(),
            content_hash,
            scroll,
        }
    }

    /// Read the fingerprint of the live page. Failures yield an empty hash.
    pub async fn capture(page: &dyn Page, limit: Duration) -> Self {
        let url = page.url().await.unwrap_or_default();
        match evaluate_json::<FingerprintProbe>(page, FINGERPRINT_SCRIPT, limit).await {
            Ok(probe) => Self::digest(&url, &probe.text, &probe.fields, probe.scroll),
            Err(e) => {
                debug!("Fingerprint failed: {e:#}");
                Self {
                    url,
                    content_hash: String::new(),
                    scroll: 0,
                }
            }
        }
    }

    pub fn compare(&self, after: &PageFingerprint) -> PageChange {
        if self.url != after.url {
            PageChange::UrlChanged
        } else if self.content_hash != after.content_hash {
            PageChange::ContentChanged
        } else if self.scroll != after.scroll {
            PageChange::Scrolled
        } else {
            PageChange::Unchanged
        }
    }
}
