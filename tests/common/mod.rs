#![allow(dead_code)]

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use iron_gate_browser::executor::Timeouts;
use iron_gate_browser::types::{ChatMessage, ElementInfo};
use iron_gate_browser::{
    Agent, AgentSettings, ApprovalRequest, Approver, Browser, Completion, CompletionError, Page,
    RiskEngine, SecurityPolicy,
};

/// What clicking an element does to the fake page.
#[derive(Debug, Clone, Default)]
pub enum Effect {
    #[default]
    Nothing,
    Navigate(String),
    SetText(String),
    /// Moves the viewport and nothing else.
    Scroll(i64),
}

#[derive(Debug, Clone, Default)]
pub struct FakeElement {
    pub info: ElementInfo,
    pub covered: bool,
    pub on_click: Effect,
    pub click_error: Option<String>,
}

impl FakeElement {
    fn new(tag: &str, kind: &str, text: &str) -> Self {
        Self {
            info: ElementInfo {
                tag: tag.into(),
                kind: kind.into(),
                text: text.into(),
                href: String::new(),
                name: String::new(),
            },
            ..Default::default()
        }
    }

    pub fn link(text: &str, href: &str) -> Self {
        let mut element = Self::new("a", "a", text);
        element.info.href = href.into();
        element
    }

    pub fn button(text: &str) -> Self {
        Self::new("button", "button", text)
    }

    pub fn input(kind: &str, name: &str) -> Self {
        let mut element = Self::new("input", kind, "");
        element.info.name = name.into();
        element
    }

    /// Something opaque sits on top of its center point.
    pub fn covered(mut self) -> Self {
        self.covered = true;
        self
    }

    pub fn on_click(mut self, effect: Effect) -> Self {
        self.on_click = effect;
        self
    }

    pub fn failing_click(mut self, message: &str) -> Self {
        self.click_error = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Site {
    pub title: String,
    pub text: String,
    pub elements: Vec<FakeElement>,
}

impl Site {
    pub fn new(title: &str, text: &str, elements: Vec<FakeElement>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            elements,
        }
    }
}

#[derive(Default)]
struct PageState {
    sites: HashMap<String, Site>,
    url: String,
    scroll: i64,
    fields: BTreeMap<usize, String>,
    /// Element indexes stamped in the current pass; position + 1 is the ID.
    tagged: Vec<usize>,
    calls: Vec<String>,
    failing_observations: u32,
    failing_distills: u32,
    failing_cleanups: u32,
    stalled_distills: u32,
    cleanups: usize,
}

impl PageState {
    fn site(&self) -> Site {
        self.sites.get(&self.url).cloned().unwrap_or_default()
    }

    fn element_for(&self, selector: &str) -> Result<(u32, usize)> {
        let id: u32 = selector
            .trim_start_matches("[data-agent-id=\"")
            .trim_end_matches("\"]")
            .parse()
            .map_err(|_| anyhow!("unexpected selector {selector}"))?;
        let index = *(id as usize)
            .checked_sub(1)
            .and_then(|pos| self.tagged.get(pos))
            .ok_or_else(|| anyhow!("element {selector} is detached from the DOM"))?;
        Ok((id, index))
    }
}

/// In-memory page that answers the agent's scripts by their marker comment.
#[derive(Default)]
pub struct FakePage {
    state: Mutex<PageState>,
}

impl FakePage {
    pub fn new() -> Self {
        let page = Self::default();
        page.state.lock().unwrap().url = "about:blank".into();
        page
    }

    pub fn with_site(self, url: &str, site: Site) -> Self {
        self.state.lock().unwrap().sites.insert(url.into(), site);
        self
    }

    /// The next `count` tagging passes fail inside the page.
    pub fn fail_observations(self, count: u32) -> Self {
        self.state.lock().unwrap().failing_observations = count;
        self
    }

    /// The next `count` distillation passes fail inside the page.
    pub fn fail_distills(self, count: u32) -> Self {
        self.state.lock().unwrap().failing_distills = count;
        self
    }

    /// The next `count` distillation passes never answer, like a page stuck
    /// on a modal dialog.
    pub fn stall_distills(self, count: u32) -> Self {
        self.state.lock().unwrap().stalled_distills = count;
        self
    }

    /// Every tag cleanup fails, as if the page had gone away.
    pub fn fail_cleanups(self) -> Self {
        self.state.lock().unwrap().failing_cleanups = u32::MAX;
        self
    }

    pub fn scroll(&self) -> i64 {
        self.state.lock().unwrap().scroll
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn current_url(&self) -> String {
        self.state.lock().unwrap().url.clone()
    }

    pub fn cleanups(&self) -> usize {
        self.state.lock().unwrap().cleanups
    }

    pub fn tagged_count(&self) -> usize {
        self.state.lock().unwrap().tagged.len()
    }

    fn script(&self, script: &str) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        let site = state.site();

        if script.starts_with("/* agent:collect */") {
            if state.failing_observations > 0 {
                state.failing_observations -= 1;
                bail!("Execution context was destroyed");
            }
            state.tagged.clear();
            let candidates: Vec<Value> = site
                .elements
                .iter()
                .enumerate()
                .map(|(i, e)| {
                    let top = 10.0 + 40.0 * i as f64;
                    json!({
                        "index": i, "hidden": false,
                        "left": 10.0, "top": top, "right": 210.0, "bottom": top + 30.0,
                        "width": 200.0, "height": 30.0,
                        "hit": if e.covered { "other" } else { "self" },
                    })
                })
                .collect();
            let snapshot = json!({
                "viewportWidth": 1280.0,
                "viewportHeight": 2000.0,
                "candidates": candidates,
            });
            return Ok(Value::String(snapshot.to_string()));
        }

        if script.starts_with("/* agent:stamp */") {
            let list = script
                .split("const chosen = ")
                .nth(1)
                .and_then(|rest| rest.split(';').next())
                .ok_or_else(|| anyhow!("stamp script without a chosen list"))?;
            state.tagged = serde_json::from_str(list)?;
            return Ok(json!(state.tagged.len()));
        }

        if script.starts_with("/* agent:read */") {
            let records: Vec<Value> = state
                .tagged
                .iter()
                .enumerate()
                .map(|(pos, &index)| {
                    let info = &site.elements[index].info;
                    json!({
                        "id": pos + 1, "tag": info.tag, "type": info.kind,
                        "text": info.text, "href": info.href, "name": info.name,
                    })
                })
                .collect();
            return Ok(Value::String(Value::Array(records).to_string()));
        }

        if script.starts_with("/* agent:distill */") {
            if state.failing_distills > 0 {
                state.failing_distills -= 1;
                bail!("Cannot read properties of null (reading 'innerText')");
            }
            let interactive: Vec<Value> = site
                .elements
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.covered)
                .map(|(i, e)| {
                    let id = state.tagged.iter().position(|&t| t == i).map(|p| p + 1);
                    json!({"id": id, "type": e.info.kind, "text": e.info.text})
                })
                .collect();
            let content: Vec<Value> = if site.text.len() >= 3 {
                vec![json!({"tag": "p", "text": site.text})]
            } else {
                vec![]
            };
            let distilled = json!({"interactive": interactive, "content": content});
            return Ok(Value::String(distilled.to_string()));
        }

        if script.starts_with("/* agent:fingerprint */") {
            let fields: Vec<&str> = state.fields.values().map(String::as_str).collect();
            let probe = json!({
                "text": site.text,
                "scroll": state.scroll,
                "fields": fields.join("\u{1}"),
            });
            return Ok(Value::String(probe.to_string()));
        }

        if script.starts_with("/* agent:cleanup */") {
            if state.failing_cleanups > 0 {
                state.failing_cleanups -= 1;
                bail!("Target closed");
            }
            state.tagged.clear();
            state.cleanups += 1;
            return Ok(json!(true));
        }

        if script.starts_with("/* agent:highlight */") {
            return Ok(json!(true));
        }

        if let Some(rest) = script.strip_prefix("window.scrollBy(0, ") {
            let amount: i64 = rest.trim_end_matches(')').trim().parse()?;
            state.scroll = (state.scroll + amount).max(0);
            state.calls.push(format!("scroll {amount}"));
            return Ok(Value::Null);
        }

        Ok(Value::Null)
    }
}

#[async_trait]
impl Page for FakePage {
    async fn goto(&self, url: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("goto {url}"));
        state.url = url.to_string();
        state.scroll = 0;
        state.fields.clear();
        state.tagged.clear();
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let stall = script.starts_with("/* agent:distill */") && {
            let mut state = self.state.lock().unwrap();
            let stalled = state.stalled_distills > 0;
            if stalled {
                state.stalled_distills -= 1;
            }
            stalled
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.script(script)
    }

    async fn click(&self, selector: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let (id, index) = state.element_for(selector)?;
        let url = state.url.clone();
        let element = state.site().elements[index].clone();
        if let Some(message) = element.click_error {
            bail!("{message}");
        }
        state.calls.push(format!("click {id}"));
        match element.on_click {
            Effect::Nothing => {}
            Effect::Navigate(to) => {
                state.url = to;
                state.scroll = 0;
                state.fields.clear();
            }
            Effect::SetText(text) => {
                if let Some(site) = state.sites.get_mut(&url) {
                    site.text = text;
                }
            }
            Effect::Scroll(amount) => state.scroll = (state.scroll + amount).max(0),
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, text: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let (id, index) = state.element_for(selector)?;
        state.calls.push(format!("fill {id} {text}"));
        state.fields.insert(index, text.to_string());
        Ok(())
    }

    async fn press(&self, selector: &str, key: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let (id, _) = state.element_for(selector)?;
        state.calls.push(format!("press {id} {key}"));
        Ok(())
    }

    async fn wait_for_network_idle(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn url(&self) -> Result<String> {
        Ok(self.current_url())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().site().title)
    }
}

#[derive(Default)]
pub struct Lifecycle {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl Lifecycle {
    pub fn started(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

pub struct FakeBrowser {
    page: Arc<FakePage>,
    lifecycle: Arc<Lifecycle>,
    fail_start: bool,
    running: AtomicBool,
}

impl FakeBrowser {
    pub fn new(page: Arc<FakePage>) -> Self {
        Self {
            page,
            lifecycle: Arc::new(Lifecycle::default()),
            fail_start: false,
            running: AtomicBool::new(false),
        }
    }

    pub fn failing(page: Arc<FakePage>) -> Self {
        Self {
            fail_start: true,
            ..Self::new(page)
        }
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn start(&mut self) -> Result<Arc<dyn Page>> {
        self.lifecycle.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            bail!("Could not auto detect a chrome executable");
        }
        self.running.store(true, Ordering::SeqCst);
        let page: Arc<dyn Page> = self.page.clone();
        Ok(page)
    }

    async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.lifecycle.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Replays canned replies in order, then keeps asking to wait.
#[derive(Default)]
pub struct ScriptedBrain {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
    delay: Option<Duration>,
}

impl ScriptedBrain {
    pub fn new<'a>(replies: impl IntoIterator<Item = &'a str>) -> Self {
        Self::from_results(replies.into_iter().map(|r| Ok(r.to_string())))
    }

    pub fn from_results(replies: impl IntoIterator<Item = Result<String, CompletionError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// The user turn of every request, in order.
    pub fn user_turns(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter_map(|messages| messages.last().map(|m| m.content.clone()))
            .collect()
    }
}

#[async_trait]
impl Completion for ScriptedBrain {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(r#"{"thought":"waiting","action":"wait"}"#.to_string()))
    }
}

/// Answers every approval request the same way and keeps what it was asked.
pub struct ScriptedApprover {
    answer: bool,
    requests: Arc<Mutex<Vec<ApprovalRequest>>>,
}

impl ScriptedApprover {
    pub fn new(answer: bool) -> (Self, Arc<Mutex<Vec<ApprovalRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                answer,
                requests: requests.clone(),
            },
            requests,
        )
    }
}

#[async_trait]
impl Approver for ScriptedApprover {
    async fn approve(&self, request: &ApprovalRequest) -> Result<bool> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.answer)
    }
}

pub fn fast_settings(max_iterations: u32) -> AgentSettings {
    AgentSettings {
        max_iterations,
        highlight: false,
        timeouts: Timeouts {
            action: Duration::from_secs(1),
            navigation: Duration::from_secs(1),
            idle: Duration::from_millis(100),
            settle_fallback: Duration::from_millis(10),
            scroll_pause: Duration::from_millis(10),
            script: Duration::from_millis(200),
        },
    }
}

pub fn agent(browser: FakeBrowser, brain: Arc<ScriptedBrain>, max_iterations: u32) -> Agent {
    agent_with_policy(browser, brain, max_iterations, SecurityPolicy::default())
}

pub fn agent_with_policy(
    browser: FakeBrowser,
    brain: Arc<ScriptedBrain>,
    max_iterations: u32,
    policy: SecurityPolicy,
) -> Agent {
    Agent::new(
        Box::new(browser),
        brain,
        RiskEngine::new(policy),
        fast_settings(max_iterations),
    )
}
