//! The Observe → Think → Gate → Act → Verify loop.
//!
//! One goal, one page, strictly sequential iterations. Every per-step
//! failure is recorded and fed back to the model; only a browser that will
//! not start, an unreachable completion endpoint, or an external interrupt
//! end the run early. The browser is stopped on every exit path.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::approval::{ApprovalRequest, Approver, DenyAll};
use crate::brain::{Completion, PromptContext, build_messages};
use crate::dom;
use crate::error::{ActionFailure, AgentError, ErrorTag};
use crate::executor::{Executor, PageChange, PageFingerprint, Timeouts};
use crate::hands::{Browser, Page};
use crate::history::StepHistory;
use crate::marks::{self, ElementIndex};
use crate::parser;
use crate::security::{GateDecision, RiskEngine, approval_message, wrap_untrusted};
use crate::types::{
    ActionKind, ActionProposal, DEFAULT_MAX_ITERATIONS, Observation, StepOutcome, StepRecord,
};

/// Progress notifications for whoever is watching the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Thinking,
    Step { number: u32, description: String },
    StepError { message: String },
    TaskComplete { summary: String },
    TaskError { message: String },
}

/// How the run ended, plus everything it tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub message: String,
    /// Every recorded step, including observation failures.
    pub steps: Vec<StepRecord>,
    /// The last steps the model saw.
    pub history: Vec<StepRecord>,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_iterations: u32,
    /// Outline targets before acting on them.
    pub highlight: bool,
    pub timeouts: Timeouts,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            highlight: false,
            timeouts: Timeouts::default(),
        }
    }
}

pub struct Agent {
    browser: Box<dyn Browser>,
    brain: Arc<dyn Completion>,
    engine: RiskEngine,
    approver: Box<dyn Approver>,
    executor: Executor,
    max_iterations: u32,
    history: StepHistory,
    audit: Vec<StepRecord>,
    step: u32,
    last_error: Option<String>,
    events: broadcast::Sender<AgentEvent>,
    interrupt: Option<watch::Receiver<bool>>,
}

/// Resolves once the flag turns true. A dropped sender never interrupts.
async fn interrupted(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Agent {
    pub fn new(
        browser: Box<dyn Browser>,
        brain: Arc<dyn Completion>,
        engine: RiskEngine,
        settings: AgentSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            browser,
            brain,
            engine,
            approver: Box::new(DenyAll),
            executor: Executor::new(settings.timeouts, settings.highlight),
            max_iterations: settings.max_iterations,
            history: StepHistory::default(),
            audit: Vec::new(),
            step: 0,
            last_error: None,
            events,
            interrupt: None,
        }
    }

    pub fn with_approver(mut self, approver: Box<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    /// Stop the run (after teardown) once `rx` reads `true`.
    pub fn with_interrupt(mut self, rx: watch::Receiver<bool>) -> Self {
        self.interrupt = Some(rx);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> &StepHistory {
        &self.history
    }

    /// Every step recorded in the current or last run.
    pub fn audit(&self) -> &[StepRecord] {
        &self.audit
    }

    fn script_limit(&self) -> Duration {
        self.executor.timeouts().script
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn reset(&mut self) {
        self.history.clear();
        self.audit.clear();
        self.step = 0;
        self.last_error = None;
    }

    /// Drive the browser toward `goal`, starting at `start_url` when given.
    pub async fn run(
        &mut self,
        start_url: Option<&str>,
        goal: &str,
    ) -> Result<RunReport, AgentError> {
        self.reset();
        info!("Goal: {goal}");

        let page = match self.browser.start().await {
            Ok(page) => page,
            Err(e) => {
                if let Err(stop_err) = self.browser.stop().await {
                    warn!("Browser stop after failed start: {stop_err:#}");
                }
                let err = AgentError::BrowserStart(e);
                self.emit(AgentEvent::TaskError {
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        let outcome = match self.interrupt.clone() {
            Some(rx) => {
                tokio::select! {
                    result = self.drive(page.as_ref(), start_url, goal) => result,
                    _ = interrupted(rx) => {
                        warn!("Run interrupted; tearing down");
                        Err(AgentError::Interrupted)
                    }
                }
            }
            None => self.drive(page.as_ref(), start_url, goal).await,
        };

        marks::cleanup(page.as_ref(), self.script_limit()).await;
        drop(page);
        if let Err(e) = self.browser.stop().await {
            warn!("Browser stop failed: {e:#}");
        }

        match &outcome {
            Ok(report) if report.success => self.emit(AgentEvent::TaskComplete {
                summary: report.message.clone(),
            }),
            Ok(report) => self.emit(AgentEvent::TaskError {
                message: report.message.clone(),
            }),
            Err(e) => self.emit(AgentEvent::TaskError {
                message: e.to_string(),
            }),
        }
        outcome
    }

    fn report(&self, success: bool, message: impl Into<String>) -> RunReport {
        RunReport {
            success,
            message: message.into(),
            steps: self.audit.clone(),
            history: self.history.to_vec(),
        }
    }

    async fn drive(
        &mut self,
        page: &dyn Page,
        start_url: Option<&str>,
        goal: &str,
    ) -> Result<RunReport, AgentError> {
        if let Some(url) = start_url.filter(|u| !u.trim().is_empty()) {
            let start = ActionProposal::new(ActionKind::Navigate).with_value(url);
            if let Err(failure) = self
                .executor
                .execute(page, &start, &ElementIndex::default())
                .await
            {
                warn!("Could not open start page: {failure}");
                self.last_error = Some(failure.to_string());
            }
        }

        for iteration in 1..=self.max_iterations {
            info!("--- Iteration {iteration}/{} ---", self.max_iterations);
            let finished = self.iterate(page, goal).await;
            marks::cleanup(page, self.script_limit()).await;
            if let Some(report) = finished? {
                return Ok(report);
            }
        }

        warn!("Max iterations ({}) reached", self.max_iterations);
        Ok(self.report(false, "max iterations reached"))
    }

    /// One pass of the loop. `Some` ends the run.
    async fn iterate(&mut self, page: &dyn Page, goal: &str) -> Result<Option<RunReport>, AgentError> {
        // Observe
        let observation = match self.observe(page).await {
            Ok(observation) => observation,
            Err(failure) => {
                warn!("Observation failed: {failure}");
                self.record("observe", "-".to_string(), failed(failure), false);
                return Ok(None);
            }
        };

        // Think
        let Some(mut proposal) = self.think(&observation, goal).await? else {
            return Ok(None);
        };
        info!(
            "Thought: {} | action: {} {}",
            proposal.thought,
            proposal.kind,
            proposal.target_label()
        );

        if proposal.kind == ActionKind::Done {
            let summary = if proposal.thought.trim().is_empty() {
                "Goal achieved".to_string()
            } else {
                proposal.thought.clone()
            };
            info!("Task complete: {summary}");
            return Ok(Some(self.report(true, summary)));
        }

        if self.repeats_last_type(&proposal) {
            info!(
                "Repeated type on {}; pressing Enter instead",
                proposal.target_label()
            );
            proposal = ActionProposal {
                kind: ActionKind::PressEnter,
                value: None,
                ..proposal
            };
        }

        let action = proposal.kind.as_str();
        let target = proposal.target_label();

        // Gate
        if let Err(failure) = self.gate(&proposal, &observation).await {
            self.last_error = Some(failure.to_string());
            self.record(action, target, failed(failure), true);
            return Ok(None);
        }

        // Act
        let before = PageFingerprint::capture(page, self.script_limit()).await;
        let detail = match self
            .executor
            .execute(page, &proposal, &observation.elements)
            .await
        {
            Ok(detail) => detail,
            Err(failure) => {
                warn!("Action failed: {failure}");
                self.last_error = Some(failure.to_string());
                self.record(action, target, failed(failure), true);
                return Ok(None);
            }
        };

        // Verify
        let after = PageFingerprint::capture(page, self.script_limit()).await;
        let change = before.compare(&after);
        let outcome = if change.is_effect_of(proposal.kind) {
            self.last_error = None;
            let what = match change {
                PageChange::UrlChanged => "URL changed",
                PageChange::Scrolled => "scrolled",
                _ => "content changed",
            };
            StepOutcome::Success(format!("{detail} ({what})"))
        } else {
            self.last_error = Some(format!(
                "NO_EFFECT: {action} {target} did not change the page. Try a different approach."
            ));
            StepOutcome::NoEffect(detail)
        };
        self.record(action, target, outcome, true);
        Ok(None)
    }

    /// Tag, read back and distill the current page.
    async fn observe(&self, page: &dyn Page) -> Result<Observation, ActionFailure> {
        let limit = self.script_limit();
        marks::tag(page, limit).await?;
        let elements = marks::observe(page, limit).await?;
        let distilled_text = dom::distill(page, limit).await?;
        let url = page.url().await.map_err(|e| {
            ActionFailure::new(ErrorTag::ObserveError, format!("url unavailable: {e:#}"))
        })?;
        let title = page.title().await.unwrap_or_default();
        debug!("Observed {url} with {} tagged elements", elements.len());
        Ok(Observation {
            url,
            title,
            distilled_text,
            elements,
        })
    }

    /// Ask the model for the next step. `Ok(None)` means the step was
    /// recorded as failed and the loop should move on.
    async fn think(
        &mut self,
        observation: &Observation,
        goal: &str,
    ) -> Result<Option<ActionProposal>, AgentError> {
        self.emit(AgentEvent::Thinking);

        let page_text = if self.engine.policy().enabled {
            wrap_untrusted(&observation.distilled_text)
        } else {
            observation.distilled_text.clone()
        };
        let history = self.history.render();
        let elements = observation.elements.listing();
        let messages = build_messages(&PromptContext {
            goal,
            url: &observation.url,
            title: &observation.title,
            history: &history,
            elements: &elements,
            page: &page_text,
            last_error: self.last_error.as_deref(),
        });

        let reply = match self.brain.complete(&messages).await {
            Ok(reply) => reply,
            Err(e) if e.is_fatal() => return Err(AgentError::LlmUnreachable(e.to_string())),
            Err(e) => {
                warn!("LLM error: {e}");
                let failure = ActionFailure::new(ErrorTag::LlmError, e.to_string());
                self.last_error = Some(failure.to_string());
                self.record("think", "-".to_string(), failed(failure), true);
                return Ok(None);
            }
        };

        match parser::extract(&reply) {
            Ok(proposal) => Ok(Some(proposal)),
            Err(failure) => {
                self.last_error = Some(
                    "FORMAT_ERROR: reply was not valid JSON. Respond with a single JSON object."
                        .to_string(),
                );
                self.record("think", "-".to_string(), failed(failure), true);
                Ok(None)
            }
        }
    }

    fn repeats_last_type(&self, proposal: &ActionProposal) -> bool {
        proposal.kind == ActionKind::Type
            && proposal.target_id.is_some()
            && self.history.last().is_some_and(|last| {
                last.action == ActionKind::Type.as_str() && last.target == proposal.target_label()
            })
    }

    /// Risk score, Iron Gate and, for clicks, the deceptive-UI check.
    async fn gate(
        &self,
        proposal: &ActionProposal,
        observation: &Observation,
    ) -> Result<(), ActionFailure> {
        let element = proposal
            .target_id
            .and_then(|id| observation.elements.get(id))
            .map(|record| &record.info);
        let assessment = self.engine.score(proposal, &observation.url, element);

        match self.engine.decide(assessment.score) {
            GateDecision::Block => {
                warn!(
                    security_event = true,
                    "BLOCKED {} {} (risk {}): {}",
                    proposal.kind,
                    proposal.target_label(),
                    assessment.score,
                    assessment.summary()
                );
                return Err(ActionFailure::new(
                    ErrorTag::SecurityBlock,
                    format!("risk {}: {}", assessment.score, assessment.summary()),
                ));
            }
            GateDecision::RequireApproval => {
                info!(
                    "Approval required (risk {}): {}",
                    assessment.score,
                    assessment.summary()
                );
                let request = ApprovalRequest {
                    message: approval_message(proposal, &assessment),
                    score: assessment.score,
                };
                let approved = match self.approver.approve(&request).await {
                    Ok(approved) => approved,
                    Err(e) => {
                        warn!("Approval prompt failed, denying: {e:#}");
                        false
                    }
                };
                if !approved {
                    return Err(ActionFailure::new(
                        ErrorTag::ApprovalDenied,
                        format!(
                            "user denied action (risk {}): {}",
                            assessment.score,
                            assessment.summary()
                        ),
                    ));
                }
            }
            GateDecision::AutoApprove => {
                debug!("Auto-approved (risk {})", assessment.score);
            }
        }

        if let (ActionKind::Click, Some(info)) = (proposal.kind, element) {
            let verdict = self
                .engine
                .check_deceptive_ui(proposal.visual_label.as_deref(), &info.text)
                .inspect_err(|_| {
                    warn!(security_event = true, "Click on {} refused", proposal.target_label());
                })?;
            debug!("{verdict}");
        }
        Ok(())
    }

    /// Append to the audit trail and, when `remember`, to the model's history.
    fn record(&mut self, action: &str, target: String, outcome: StepOutcome, remember: bool) {
        self.step += 1;
        let record = StepRecord {
            step: self.step,
            action: action.to_string(),
            target,
            outcome,
        };
        info!("{record}");

        if record.outcome.is_success() {
            self.emit(AgentEvent::Step {
                number: record.step,
                description: record.to_string(),
            });
        } else {
            self.emit(AgentEvent::StepError {
                message: record.to_string(),
            });
        }

        self.audit.push(record.clone());
        if remember {
            self.history.push(record);
        }
    }
}

fn failed(failure: ActionFailure) -> StepOutcome {
    StepOutcome::Failed {
        tag: failure.tag,
        detail: failure.detail,
    }
}
