//! A browser agent that works toward a natural-language goal one gated
//! action at a time: observe the page, ask the model, score the proposal,
//! act, and check that something actually changed.

pub mod agent;
pub mod approval;
pub mod brain;
pub mod config;
pub mod dom;
pub mod error;
pub mod executor;
pub mod hands;
pub mod history;
pub mod marks;
pub mod parser;
pub mod security;
pub mod types;

pub use agent::{Agent, AgentEvent, AgentSettings, RunReport};
pub use approval::{ApprovalRequest, Approver, DenyAll, TerminalApprover};
pub use brain::{Brain, Completion, CompletionError};
pub use config::AgentConfig;
pub use error::{ActionFailure, AgentError, ErrorTag};
pub use hands::{Browser, ChromeBrowser, ChromeOptions, Page};
pub use security::{GateDecision, RiskAssessment, RiskEngine, SecurityPolicy};
pub use types::{ActionKind, ActionProposal, StepOutcome, StepRecord};
