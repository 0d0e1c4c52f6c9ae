use anyhow::Result;
use async_trait::async_trait;
use std::io::{BufRead, IsTerminal, Write};
use tracing::{info, warn};

/// What the gate shows a human before a risky step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub message: String,
    pub score: u8,
}

/// Decides whether a step the gate flagged may run.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, request: &ApprovalRequest) -> Result<bool>;
}

/// Non-interactive contexts: every request is denied.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl Approver for DenyAll {
    async fn approve(&self, request: &ApprovalRequest) -> Result<bool> {
        warn!(
            security_event = true,
            "Approval required (risk {}) but no operator is attached; denying",
            request.score
        );
        Ok(false)
    }
}

/// Asks on stderr and reads a yes/no answer from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalApprover;

pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[async_trait]
impl Approver for TerminalApprover {
    async fn approve(&self, request: &ApprovalRequest) -> Result<bool> {
        let message = request.message.clone();
        let answer = tokio::task::spawn_blocking(move || -> Result<String> {
            let mut stderr = std::io::stderr().lock();
            writeln!(stderr, "\n{}\n{message}\n{}", "=".repeat(60), "=".repeat(60))?;
            write!(stderr, "> ")?;
            stderr.flush()?;

            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await??;

        let approved = is_affirmative(&answer);
        if approved {
            info!("Action approved by operator");
        } else {
            warn!(security_event = true, "Action denied by operator");
        }
        Ok(approved)
    }
}

/// Prompt when a terminal is attached, deny otherwise.
pub fn default_approver() -> Box<dyn Approver> {
    if std::io::stdin().is_terminal() {
        Box::new(TerminalApprover)
    } else {
        Box::new(DenyAll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_yes_counts_as_approval() {
        assert!(is_affirmative("yes\n"));
        assert!(is_affirmative(" Y "));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("yeah sure"));
    }

    #[tokio::test]
    async fn deny_all_fails_closed() {
        let request = ApprovalRequest {
            message: "approve?".into(),
            score: 50,
        };
        assert!(!DenyAll.approve(&request).await.unwrap());
    }
}
