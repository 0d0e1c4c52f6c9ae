use clap::Parser;

use crate::agent::AgentSettings;
use crate::brain::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::executor::Timeouts;
use crate::hands::ChromeOptions;
use crate::security::SecurityPolicy;
use crate::types::DEFAULT_MAX_ITERATIONS;

/// Drive a browser toward a goal, one gated action at a time.
#[derive(Debug, Clone, Parser)]
#[command(name = "iron-gate", version)]
pub struct AgentConfig {
    /// What the agent should accomplish
    #[arg(long)]
    pub goal: String,

    /// Page to open before the first step
    #[arg(long, default_value = "https://www.google.com")]
    pub url: String,

    /// Model name sent to the completion endpoint
    #[arg(long, env = "OLLAMA_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// OpenAI-compatible endpoint base URL
    #[arg(long, env = "OLLAMA_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Bearer token for the completion endpoint
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Run Chrome without a window
    #[arg(long)]
    pub headless: bool,

    /// Verbose logs and highlighted targets
    #[arg(long)]
    pub debug: bool,

    /// Give up after this many iterations
    #[arg(long, default_value_t = DEFAULT_MAX_ITERATIONS)]
    pub max_iterations: u32,

    /// Skip risk scoring and the approval gate
    #[arg(long)]
    pub no_security: bool,

    /// Ask for approval from a lower risk score
    #[arg(long, conflicts_with = "no_security")]
    pub strict: bool,

    /// Extra trusted domain (repeatable)
    #[arg(long = "trust", value_name = "DOMAIN")]
    pub trusted: Vec<String>,
}

impl AgentConfig {
    pub fn security_policy(&self) -> SecurityPolicy {
        let mut policy = if self.no_security {
            SecurityPolicy::disabled()
        } else if self.strict {
            SecurityPolicy::strict()
        } else {
            SecurityPolicy::default()
        };
        for domain in &self.trusted {
            policy.add_trusted_domain(domain);
        }
        policy
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            max_iterations: self.max_iterations.max(1),
            highlight: self.debug,
            timeouts: Timeouts::default(),
        }
    }

    pub fn chrome_options(&self) -> ChromeOptions {
        ChromeOptions {
            headless: self.headless,
            ..ChromeOptions::default()
        }
    }

    /// `None` when the start URL is blank.
    pub fn start_url(&self) -> Option<&str> {
        Some(self.url.trim()).filter(|u| !u.is_empty())
    }
}
