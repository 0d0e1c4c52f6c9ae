use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use iron_gate_browser::approval::default_approver;
use iron_gate_browser::{
    Agent, AgentConfig, Brain, ChromeBrowser, RiskEngine, RunReport, StepRecord,
};

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &RunReport) {
    println!("\n{}", "=".repeat(60));
    println!(
        "{}: {}",
        if report.success { "SUCCESS" } else { "FAILED" },
        report.message
    );
    println!("{}", "=".repeat(60));
    print_steps(&report.steps);
}

fn print_steps(steps: &[StepRecord]) {
    for step in steps {
        println!("{step}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let config = AgentConfig::parse();
    init_tracing(config.debug);

    match run(config).await {
        Ok(report) => {
            print_report(&report);
            if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AgentConfig) -> Result<RunReport> {
    let policy = config.security_policy();
    if !policy.enabled {
        warn!("Security checks are DISABLED");
    }

    let brain = Brain::new(&config.base_url, &config.model, config.api_key.clone())?;
    info!("Using model {} at {}", brain.model(), config.base_url);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after teardown...");
            let _ = stop_tx.send(true);
        }
    });

    let mut agent = Agent::new(
        Box::new(ChromeBrowser::new(config.chrome_options())),
        Arc::new(brain),
        RiskEngine::new(policy),
        config.agent_settings(),
    )
    .with_approver(default_approver())
    .with_interrupt(stop_rx);

    match agent.run(config.start_url(), &config.goal).await {
        Ok(report) => Ok(report),
        Err(e) => {
            if !agent.audit().is_empty() {
                println!("\n{}", "=".repeat(60));
                println!("ABORTED after {} steps: {e}", agent.audit().len());
                println!("{}", "=".repeat(60));
                print_steps(agent.audit());
            }
            Err(e.into())
        }
    }
}
