//! review-gate-hook - command-line entry point for agent hooks.
//!
//! Each invocation is short-lived: it opens the shared store under
//! `REVIEW_GATE_DATA_DIR`, does one thing, prints JSON on stdout and exits.
//! Settle coordinators are started as detached `review-gate-hook settle`
//! processes. Logs go to stderr.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use review_gate::config::Config;
use review_gate::hook::{dispatch, Cli};
use review_gate::service::GovernanceService;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // stdout carries the JSON answer, so logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "review_gate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let service = GovernanceService::from_config(&config, cli.command.spawn_mode()?).await?;

    let reply = dispatch(&service, cli.command).await?;
    if !reply.body.is_null() {
        println!("{}", serde_json::to_string_pretty(&reply.body)?);
    }
    Ok(ExitCode::from(reply.exit_code))
}
