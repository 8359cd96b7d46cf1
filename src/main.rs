//! review-gate - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the governance API.

use review_gate::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "review_gate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        data_dir = %config.data_dir.display(),
        quiet_period_ms = config.quiet_period.as_millis() as u64,
        reviewer = config.reviewer_command.as_deref().unwrap_or("(none)"),
        "Loaded configuration"
    );

    api::serve(config).await?;

    Ok(())
}
