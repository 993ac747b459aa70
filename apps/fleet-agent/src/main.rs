use anyhow::Result;
use clap::Parser;
use fleet_agent::agent;
use fleet_agent::config::{AgentConfig, Cli};
use fleet_agent::metrics;
use fleet_agent::telemetry::init_tracing;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_filter = cli.log_filter.clone();
    init_tracing(&log_filter)?;

    let config = match AgentConfig::try_from(cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return Err(err.into());
        }
    };
    metrics::BOOT_COUNTER.inc();
    agent::run(config).await
}
