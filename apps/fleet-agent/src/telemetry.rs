use std::io::IsTerminal;

use anyhow::{Context, Result};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FALLBACK_FILTER: &str = "info";

/// Installs the process-wide subscriber. Colour is only emitted on a terminal,
/// so container log collectors receive plain lines.
pub fn init_tracing(filter: &str) -> Result<()> {
    let (env_filter, rejected) = build_filter(filter);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to initialise tracing subscriber")?;
    if let Some(reason) = rejected {
        warn!(filter, reason = %reason, fallback = FALLBACK_FILTER, "invalid log filter");
    }
    Ok(())
}

/// Parses `filter`, falling back to `info`. The parse error is returned so it
/// can be logged once a subscriber exists.
fn build_filter(filter: &str) -> (EnvFilter, Option<String>) {
    match EnvFilter::try_new(filter) {
        Ok(parsed) if !filter.trim().is_empty() => (parsed, None),
        Ok(_) => (EnvFilter::new(FALLBACK_FILTER), None),
        Err(err) => (EnvFilter::new(FALLBACK_FILTER), Some(err.to_string())),
    }
}
