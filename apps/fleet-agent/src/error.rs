use std::time::Duration;

use fleet_sdk::command::CommandStoreError;
use fleet_sdk::lease::LeaseError;
use thiserror::Error;

use crate::executor::ExecutorError;

/// Channel failures. Always transient: the connector turns them into a retry.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    #[error("websocket upgrade failed: {0}")]
    WebSocketUpgrade(String),
    #[error("agent registration failed: {0}")]
    RegistrationFailed(String),
    #[error("not connected to control plane")]
    NotConnected,
    #[error("outbound queue full")]
    OutboundFull,
}

/// Per-command failures, reported upstream as a `failed` status.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command action: {0}")]
    UnknownCommand(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// Found `running` after failover; the earlier attempt's outcome is unknown.
    #[error("interrupted")]
    Interrupted,
    #[error("{0}")]
    Execution(#[from] ExecutorError),
    #[error("command store: {0}")]
    Store(#[from] CommandStoreError),
}

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("lease client unavailable: {0}")]
    LeaseClient(String),
    #[error("invalid election timing: {0}")]
    InvalidTiming(String),
}

impl From<LeaseError> for ElectionError {
    fn from(err: LeaseError) -> Self {
        ElectionError::LeaseClient(err.to_string())
    }
}

/// Checks `retry_period < renew_deadline < lease_duration`.
pub fn validate_election_timing(
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
) -> Result<(), ElectionError> {
    if retry_period.is_zero() {
        return Err(ElectionError::InvalidTiming(
            "retry period must be positive".into(),
        ));
    }
    if renew_deadline >= lease_duration {
        return Err(ElectionError::InvalidTiming(format!(
            "renew deadline {renew_deadline:?} must be shorter than lease duration {lease_duration:?}"
        )));
    }
    if retry_period >= renew_deadline {
        return Err(ElectionError::InvalidTiming(format!(
            "retry period {retry_period:?} must be shorter than renew deadline {renew_deadline:?}"
        )));
    }
    Ok(())
}
