use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Session lifecycle actions the control plane may ask an agent to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    CreateSession,
    TerminateSession,
    HibernateSession,
    ResumeSession,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAction::CreateSession => "create_session",
            CommandAction::TerminateSession => "terminate_session",
            CommandAction::HibernateSession => "hibernate_session",
            CommandAction::ResumeSession => "resume_session",
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for CommandAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "create_session" | "start_session" => Ok(CommandAction::CreateSession),
            "terminate_session" | "stop_session" => Ok(CommandAction::TerminateSession),
            "hibernate_session" => Ok(CommandAction::HibernateSession),
            "resume_session" | "wake_session" => Ok(CommandAction::ResumeSession),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

/// received -> running -> succeeded | failed. Never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Received,
    Running,
    Succeeded,
    Failed,
}

impl CommandStatus {
    fn rank(self) -> u8 {
        match self {
            CommandStatus::Received => 0,
            CommandStatus::Running => 1,
            CommandStatus::Succeeded | CommandStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Succeeded | CommandStatus::Failed)
    }

    /// Whether `next` is a legal move from `self`. Re-applying the current
    /// status is allowed so that redelivered writes stay idempotent.
    pub fn can_advance_to(self, next: CommandStatus) -> bool {
        self == next || next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Received => "received",
            CommandStatus::Running => "running",
            CommandStatus::Succeeded => "succeeded",
            CommandStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted status of one control-plane command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command_id: String,
    /// Raw action string as received; unknown actions are recorded too.
    pub action: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Set once the terminal status has been sent upstream.
    #[serde(default)]
    pub reported: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandRecord {
    pub fn received(command_id: impl Into<String>, action: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            command_id: command_id.into(),
            action: action.into(),
            status: CommandStatus::Received,
            error: None,
            result: None,
            reported: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of a status write.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: CommandStatus,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl StatusUpdate {
    pub fn running() -> Self {
        Self {
            status: CommandStatus::Running,
            error: None,
            result: None,
        }
    }

    pub fn succeeded(result: Option<serde_json::Value>) -> Self {
        Self {
            status: CommandStatus::Succeeded,
            error: None,
            result,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failed,
            error: Some(error.into()),
            result: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    Existing(CommandRecord),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandStoreError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("illegal status transition for {command_id}: {from} -> {to}")]
    InvalidTransition {
        command_id: String,
        from: CommandStatus,
        to: CommandStatus,
    },
    #[error("command store error: {0}")]
    Store(String),
}

#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Records a newly received command unless one with the same id exists.
    async fn insert_if_absent(
        &self,
        record: CommandRecord,
    ) -> Result<InsertOutcome, CommandStoreError>;

    /// Moves a command forward. Regressions are rejected.
    async fn advance(
        &self,
        command_id: &str,
        update: StatusUpdate,
    ) -> Result<CommandRecord, CommandStoreError>;

    /// Flags the terminal status as reported. Returns `true` only for the first
    /// caller, so exactly one terminal frame leaves the agent.
    async fn mark_reported(&self, command_id: &str) -> Result<bool, CommandStoreError>;

    /// Undoes [`Self::mark_reported`] when the terminal frame never left the
    /// agent, so the next redelivery reports it.
    async fn clear_reported(&self, command_id: &str) -> Result<(), CommandStoreError>;

    async fn get(&self, command_id: &str) -> Result<Option<CommandRecord>, CommandStoreError>;
}

/// Applies `update` to `record` in place, enforcing monotonic transitions.
pub fn apply_update(
    record: &mut CommandRecord,
    update: StatusUpdate,
) -> Result<(), CommandStoreError> {
    if !record.status.can_advance_to(update.status) {
        return Err(CommandStoreError::InvalidTransition {
            command_id: record.command_id.clone(),
            from: record.status,
            to: update.status,
        });
    }
    record.status = update.status;
    if update.error.is_some() {
        record.error = update.error;
    }
    if update.result.is_some() {
        record.result = update.result;
    }
    record.updated_at = Utc::now();
    Ok(())
}

/// In-memory adapter for tests and standalone agents.
#[derive(Default)]
pub struct InMemoryCommandStore {
    records: Mutex<HashMap<String, CommandRecord>>,
}

impl InMemoryCommandStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn insert_if_absent(
        &self,
        record: CommandRecord,
    ) -> Result<InsertOutcome, CommandStoreError> {
        let mut guard = self.records.lock().await;
        if let Some(existing) = guard.get(&record.command_id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        guard.insert(record.command_id.clone(), record);
        Ok(InsertOutcome::Inserted)
    }

    async fn advance(
        &self,
        command_id: &str,
        update: StatusUpdate,
    ) -> Result<CommandRecord, CommandStoreError> {
        let mut guard = self.records.lock().await;
        let record = guard
            .get_mut(command_id)
            .ok_or_else(|| CommandStoreError::NotFound(command_id.to_string()))?;
        apply_update(record, update)?;
        Ok(record.clone())
    }

    async fn mark_reported(&self, command_id: &str) -> Result<bool, CommandStoreError> {
        let mut guard = self.records.lock().await;
        let record = guard
            .get_mut(command_id)
            .ok_or_else(|| CommandStoreError::NotFound(command_id.to_string()))?;
        if record.reported {
            return Ok(false);
        }
        record.reported = true;
        Ok(true)
    }

    async fn clear_reported(&self, command_id: &str) -> Result<(), CommandStoreError> {
        let mut guard = self.records.lock().await;
        let record = guard
            .get_mut(command_id)
            .ok_or_else(|| CommandStoreError::NotFound(command_id.to_string()))?;
        record.reported = false;
        Ok(())
    }

    async fn get(&self, command_id: &str) -> Result<Option<CommandRecord>, CommandStoreError> {
        Ok(self.records.lock().await.get(command_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_actions_and_aliases() {
        assert_eq!(
            "create_session".parse::<CommandAction>(),
            Ok(CommandAction::CreateSession)
        );
        assert_eq!(
            "start-session".parse::<CommandAction>(),
            Ok(CommandAction::CreateSession)
        );
        assert_eq!(
            "stop_session".parse::<CommandAction>(),
            Ok(CommandAction::TerminateSession)
        );
        assert_eq!(
            "wake_session".parse::<CommandAction>(),
            Ok(CommandAction::ResumeSession)
        );
        assert_eq!(
            "Hibernate-Session".parse::<CommandAction>(),
            Ok(CommandAction::HibernateSession)
        );
        assert!("reboot_node".parse::<CommandAction>().is_err());
    }

    #[test]
    fn status_never_regresses() {
        assert!(CommandStatus::Received.can_advance_to(CommandStatus::Running));
        assert!(CommandStatus::Received.can_advance_to(CommandStatus::Failed));
        assert!(CommandStatus::Running.can_advance_to(CommandStatus::Succeeded));
        assert!(CommandStatus::Succeeded.can_advance_to(CommandStatus::Succeeded));
        assert!(!CommandStatus::Succeeded.can_advance_to(CommandStatus::Failed));
        assert!(!CommandStatus::Running.can_advance_to(CommandStatus::Received));
        assert!(!CommandStatus::Failed.can_advance_to(CommandStatus::Running));
    }

    #[tokio::test]
    async fn insert_dedups_by_command_id() {
        let store = InMemoryCommandStore::new();
        let first = store
            .insert_if_absent(CommandRecord::received("cmd-1", "create_session"))
            .await
            .unwrap();
        assert_eq!(first, InsertOutcome::Inserted);

        store.advance("cmd-1", StatusUpdate::running()).await.unwrap();
        match store
            .insert_if_absent(CommandRecord::received("cmd-1", "create_session"))
            .await
            .unwrap()
        {
            InsertOutcome::Existing(existing) => {
                assert_eq!(existing.status, CommandStatus::Running)
            }
            other => panic!("expected existing record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn advance_rejects_regression_and_keeps_error() {
        let store = InMemoryCommandStore::new();
        store
            .insert_if_absent(CommandRecord::received("cmd-2", "terminate_session"))
            .await
            .unwrap();
        let failed = store
            .advance("cmd-2", StatusUpdate::failed("boom"))
            .await
            .unwrap();
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let err = store
            .advance("cmd-2", StatusUpdate::running())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandStoreError::InvalidTransition { .. }));
        assert!(matches!(
            store.advance("missing", StatusUpdate::running()).await,
            Err(CommandStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn only_first_report_wins() {
        let store = InMemoryCommandStore::new();
        store
            .insert_if_absent(CommandRecord::received("cmd-3", "hibernate_session"))
            .await
            .unwrap();
        store
            .advance("cmd-3", StatusUpdate::succeeded(None))
            .await
            .unwrap();
        assert!(store.mark_reported("cmd-3").await.unwrap());
        assert!(!store.mark_reported("cmd-3").await.unwrap());
        assert!(store.get("cmd-3").await.unwrap().unwrap().reported);

        store.clear_reported("cmd-3").await.unwrap();
        assert!(store.mark_reported("cmd-3").await.unwrap());
    }
}
