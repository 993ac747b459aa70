use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Lifecycle state of a managed session.
///
/// States only move forward (`created -> running -> idle -> hibernated ->
/// terminated`) with one exception: resume re-enters `running` from
/// `hibernated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Idle,
    Hibernated,
    Terminated,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Created => 0,
            SessionState::Running => 1,
            SessionState::Idle => 2,
            SessionState::Hibernated => 3,
            SessionState::Terminated => 4,
        }
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self == SessionState::Hibernated && next == SessionState::Running {
            return true;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Idle => "idle",
            SessionState::Hibernated => "hibernated",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session record as stored in the external registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(default)]
    pub user_id: String,
    pub state: SessionState,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    /// Idle timeout in duration notation (`30m`, `1h`, `2h30m`); empty means unset.
    #[serde(default)]
    pub idle_timeout: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub cluster_id: Option<String>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            state: SessionState::Created,
            last_activity: None,
            idle_timeout: None,
            agent_id: None,
            cluster_id: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("registry store error: {0}")]
    Store(String),
}

/// Pass-through to the external session store. Calls are synchronous from the
/// caller's perspective and carry no retry; callers decide.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn get_session(&self, scope: &str, session_id: &str)
        -> Result<SessionRecord, RegistryError>;

    /// Writes only the status portion of the record (`last_activity`).
    async fn update_session_status(
        &self,
        scope: &str,
        session: &SessionRecord,
    ) -> Result<(), RegistryError>;

    /// Writes the whole record, creating it when absent.
    async fn update_session(&self, scope: &str, session: &SessionRecord)
        -> Result<(), RegistryError>;

    async fn list_sessions(&self, scope: &str) -> Result<Vec<SessionRecord>, RegistryError>;
}

/// In-memory registry for tests and standalone agents.
#[derive(Default)]
pub struct InMemorySessionRegistry {
    sessions: Mutex<HashMap<(String, String), SessionRecord>>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, scope: &str, session: SessionRecord) {
        self.sessions
            .lock()
            .await
            .insert((scope.to_string(), session.session_id.clone()), session);
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn get_session(
        &self,
        scope: &str,
        session_id: &str,
    ) -> Result<SessionRecord, RegistryError> {
        self.sessions
            .lock()
            .await
            .get(&(scope.to_string(), session_id.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))
    }

    async fn update_session_status(
        &self,
        scope: &str,
        session: &SessionRecord,
    ) -> Result<(), RegistryError> {
        let mut guard = self.sessions.lock().await;
        let existing = guard
            .get_mut(&(scope.to_string(), session.session_id.clone()))
            .ok_or_else(|| RegistryError::NotFound(session.session_id.clone()))?;
        existing.last_activity = session.last_activity;
        Ok(())
    }

    async fn update_session(
        &self,
        scope: &str,
        session: &SessionRecord,
    ) -> Result<(), RegistryError> {
        self.sessions.lock().await.insert(
            (scope.to_string(), session.session_id.clone()),
            session.clone(),
        );
        Ok(())
    }

    async fn list_sessions(&self, scope: &str) -> Result<Vec<SessionRecord>, RegistryError> {
        let guard = self.sessions.lock().await;
        let mut out: Vec<SessionRecord> = guard
            .iter()
            .filter(|((s, _), _)| s == scope)
            .map(|(_, record)| record.clone())
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(out)
    }
}
