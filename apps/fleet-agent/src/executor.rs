//! Boundary to the execution substrate.
//!
//! Container/orchestrator work lives behind [`SessionExecutor`]. The bundled
//! [`RegistryExecutor`] performs the lifecycle bookkeeping against the session
//! registry and publishes lifecycle events.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fleet_bus::events::{LifecycleKind, SessionLifecycleEvent};
use fleet_sdk::identity::Platform;
use fleet_sdk::protocol::{CreateSessionPayload, SessionRefPayload};
use fleet_sdk::session::{RegistryError, SessionRecord, SessionRegistry, SessionState};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::publisher::{publish_best_effort, EventPublisher};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("session {0} already exists")]
    AlreadyExists(String),
    #[error("session {session_id} cannot move from {from} to {to}")]
    InvalidState {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("platform: {0}")]
    Platform(String),
}

/// What an action did to a session; becomes the `status` and `complete` frames.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub session_id: String,
    pub state: SessionState,
    pub detail: Value,
}

impl ExecutionReport {
    fn new(session_id: &str, state: SessionState) -> Self {
        Self {
            session_id: session_id.to_string(),
            state,
            detail: json!({ "sessionId": session_id, "state": state.as_str() }),
        }
    }
}

#[async_trait]
pub trait SessionExecutor: Send + Sync {
    async fn create_session(
        &self,
        req: &CreateSessionPayload,
    ) -> Result<ExecutionReport, ExecutorError>;

    async fn terminate_session(
        &self,
        target: &SessionRefPayload,
    ) -> Result<ExecutionReport, ExecutorError>;

    async fn hibernate_session(
        &self,
        target: &SessionRefPayload,
    ) -> Result<ExecutionReport, ExecutorError>;

    async fn resume_session(
        &self,
        target: &SessionRefPayload,
    ) -> Result<ExecutionReport, ExecutorError>;
}

pub struct RegistryExecutor {
    registry: Arc<dyn SessionRegistry>,
    publisher: Arc<dyn EventPublisher>,
    scope: String,
    agent_id: String,
    platform: Platform,
}

impl RegistryExecutor {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        publisher: Arc<dyn EventPublisher>,
        scope: impl Into<String>,
        agent_id: impl Into<String>,
        platform: Platform,
    ) -> Self {
        Self {
            registry,
            publisher,
            scope: scope.into(),
            agent_id: agent_id.into(),
            platform,
        }
    }

    async fn transition(
        &self,
        session_id: &str,
        to: SessionState,
    ) -> Result<(SessionRecord, bool), ExecutorError> {
        let mut session = self.registry.get_session(&self.scope, session_id).await?;
        if session.state == to {
            return Ok((session, false));
        }
        if !session.state.can_transition_to(to) {
            return Err(ExecutorError::InvalidState {
                session_id: session_id.to_string(),
                from: session.state,
                to,
            });
        }
        session.state = to;
        if to == SessionState::Running {
            // A resumed session starts a fresh idle episode.
            session.last_activity = Some(Utc::now());
        }
        self.registry.update_session(&self.scope, &session).await?;
        Ok((session, true))
    }

    fn event_for(&self, session: &SessionRecord) -> SessionLifecycleEvent {
        SessionLifecycleEvent::new(
            session.session_id.clone(),
            session.user_id.clone(),
            self.platform.as_str(),
        )
    }
}

#[async_trait]
impl SessionExecutor for RegistryExecutor {
    async fn create_session(
        &self,
        req: &CreateSessionPayload,
    ) -> Result<ExecutionReport, ExecutorError> {
        match self.registry.get_session(&self.scope, &req.session_id).await {
            Ok(existing) if existing.state != SessionState::Terminated => {
                return Err(ExecutorError::AlreadyExists(req.session_id.clone()));
            }
            Ok(_) | Err(RegistryError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        let mut session = SessionRecord::new(req.session_id.clone(), req.user.clone());
        session.state = SessionState::Running;
        session.idle_timeout = req.idle_timeout.clone().filter(|v| !v.is_empty());
        session.agent_id = Some(self.agent_id.clone());
        self.registry.update_session(&self.scope, &session).await?;
        info!(
            session_id = %req.session_id,
            user = %req.user,
            template = %req.template,
            "session created"
        );
        let mut report = ExecutionReport::new(&req.session_id, SessionState::Running);
        report.detail["template"] = Value::String(req.template.clone());
        Ok(report)
    }

    async fn terminate_session(
        &self,
        target: &SessionRefPayload,
    ) -> Result<ExecutionReport, ExecutorError> {
        let (_, changed) = self
            .transition(&target.session_id, SessionState::Terminated)
            .await?;
        if changed {
            info!(session_id = %target.session_id, delete_pvc = target.delete_pvc, "session terminated");
        }
        Ok(ExecutionReport::new(
            &target.session_id,
            SessionState::Terminated,
        ))
    }

    async fn hibernate_session(
        &self,
        target: &SessionRefPayload,
    ) -> Result<ExecutionReport, ExecutorError> {
        let (session, changed) = self
            .transition(&target.session_id, SessionState::Hibernated)
            .await?;
        if changed {
            info!(session_id = %target.session_id, "session hibernated");
            publish_best_effort(
                self.publisher.as_ref(),
                LifecycleKind::Hibernate,
                self.event_for(&session),
            )
            .await;
        }
        Ok(ExecutionReport::new(
            &target.session_id,
            SessionState::Hibernated,
        ))
    }

    async fn resume_session(
        &self,
        target: &SessionRefPayload,
    ) -> Result<ExecutionReport, ExecutorError> {
        let (session, changed) = self
            .transition(&target.session_id, SessionState::Running)
            .await?;
        if changed {
            info!(session_id = %target.session_id, "session resumed");
            publish_best_effort(
                self.publisher.as_ref(),
                LifecycleKind::Wake,
                self.event_for(&session),
            )
            .await;
        }
        Ok(ExecutionReport::new(&target.session_id, SessionState::Running))
    }
}
