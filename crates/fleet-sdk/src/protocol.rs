//! Control-plane wire protocol.
//!
//! Every frame on the channel is a JSON envelope `{type, timestamp, payload}`.
//! Inbound (control plane -> agent) frames decode into [`ServerFrame`];
//! outbound frames are built from [`AgentFrame`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::identity::Platform;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Command body carried by a `command` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub command_id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// Frames the control plane sends to an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Command(CommandMessage),
    Ping,
    Shutdown { reason: Option<String> },
    /// Any type this agent does not understand; logged and ignored.
    Unknown(String),
}

#[derive(Debug, Default, Deserialize)]
struct ShutdownBody {
    #[serde(default)]
    reason: Option<String>,
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::parse(text)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        match envelope.kind.as_str() {
            "command" => Ok(ServerFrame::Command(serde_json::from_value(
                envelope.payload,
            )?)),
            "ping" => Ok(ServerFrame::Ping),
            "shutdown" => {
                let body: ShutdownBody = if envelope.payload.is_null() {
                    ShutdownBody::default()
                } else {
                    serde_json::from_value(envelope.payload).unwrap_or_default()
                };
                Ok(ServerFrame::Shutdown {
                    reason: body.reason,
                })
            }
            other => Ok(ServerFrame::Unknown(other.to_string())),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        match self {
            ServerFrame::Command(cmd) => Envelope::new(
                "command",
                serde_json::to_value(cmd).unwrap_or(Value::Null),
            ),
            ServerFrame::Ping => Envelope::new("ping", Value::Null),
            ServerFrame::Shutdown { reason } => {
                Envelope::new("shutdown", json!({ "reason": reason }))
            }
            ServerFrame::Unknown(kind) => Envelope::new(kind.clone(), Value::Null),
        }
    }
}

/// Resource ceiling advertised at registration and in every heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapacity {
    /// Millicores.
    pub max_cpu: u32,
    /// Gigabytes.
    pub max_memory: u32,
    pub max_sessions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub status: String,
    pub active_sessions: u32,
    pub capacity: AgentCapacity,
}

/// Frames an agent sends to the control plane.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFrame {
    Heartbeat(HeartbeatPayload),
    Ack {
        command_id: String,
    },
    Complete {
        command_id: String,
        result: Value,
    },
    Failed {
        command_id: String,
        error: String,
    },
    /// Sent by a standby replica in place of executing a command.
    Deferred {
        command_id: String,
        reason: String,
        leader: Option<String>,
    },
    Status {
        session_id: String,
        state: String,
    },
    Pong,
    ShutdownAck,
}

impl AgentFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentFrame::Heartbeat(_) => "heartbeat",
            AgentFrame::Ack { .. } => "ack",
            AgentFrame::Complete { .. } => "complete",
            AgentFrame::Failed { .. } => "failed",
            AgentFrame::Deferred { .. } => "deferred",
            AgentFrame::Status { .. } => "status",
            AgentFrame::Pong => "pong",
            AgentFrame::ShutdownAck => "shutdown_ack",
        }
    }

    /// Command this frame reports on, if any.
    pub fn command_id(&self) -> Option<&str> {
        match self {
            AgentFrame::Ack { command_id }
            | AgentFrame::Complete { command_id, .. }
            | AgentFrame::Failed { command_id, .. }
            | AgentFrame::Deferred { command_id, .. } => Some(command_id),
            _ => None,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let payload = match self {
            AgentFrame::Heartbeat(hb) => serde_json::to_value(hb).unwrap_or(Value::Null),
            AgentFrame::Ack { command_id } => json!({ "commandId": command_id }),
            AgentFrame::Complete { command_id, result } => {
                json!({ "commandId": command_id, "result": result })
            }
            AgentFrame::Failed { command_id, error } => {
                json!({ "commandId": command_id, "error": error })
            }
            AgentFrame::Deferred {
                command_id,
                reason,
                leader,
            } => json!({ "commandId": command_id, "reason": reason, "leader": leader }),
            AgentFrame::Status { session_id, state } => {
                json!({ "sessionId": session_id, "state": state })
            }
            AgentFrame::Pong | AgentFrame::ShutdownAck => Value::Null,
        };
        Envelope::new(self.kind(), payload)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_envelope().encode()
    }
}

/// Body of `POST /api/v1/agents/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub agent_id: String,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<AgentCapacity>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    #[serde(default)]
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Payload of `create_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionPayload {
    pub session_id: String,
    pub user: String,
    pub template: String,
    #[serde(default)]
    pub persistent_home: bool,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default)]
    pub idle_timeout: Option<String>,
}

fn default_memory() -> String {
    "2Gi".to_string()
}

fn default_cpu() -> String {
    "1000m".to_string()
}

/// Payload of `terminate_session`, `hibernate_session` and `resume_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRefPayload {
    pub session_id: String,
    #[serde(default, rename = "deletePVC")]
    pub delete_pvc: bool,
}
