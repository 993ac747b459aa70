use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Execution substrate an agent manages sessions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Kubernetes,
    Docker,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Kubernetes => "kubernetes",
            Platform::Docker => "docker",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid platform type: {0}")]
pub struct InvalidPlatform(pub String);

impl FromStr for Platform {
    type Err = InvalidPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(Platform::Kubernetes),
            "docker" => Ok(Platform::Docker),
            other => Err(InvalidPlatform(other.to_string())),
        }
    }
}

/// Identity of one agent replica.
///
/// `agent_id` (`{platform}-{env}-{region}`) is shared by every replica of the
/// same agent and names both the lease and the routing key on the channel.
/// `instance_name` is unique per replica and is the election candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    agent_id: String,
    platform: Platform,
    instance_name: String,
}

impl AgentIdentity {
    pub fn new(
        agent_id: impl Into<String>,
        platform: Platform,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            platform,
            instance_name: instance_name.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }
}
