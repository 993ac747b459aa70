//! Session lifecycle events and the subjects they travel on.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Bus, BusError, BusResult};

pub const TOPIC_SESSION_HIBERNATE: &str = "fleet.session.hibernate";
pub const TOPIC_SESSION_WAKE: &str = "fleet.session.wake";

/// Platform-scoped subject, e.g. `fleet.session.hibernate.kubernetes`.
pub fn platform_topic(topic: &str, platform: &str) -> String {
    format!("{topic}.{platform}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Hibernate,
    Wake,
}

impl LifecycleKind {
    pub fn topic(self) -> &'static str {
        match self {
            LifecycleKind::Hibernate => TOPIC_SESSION_HIBERNATE,
            LifecycleKind::Wake => TOPIC_SESSION_WAKE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLifecycleEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub user_id: String,
    pub platform: String,
}

impl SessionLifecycleEvent {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            platform: platform.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "type")]
    kind: LifecycleKind,
    payload: T,
}

/// Wire form shared by every transport: `{"type": kind, "payload": event}`.
pub fn encode_lifecycle(kind: LifecycleKind, event: &SessionLifecycleEvent) -> BusResult<Bytes> {
    let env = Envelope {
        kind,
        payload: event,
    };
    serde_json::to_vec(&env)
        .map(Bytes::from)
        .map_err(|e| BusError::Transport(e.to_string()))
}

/// Publishes `event` on the platform-scoped subject for `kind`.
pub fn publish_lifecycle<B: Bus + ?Sized>(
    bus: &B,
    kind: LifecycleKind,
    event: &SessionLifecycleEvent,
) -> BusResult<usize> {
    let bytes = encode_lifecycle(kind, event)?;
    bus.publish(&platform_topic(kind.topic(), &event.platform), bytes)
}

/// Inverse of [`encode_lifecycle`] for subscribers.
pub fn decode_lifecycle(payload: &[u8]) -> BusResult<(LifecycleKind, SessionLifecycleEvent)> {
    let env: Envelope<SessionLifecycleEvent> =
        serde_json::from_slice(payload).map_err(|e| BusError::Transport(e.to_string()))?;
    Ok((env.kind, env.payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalBus;

    #[test]
    fn platform_topics_append_the_platform() {
        assert_eq!(
            platform_topic(TOPIC_SESSION_HIBERNATE, "docker"),
            "fleet.session.hibernate.docker"
        );
    }

    #[tokio::test]
    async fn lifecycle_events_reach_platform_subscribers() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("fleet.session.wake.kubernetes");
        let event = SessionLifecycleEvent::new("s1", "alice", "kubernetes");

        let delivered = publish_lifecycle(&bus, LifecycleKind::Wake, &event).unwrap();
        assert_eq!(delivered, 1);

        let msg = sub.recv().await.unwrap();
        let (kind, decoded) = decode_lifecycle(&msg.payload).unwrap();
        assert_eq!(kind, LifecycleKind::Wake);
        assert_eq!(decoded.session_id, "s1");
        assert_eq!(decoded.event_id, event.event_id);
    }
}
