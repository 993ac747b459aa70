use std::sync::Arc;

use async_trait::async_trait;
use fleet_bus::events::{
    encode_lifecycle, platform_topic, publish_lifecycle, LifecycleKind, SessionLifecycleEvent,
};
use fleet_bus::{Bus, BusError};
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics;
use crate::redis_store::RedisHandle;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("bus: {0}")]
    Bus(#[from] BusError),
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Fire-and-forget delivery of session lifecycle events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        kind: LifecycleKind,
        event: &SessionLifecycleEvent,
    ) -> Result<(), PublishError>;

    async fn publish_session_hibernate(
        &self,
        event: &SessionLifecycleEvent,
    ) -> Result<(), PublishError> {
        self.publish(LifecycleKind::Hibernate, event).await
    }

    async fn publish_session_wake(&self, event: &SessionLifecycleEvent) -> Result<(), PublishError> {
        self.publish(LifecycleKind::Wake, event).await
    }
}

/// Publishes and logs; failures never reach the caller.
pub async fn publish_best_effort(
    publisher: &dyn EventPublisher,
    kind: LifecycleKind,
    event: SessionLifecycleEvent,
) {
    let label = match kind {
        LifecycleKind::Hibernate => "hibernate",
        LifecycleKind::Wake => "wake",
    };
    match publisher.publish(kind, &event).await {
        Ok(()) => {
            metrics::EVENTS_PUBLISHED
                .with_label_values(&[label, "ok"])
                .inc();
        }
        Err(err) => {
            metrics::EVENTS_PUBLISHED
                .with_label_values(&[label, "error"])
                .inc();
            warn!(
                error = %err,
                session_id = %event.session_id,
                kind = label,
                "lifecycle event publish failed"
            );
        }
    }
}

/// In-process delivery over a [`Bus`].
pub struct BusEventPublisher<B: Bus + 'static> {
    bus: Arc<B>,
}

impl<B: Bus + 'static> BusEventPublisher<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl<B: Bus + 'static> EventPublisher for BusEventPublisher<B> {
    async fn publish(
        &self,
        kind: LifecycleKind,
        event: &SessionLifecycleEvent,
    ) -> Result<(), PublishError> {
        let delivered = publish_lifecycle(self.bus.as_ref(), kind, event)?;
        debug!(session_id = %event.session_id, delivered, "lifecycle event published");
        Ok(())
    }
}

/// Redis pub/sub delivery on the same subjects as the in-process bus.
pub struct RedisEventPublisher {
    redis: Arc<RedisHandle>,
}

impl RedisEventPublisher {
    pub fn new(redis: Arc<RedisHandle>) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish(
        &self,
        kind: LifecycleKind,
        event: &SessionLifecycleEvent,
    ) -> Result<(), PublishError> {
        let payload = encode_lifecycle(kind, event)?;
        let channel = platform_topic(kind.topic(), &event.platform);
        let mut conn = self.redis.conn().await?;
        let receivers: i64 = conn.publish(&channel, payload.as_ref()).await?;
        debug!(channel = %channel, receivers, "lifecycle event published");
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    events: parking_lot::Mutex<Vec<(LifecycleKind, SessionLifecycleEvent)>>,
    fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingPublisher {
    pub(crate) fn failing() -> Self {
        let publisher = Self::default();
        publisher
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        publisher
    }

    pub(crate) fn events(&self) -> Vec<(LifecycleKind, SessionLifecycleEvent)> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(
        &self,
        kind: LifecycleKind,
        event: &SessionLifecycleEvent,
    ) -> Result<(), PublishError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PublishError::Bus(BusError::Closed));
        }
        self.events.lock().push((kind, event.clone()));
        Ok(())
    }
}
