use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease backend unavailable: {0}")]
    Backend(String),
}

/// Distributed lease primitive used for leader election.
///
/// Implementations must make `try_acquire` atomic ("acquire if unheld or
/// expired") and `renew`/`release` conditional on the caller still being the
/// holder.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claims the lease for `holder`. Returns `true` when `holder` now owns it.
    /// Re-acquiring a lease already held by `holder` refreshes its expiry.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration)
        -> Result<bool, LeaseError>;

    /// Extends the lease if `holder` still owns it.
    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, LeaseError>;

    /// Drops the lease if `holder` still owns it.
    async fn release(&self, name: &str, holder: &str) -> Result<bool, LeaseError>;

    async fn current_holder(&self, name: &str) -> Result<Option<String>, LeaseError>;
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    holder: String,
    expires_at: Instant,
}

impl LeaseEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local lease store. Shared between replicas in tests, and backs the
/// single-replica standalone mode.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseEntry>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let now = Instant::now();
        let mut guard = self.leases.lock().await;
        match guard.get(name) {
            Some(entry) if entry.live(now) && entry.holder != holder => Ok(false),
            _ => {
                guard.insert(
                    name.to_string(),
                    LeaseEntry {
                        holder: holder.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, LeaseError> {
        let now = Instant::now();
        let mut guard = self.leases.lock().await;
        match guard.get_mut(name) {
            Some(entry) if entry.live(now) && entry.holder == holder => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, LeaseError> {
        let mut guard = self.leases.lock().await;
        match guard.get(name) {
            Some(entry) if entry.holder == holder => {
                guard.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_holder(&self, name: &str) -> Result<Option<String>, LeaseError> {
        let now = Instant::now();
        let guard = self.leases.lock().await;
        Ok(guard
            .get(name)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.holder.clone()))
    }
}
