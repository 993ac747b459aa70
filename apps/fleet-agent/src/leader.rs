//! Leader election over a renewable lease.
//!
//! One [`LeaderElector`] runs per replica. It owns the local leadership
//! mirror ([`Leadership`]); the dispatcher and idle monitor only read it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_sdk::lease::LeaseStore;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{validate_election_timing, ElectionError};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeadershipState {
    pub leading: bool,
    /// Set once the elector has exited; no further transitions follow.
    pub stopped: bool,
}

/// Shared, read-mostly view of the election outcome.
#[derive(Clone)]
pub struct Leadership {
    inner: Arc<LeadershipInner>,
}

struct LeadershipInner {
    is_leader: AtomicBool,
    leader_identity: RwLock<Option<String>>,
    state: watch::Sender<LeadershipState>,
}

impl Default for Leadership {
    fn default() -> Self {
        Self::new()
    }
}

impl Leadership {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LeadershipState::default());
        Self {
            inner: Arc::new(LeadershipInner {
                is_leader: AtomicBool::new(false),
                leader_identity: RwLock::new(None),
                state,
            }),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::Acquire)
    }

    /// Last observed holder. Diagnostics only; gate actions on [`Self::is_leader`].
    pub fn leader_identity(&self) -> Option<String> {
        self.inner.leader_identity.read().clone()
    }

    /// Latest-value-wins notifications; intermediate values may be skipped.
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.inner.state.subscribe()
    }

    /// Resolves `true` once this replica leads, `false` once the elector stops.
    pub async fn wait_for_leadership(&self) -> bool {
        let mut rx = self.subscribe();
        let result = rx.wait_for(|s| s.leading || s.stopped).await;
        match result {
            Ok(state) => state.leading,
            Err(_) => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_leading_for_tests(identity: &str) -> Self {
        let leadership = Self::new();
        leadership.set_leading(identity);
        leadership
    }

    #[cfg(test)]
    pub(crate) fn step_down_for_tests(&self) {
        self.observe_holder(Some("other-replica".into()));
        self.set_standby();
    }

    fn set_leading(&self, identity: &str) {
        *self.inner.leader_identity.write() = Some(identity.to_string());
        self.inner.is_leader.store(true, Ordering::Release);
        self.inner.state.send_replace(LeadershipState {
            leading: true,
            stopped: false,
        });
        metrics::IS_LEADER.set(1);
    }

    fn set_standby(&self) {
        self.inner.is_leader.store(false, Ordering::Release);
        self.inner.state.send_replace(LeadershipState {
            leading: false,
            stopped: false,
        });
        metrics::IS_LEADER.set(0);
    }

    fn observe_holder(&self, holder: Option<String>) {
        *self.inner.leader_identity.write() = holder;
    }

    fn mark_stopped(&self) {
        self.inner.is_leader.store(false, Ordering::Release);
        self.inner.state.send_replace(LeadershipState {
            leading: false,
            stopped: true,
        });
        metrics::IS_LEADER.set(0);
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Transition hooks. Exactly one runs per transition, inline on the elector task.
#[derive(Clone)]
pub struct LeaderCallbacks {
    on_become_leader: Callback,
    on_lose_leadership: Callback,
}

impl LeaderCallbacks {
    pub fn new(
        on_become_leader: impl Fn() + Send + Sync + 'static,
        on_lose_leadership: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_become_leader: Arc::new(on_become_leader),
            on_lose_leadership: Arc::new(on_lose_leadership),
        }
    }
}

impl Default for LeaderCallbacks {
    fn default() -> Self {
        Self::new(|| {}, || {})
    }
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub lease_name: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl ElectionConfig {
    pub fn validate(&self) -> Result<(), ElectionError> {
        if self.identity.trim().is_empty() {
            return Err(ElectionError::InvalidTiming(
                "candidate identity must not be empty".into(),
            ));
        }
        if self.lease_name.trim().is_empty() {
            return Err(ElectionError::InvalidTiming(
                "lease name must not be empty".into(),
            ));
        }
        validate_election_timing(self.lease_duration, self.renew_deadline, self.retry_period)
    }
}

pub struct LeaderElector {
    config: ElectionConfig,
    store: Arc<dyn LeaseStore>,
    leadership: Leadership,
}

impl LeaderElector {
    pub fn new(config: ElectionConfig, store: Arc<dyn LeaseStore>, leadership: Leadership) -> Self {
        Self {
            config,
            store,
            leadership,
        }
    }

    pub fn leadership(&self) -> Leadership {
        self.leadership.clone()
    }

    /// Runs the election loop until `cancel` fires, then releases the lease.
    /// Invalid configuration fails immediately without touching the store.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        callbacks: LeaderCallbacks,
    ) -> Result<(), ElectionError> {
        if let Err(err) = self.config.validate() {
            self.leadership.mark_stopped();
            return Err(err);
        }
        info!(
            lease = %self.config.lease_name,
            identity = %self.config.identity,
            lease_ms = self.config.lease_duration.as_millis() as u64,
            renew_deadline_ms = self.config.renew_deadline.as_millis() as u64,
            retry_ms = self.config.retry_period.as_millis() as u64,
            "leader election started"
        );

        let mut leading = false;
        let mut last_renewal = Instant::now();

        loop {
            if leading {
                // Leadership must end before the lease can expire, so each
                // renewal gets only what is left of the renew deadline.
                let budget = self
                    .config
                    .renew_deadline
                    .saturating_sub(last_renewal.elapsed());
                let renewed = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = timeout(budget, self.store.renew(
                        &self.config.lease_name,
                        &self.config.identity,
                        self.config.lease_duration,
                    )) => res,
                };
                match renewed {
                    Ok(Ok(true)) => last_renewal = Instant::now(),
                    Ok(Ok(false)) => {
                        warn!(lease = %self.config.lease_name, "lease taken over; stepping down");
                        leading = false;
                        self.step_down(&callbacks);
                    }
                    Ok(Err(err)) => {
                        warn!(error = %err, lease = %self.config.lease_name, "lease renewal failed");
                        if last_renewal.elapsed() >= self.config.renew_deadline {
                            warn!(
                                lease = %self.config.lease_name,
                                "renew deadline exceeded; stepping down"
                            );
                            leading = false;
                            self.step_down(&callbacks);
                            self.release().await;
                        }
                    }
                    Err(_) => {
                        warn!(
                            lease = %self.config.lease_name,
                            budget_ms = budget.as_millis() as u64,
                            "lease renewal timed out; stepping down"
                        );
                        leading = false;
                        self.step_down(&callbacks);
                        self.release().await;
                    }
                }
            } else {
                let acquired = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = timeout(self.config.renew_deadline, self.store.try_acquire(
                        &self.config.lease_name,
                        &self.config.identity,
                        self.config.lease_duration,
                    )) => res,
                };
                match acquired {
                    Ok(Ok(true)) => {
                        leading = true;
                        last_renewal = Instant::now();
                        self.become_leader(&callbacks);
                    }
                    Ok(Ok(false)) => self.observe_holder().await,
                    Ok(Err(err)) => {
                        warn!(error = %err, lease = %self.config.lease_name, "lease acquire failed")
                    }
                    Err(_) => warn!(lease = %self.config.lease_name, "lease acquire timed out"),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }

        if leading {
            self.step_down(&callbacks);
            self.release().await;
        }
        self.leadership.mark_stopped();
        info!(lease = %self.config.lease_name, "leader election stopped");
        Ok(())
    }

    fn become_leader(&self, callbacks: &LeaderCallbacks) {
        info!(
            lease = %self.config.lease_name,
            identity = %self.config.identity,
            "became leader"
        );
        self.leadership.set_leading(&self.config.identity);
        metrics::LEADERSHIP_TRANSITIONS
            .with_label_values(&["acquired"])
            .inc();
        (callbacks.on_become_leader)();
    }

    fn step_down(&self, callbacks: &LeaderCallbacks) {
        info!(
            lease = %self.config.lease_name,
            identity = %self.config.identity,
            "lost leadership"
        );
        self.leadership.observe_holder(None);
        self.leadership.set_standby();
        metrics::LEADERSHIP_TRANSITIONS
            .with_label_values(&["lost"])
            .inc();
        (callbacks.on_lose_leadership)();
    }

    /// Best effort, bounded by one retry period; an unreleased lease expires.
    async fn release(&self) {
        let released = timeout(
            self.config.retry_period,
            self.store
                .release(&self.config.lease_name, &self.config.identity),
        )
        .await;
        match released {
            Ok(Ok(true)) => debug!(lease = %self.config.lease_name, "lease released"),
            Ok(Ok(false)) => debug!(lease = %self.config.lease_name, "lease no longer held"),
            Ok(Err(err)) => {
                warn!(error = %err, lease = %self.config.lease_name, "lease release failed")
            }
            Err(_) => warn!(lease = %self.config.lease_name, "lease release timed out"),
        }
    }

    async fn observe_holder(&self) {
        let holder = timeout(
            self.config.retry_period,
            self.store.current_holder(&self.config.lease_name),
        )
        .await;
        match holder {
            Err(_) => debug!(lease = %self.config.lease_name, "lease holder read timed out"),
            Ok(Err(err)) => debug!(error = %err, "could not read lease holder"),
            Ok(Ok(holder)) => {
                if holder != self.leadership.leader_identity() {
                    debug!(lease = %self.config.lease_name, holder = ?holder, "observed leader");
                }
                self.leadership.observe_holder(holder);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use fleet_sdk::lease::{InMemoryLeaseStore, LeaseError};

    use super::*;

    fn config(identity: &str) -> ElectionConfig {
        ElectionConfig {
            lease_name: "fleet:docker-test".into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_candidate_leads_and_releases_on_cancel() {
        let store = InMemoryLeaseStore::new();
        let leadership = Leadership::new();
        let elector = Arc::new(LeaderElector::new(
            config("pod-a"),
            store.clone(),
            leadership.clone(),
        ));
        let gained = Arc::new(AtomicUsize::new(0));
        let lost = Arc::new(AtomicUsize::new(0));
        let callbacks = {
            let gained = gained.clone();
            let lost = lost.clone();
            LeaderCallbacks::new(
                move || {
                    gained.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    lost.fetch_add(1, Ordering::SeqCst);
                },
            )
        };
        let cancel = CancellationToken::new();
        let task = {
            let elector = elector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { elector.run(cancel, callbacks).await })
        };

        assert!(leadership.wait_for_leadership().await);
        assert!(leadership.is_leader());
        assert_eq!(leadership.leader_identity().as_deref(), Some("pod-a"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gained.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(!leadership.is_leader());
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert_eq!(store.current_holder("fleet:docker-test").await.unwrap(), None);
        assert!(!leadership.wait_for_leadership().await);
    }

    #[tokio::test]
    async fn invalid_timing_fails_before_election() {
        let mut cfg = config("pod-a");
        cfg.renew_deadline = cfg.lease_duration;
        let leadership = Leadership::new();
        let elector = LeaderElector::new(cfg, InMemoryLeaseStore::new(), leadership.clone());
        let err = elector
            .run(CancellationToken::new(), LeaderCallbacks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ElectionError::InvalidTiming(_)));
        assert!(!leadership.wait_for_leadership().await);
    }

    /// Lease store whose renewals start failing on demand.
    struct FlakyLease {
        inner: Arc<InMemoryLeaseStore>,
        fail_renew: AtomicBool,
    }

    #[async_trait]
    impl LeaseStore for FlakyLease {
        async fn try_acquire(
            &self,
            name: &str,
            holder: &str,
            ttl: Duration,
        ) -> Result<bool, LeaseError> {
            self.inner.try_acquire(name, holder, ttl).await
        }

        async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, LeaseError> {
            if self.fail_renew.load(Ordering::SeqCst) {
                return Err(LeaseError::Backend("connection refused".into()));
            }
            self.inner.renew(name, holder, ttl).await
        }

        async fn release(&self, name: &str, holder: &str) -> Result<bool, LeaseError> {
            self.inner.release(name, holder).await
        }

        async fn current_holder(&self, name: &str) -> Result<Option<String>, LeaseError> {
            self.inner.current_holder(name).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn steps_down_after_renew_deadline() {
        let store = Arc::new(FlakyLease {
            inner: InMemoryLeaseStore::new(),
            fail_renew: AtomicBool::new(false),
        });
        let leadership = Leadership::new();
        let elector = Arc::new(LeaderElector::new(
            config("pod-a"),
            store.clone(),
            leadership.clone(),
        ));
        let cancel = CancellationToken::new();
        let task = {
            let elector = elector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { elector.run(cancel, LeaderCallbacks::default()).await })
        };
        assert!(leadership.wait_for_leadership().await);

        store.fail_renew.store(true, Ordering::SeqCst);
        let mut rx = leadership.subscribe();
        let started = Instant::now();
        rx.wait_for(|s| !s.leading).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "stepped down after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(15), "stepped down after {elapsed:?}");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    /// Lease store that stops answering once armed, like a hung backend.
    struct StalledLease {
        inner: Arc<InMemoryLeaseStore>,
        stalled: AtomicBool,
    }

    impl StalledLease {
        async fn stall(&self) {
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl LeaseStore for StalledLease {
        async fn try_acquire(
            &self,
            name: &str,
            holder: &str,
            ttl: Duration,
        ) -> Result<bool, LeaseError> {
            self.stall().await;
            self.inner.try_acquire(name, holder, ttl).await
        }

        async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, LeaseError> {
            self.stall().await;
            self.inner.renew(name, holder, ttl).await
        }

        async fn release(&self, name: &str, holder: &str) -> Result<bool, LeaseError> {
            self.stall().await;
            self.inner.release(name, holder).await
        }

        async fn current_holder(&self, name: &str) -> Result<Option<String>, LeaseError> {
            self.stall().await;
            self.inner.current_holder(name).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_renewal_steps_down_before_the_lease_expires() {
        let shared = InMemoryLeaseStore::new();
        let stalled = Arc::new(StalledLease {
            inner: shared.clone(),
            stalled: AtomicBool::new(false),
        });

        let a = Leadership::new();
        let elector_a = LeaderElector::new(config("pod-a"), stalled.clone(), a.clone());
        let cancel = CancellationToken::new();
        let task_a = {
            let cancel = cancel.clone();
            tokio::spawn(async move { elector_a.run(cancel, LeaderCallbacks::default()).await })
        };
        assert!(a.wait_for_leadership().await);
        stalled.stalled.store(true, Ordering::SeqCst);

        let b = Leadership::new();
        let elector_b = LeaderElector::new(config("pod-b"), shared.clone(), b.clone());
        let task_b = {
            let cancel = cancel.clone();
            tokio::spawn(async move { elector_b.run(cancel, LeaderCallbacks::default()).await })
        };

        let started = Instant::now();
        let mut a_stepped_down = None;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(
                !(a.is_leader() && b.is_leader()),
                "pod-a and pod-b both lead at {:?}",
                started.elapsed()
            );
            if a_stepped_down.is_none() && !a.is_leader() {
                a_stepped_down = Some(started.elapsed());
            }
        }
        let stepped_down = a_stepped_down.expect("pod-a steps down");
        assert!(stepped_down <= Duration::from_secs(11), "stepped down after {stepped_down:?}");
        assert!(b.is_leader());
        assert_eq!(shared.current_holder("fleet:docker-test").await.unwrap().as_deref(), Some("pod-b"));

        cancel.cancel();
        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();
    }
}
