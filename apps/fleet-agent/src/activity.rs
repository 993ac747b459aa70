//! Session activity tracking and idle hibernation.
//!
//! The idle monitor lists the scope's sessions each tick, evaluates every
//! running one, and hibernates those past `idle_timeout + GRACE_PERIOD`.
//! Evaluation only happens while this replica leads.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_bus::events::{LifecycleKind, SessionLifecycleEvent};
use fleet_sdk::identity::Platform;
use fleet_sdk::session::{RegistryError, SessionRecord, SessionRegistry, SessionState};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::leader::Leadership;
use crate::metrics;
use crate::publisher::{publish_best_effort, EventPublisher};

/// Extra time past the idle threshold before hibernation triggers.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Derived idle view of one session. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityStatus {
    pub is_active: bool,
    pub is_idle: bool,
    pub idle_duration: Duration,
    pub idle_threshold: Duration,
    pub should_hibernate: bool,
}

impl ActivityStatus {
    fn active(idle_duration: Duration, idle_threshold: Duration) -> Self {
        Self {
            is_active: true,
            is_idle: false,
            idle_duration,
            idle_threshold,
            should_hibernate: false,
        }
    }
}

/// Computes the idle status of `session` at `now`.
///
/// No recorded activity, or no usable idle timeout, always reads as active.
pub fn evaluate(session: &SessionRecord, now: DateTime<Utc>) -> ActivityStatus {
    let threshold = session
        .idle_timeout
        .as_deref()
        .and_then(parse_idle_timeout)
        .unwrap_or(Duration::ZERO);
    let Some(last_activity) = session.last_activity else {
        return ActivityStatus::active(Duration::ZERO, threshold);
    };
    // Activity stamped in the future (clock skew) counts as just now.
    let idle_duration = (now - last_activity).to_std().unwrap_or(Duration::ZERO);
    if threshold.is_zero() {
        return ActivityStatus::active(idle_duration, threshold);
    }
    let is_idle = idle_duration >= threshold;
    // A threshold too large to extend by the grace period is never reached.
    let should_hibernate = threshold
        .checked_add(GRACE_PERIOD)
        .is_some_and(|limit| idle_duration >= limit);
    ActivityStatus {
        is_active: !is_idle,
        is_idle,
        idle_duration,
        idle_threshold: threshold,
        should_hibernate,
    }
}

/// Parses duration notation such as `30m`, `1h`, `2h30m`, `1.5h` or `90s`.
///
/// Returns `None` for empty, zero, negative, malformed or out-of-range input.
pub fn parse_idle_timeout(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s.is_empty() || s.starts_with('-') {
        return None;
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return None;
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" | "μs" => 1e-6,
            "ns" => 1e-9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += value * seconds_per_unit;
    }

    if !total.is_finite() || total <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(total).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HibernateOutcome {
    Hibernated,
    /// Activity resumed, state changed, or leadership was lost before acting.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub running: u32,
    pub evaluated: u32,
    pub idle: u32,
    pub hibernated: u32,
    pub errors: u32,
}

pub struct ActivityTracker {
    registry: Arc<dyn SessionRegistry>,
    publisher: Arc<dyn EventPublisher>,
    leadership: Leadership,
    scope: String,
    platform: Platform,
    active_sessions: Arc<AtomicU32>,
}

impl ActivityTracker {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        publisher: Arc<dyn EventPublisher>,
        leadership: Leadership,
        scope: impl Into<String>,
        platform: Platform,
        active_sessions: Arc<AtomicU32>,
    ) -> Self {
        Self {
            registry,
            publisher,
            leadership,
            scope: scope.into(),
            platform,
            active_sessions,
        }
    }

    /// Records user interaction. Last write wins.
    pub async fn update_session_activity(&self, session_id: &str) -> Result<(), RegistryError> {
        let mut session = self.registry.get_session(&self.scope, session_id).await?;
        session.last_activity = Some(Utc::now());
        self.registry
            .update_session_status(&self.scope, &session)
            .await
    }

    pub async fn activity_status(&self, session_id: &str) -> Result<ActivityStatus, RegistryError> {
        let session = self.registry.get_session(&self.scope, session_id).await?;
        Ok(evaluate(&session, Utc::now()))
    }

    /// Re-reads the session and hibernates it only if it is still running,
    /// still past the grace window, and this replica still leads.
    pub async fn hibernate_if_idle(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<HibernateOutcome, RegistryError> {
        let mut session = self.registry.get_session(&self.scope, session_id).await?;
        if session.state != SessionState::Running || !evaluate(&session, now).should_hibernate {
            debug!(session_id, "hibernation window closed");
            return Ok(HibernateOutcome::Skipped);
        }
        if !self.leadership.is_leader() {
            debug!(session_id, "leadership lost before hibernation");
            return Ok(HibernateOutcome::Skipped);
        }
        session.state = SessionState::Hibernated;
        self.registry.update_session(&self.scope, &session).await?;
        info!(session_id, user = %session.user_id, "idle session hibernated");

        publish_best_effort(
            self.publisher.as_ref(),
            LifecycleKind::Hibernate,
            SessionLifecycleEvent::new(
                session.session_id.clone(),
                session.user_id.clone(),
                self.platform.as_str(),
            ),
        )
        .await;
        Ok(HibernateOutcome::Hibernated)
    }

    /// One idle-monitor pass. Per-session failures are logged and skipped.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickSummary, RegistryError> {
        let sessions = self.registry.list_sessions(&self.scope).await?;
        let running: Vec<SessionRecord> = sessions
            .into_iter()
            .filter(|s| s.state == SessionState::Running)
            .collect();
        let mut summary = TickSummary {
            running: running.len() as u32,
            ..TickSummary::default()
        };
        self.active_sessions.store(summary.running, Ordering::Relaxed);

        if !self.leadership.is_leader() {
            return Ok(summary);
        }

        for session in running.iter().filter(|s| has_idle_timeout(s)) {
            summary.evaluated += 1;
            metrics::IDLE_EVALUATIONS.inc();
            let status = evaluate(session, now);
            if status.is_idle {
                summary.idle += 1;
            }
            if !status.should_hibernate {
                continue;
            }
            match self.hibernate_if_idle(&session.session_id, now).await {
                Ok(HibernateOutcome::Hibernated) => {
                    summary.hibernated += 1;
                    metrics::HIBERNATIONS.with_label_values(&["hibernated"]).inc();
                }
                Ok(HibernateOutcome::Skipped) => {
                    metrics::HIBERNATIONS.with_label_values(&["skipped"]).inc();
                }
                Err(err) => {
                    summary.errors += 1;
                    metrics::HIBERNATIONS.with_label_values(&["error"]).inc();
                    warn!(
                        error = %err,
                        session_id = %session.session_id,
                        "idle hibernation failed"
                    );
                }
            }
        }
        Ok(summary)
    }

    pub fn spawn_idle_monitor(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = interval.as_secs(),
                scope = %self.scope,
                "idle monitor started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let tick = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = self.run_tick(Utc::now()) => res,
                };
                match tick {
                    Ok(summary) if summary.evaluated > 0 => debug!(
                        running = summary.running,
                        evaluated = summary.evaluated,
                        idle = summary.idle,
                        hibernated = summary.hibernated,
                        errors = summary.errors,
                        "idle tick complete"
                    ),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "idle tick could not list sessions"),
                }
            }
            info!("idle monitor stopped");
        })
    }
}

fn has_idle_timeout(session: &SessionRecord) -> bool {
    session
        .idle_timeout
        .as_deref()
        .and_then(parse_idle_timeout)
        .is_some()
}
