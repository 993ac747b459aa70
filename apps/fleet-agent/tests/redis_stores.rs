//! Exercises the redis adapters against a live server.
//! Run with `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use fleet_agent::command_redis::RedisCommandStore;
use fleet_agent::lease_redis::RedisLeaseStore;
use fleet_agent::redis_store::RedisHandle;
use fleet_agent::registry_redis::RedisSessionRegistry;
use fleet_sdk::command::{CommandRecord, CommandStatus, CommandStore, InsertOutcome, StatusUpdate};
use fleet_sdk::lease::LeaseStore;
use fleet_sdk::session::{RegistryError, SessionRecord, SessionRegistry, SessionState};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn redis() -> Option<Arc<RedisHandle>> {
    let url = std::env::var("REDIS_URL").ok()?;
    RedisHandle::open(&url).ok().map(Arc::new)
}

fn unique_id(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{name}-{nanos}")
}

#[tokio::test]
#[ignore]
async fn lease_is_exclusive_and_expires() -> TestResult {
    let Some(redis) = redis() else { return Ok(()) };
    let store = RedisLeaseStore::new(redis);
    let lease = unique_id("lease");
    let ttl = Duration::from_millis(500);

    assert!(store.try_acquire(&lease, "pod-a", ttl).await?);
    assert!(!store.try_acquire(&lease, "pod-b", ttl).await?);
    assert!(store.try_acquire(&lease, "pod-a", ttl).await?);
    assert!(store.renew(&lease, "pod-a", ttl).await?);
    assert!(!store.renew(&lease, "pod-b", ttl).await?);
    assert_eq!(store.current_holder(&lease).await?.as_deref(), Some("pod-a"));

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(store.current_holder(&lease).await?, None);
    assert!(store.try_acquire(&lease, "pod-b", ttl).await?);
    assert!(!store.release(&lease, "pod-a").await?);
    assert!(store.release(&lease, "pod-b").await?);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn activity_updates_leave_state_alone() -> TestResult {
    let Some(redis) = redis() else { return Ok(()) };
    let registry = RedisSessionRegistry::new(redis);
    let scope = unique_id("scope");

    let mut session = SessionRecord::new("s1", "alice");
    session.state = SessionState::Running;
    session.idle_timeout = Some("30m".into());
    registry.update_session(&scope, &session).await?;

    // A concurrent writer hibernates the session.
    let mut hibernated = session.clone();
    hibernated.state = SessionState::Hibernated;
    registry.update_session(&scope, &hibernated).await?;

    let mut touched = session.clone();
    touched.last_activity = Some(Utc::now());
    registry.update_session_status(&scope, &touched).await?;

    let stored = registry.get_session(&scope, "s1").await?;
    assert_eq!(stored.state, SessionState::Hibernated);
    assert!(stored.last_activity.is_some());
    assert_eq!(registry.list_sessions(&scope).await?.len(), 1);

    let missing = registry
        .update_session_status(&scope, &SessionRecord::new("nope", "bob"))
        .await;
    assert!(matches!(missing, Err(RegistryError::NotFound(_))));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn command_records_deduplicate_and_report_once() -> TestResult {
    let Some(redis) = redis() else { return Ok(()) };
    let store = RedisCommandStore::new(redis);
    let id = unique_id("cmd");

    let first = store
        .insert_if_absent(CommandRecord::received(&id, "create_session"))
        .await?;
    assert_eq!(first, InsertOutcome::Inserted);
    let second = store
        .insert_if_absent(CommandRecord::received(&id, "create_session"))
        .await?;
    assert!(matches!(second, InsertOutcome::Existing(_)));

    store.advance(&id, StatusUpdate::running()).await?;
    let done = store.advance(&id, StatusUpdate::succeeded(None)).await?;
    assert_eq!(done.status, CommandStatus::Succeeded);
    assert!(store.advance(&id, StatusUpdate::running()).await.is_err());

    assert!(store.mark_reported(&id).await?);
    assert!(!store.mark_reported(&id).await?);

    store.clear_reported(&id).await?;
    assert!(store.mark_reported(&id).await?);
    Ok(())
}
