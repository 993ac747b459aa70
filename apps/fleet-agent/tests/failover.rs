use std::sync::Arc;
use std::time::Duration;

use fleet_agent::leader::{ElectionConfig, LeaderCallbacks, LeaderElector, Leadership};
use fleet_agent::lease_file::FileLeaseStore;
use fleet_sdk::lease::{InMemoryLeaseStore, LeaseStore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const LEASE: &str = "fleet:docker-prod";

fn config(identity: &str) -> ElectionConfig {
    ElectionConfig {
        lease_name: LEASE.into(),
        identity: identity.into(),
        lease_duration: Duration::from_secs(15),
        renew_deadline: Duration::from_secs(10),
        retry_period: Duration::from_secs(2),
    }
}

struct Replica {
    leadership: Leadership,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn start(identity: &str, store: Arc<dyn LeaseStore>) -> Replica {
    let leadership = Leadership::new();
    let elector = LeaderElector::new(config(identity), store, leadership.clone());
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            elector
                .run(cancel, LeaderCallbacks::default())
                .await
                .expect("election runs");
        })
    };
    Replica {
        leadership,
        cancel,
        task,
    }
}

#[tokio::test(start_paused = true)]
async fn exactly_one_replica_leads() {
    let store = InMemoryLeaseStore::new();
    let a = start("pod-a", store.clone());
    assert!(a.leadership.wait_for_leadership().await);
    let b = start("pod-b", store.clone());

    for _ in 0..30 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(a.leadership.is_leader());
        assert!(!b.leadership.is_leader());
    }
    assert_eq!(b.leadership.leader_identity().as_deref(), Some("pod-a"));

    a.cancel.cancel();
    b.cancel.cancel();
    a.task.await.unwrap();
    b.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn graceful_release_hands_over_within_a_retry_period() {
    let store = InMemoryLeaseStore::new();
    let a = start("pod-a", store.clone());
    assert!(a.leadership.wait_for_leadership().await);
    let b = start("pod-b", store.clone());
    tokio::time::sleep(Duration::from_secs(5)).await;

    let released_at = Instant::now();
    a.cancel.cancel();
    a.task.await.unwrap();
    assert!(!a.leadership.is_leader());

    assert!(b.leadership.wait_for_leadership().await);
    assert!(released_at.elapsed() <= Duration::from_secs(2));
    assert_eq!(store.current_holder(LEASE).await.unwrap().as_deref(), Some("pod-b"));

    b.cancel.cancel();
    b.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn crashed_leader_is_replaced_after_lease_expiry() {
    let store = InMemoryLeaseStore::new();
    let a = start("pod-a", store.clone());
    assert!(a.leadership.wait_for_leadership().await);
    let b = start("pod-b", store.clone());
    tokio::time::sleep(Duration::from_secs(3)).await;

    // Abort without releasing: the lease must lapse on its own.
    let crashed_at = Instant::now();
    a.task.abort();
    let _ = a.task.await;

    assert!(b.leadership.wait_for_leadership().await);
    let takeover = crashed_at.elapsed();
    assert!(takeover <= Duration::from_secs(15 + 2), "took {takeover:?}");

    b.cancel.cancel();
    b.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn file_lock_passes_to_a_sibling_when_the_holder_dies() {
    let dir = std::env::temp_dir().join(format!(
        "fleet-agent-failover-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis()
    ));
    let a = start("pod-a", Arc::new(FileLeaseStore::open(&dir).unwrap()));
    assert!(a.leadership.wait_for_leadership().await);
    let b = start("pod-b", Arc::new(FileLeaseStore::open(&dir).unwrap()));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!b.leadership.is_leader());
    assert_eq!(b.leadership.leader_identity().as_deref(), Some("pod-a"));

    // Aborting drops pod-a's store and closes its lock file.
    let crashed_at = Instant::now();
    a.task.abort();
    let _ = a.task.await;

    assert!(b.leadership.wait_for_leadership().await);
    assert!(crashed_at.elapsed() <= Duration::from_secs(2));

    b.cancel.cancel();
    b.task.await.unwrap();
    let _ = std::fs::remove_dir_all(dir);
}
