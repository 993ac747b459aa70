//! Wires the components together and owns the agent's lifetime.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_bus::LocalBus;
use fleet_sdk::command::{CommandStore, InMemoryCommandStore};
use fleet_sdk::lease::{InMemoryLeaseStore, LeaseStore};
use fleet_sdk::session::{InMemorySessionRegistry, SessionRegistry};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::activity::ActivityTracker;
use crate::command_redis::RedisCommandStore;
use crate::config::{AgentConfig, Backend, ElectionBackend};
use crate::connector::{Connector, ConnectorConfig};
use crate::dispatcher::Dispatcher;
use crate::error::ElectionError;
use crate::executor::{RegistryExecutor, SessionExecutor};
use crate::leader::{ElectionConfig, LeaderCallbacks, LeaderElector, Leadership};
use crate::lease_file::FileLeaseStore;
use crate::lease_redis::RedisLeaseStore;
use crate::probe::{self, ProbeState};
use crate::publisher::{BusEventPublisher, EventPublisher, RedisEventPublisher};
use crate::redis_store::RedisHandle;
use crate::registry_redis::RedisSessionRegistry;

const COMMAND_BUFFER: usize = 256;

/// Backing stores selected by configuration.
pub struct Stores {
    pub registry: Arc<dyn SessionRegistry>,
    pub commands: Arc<dyn CommandStore>,
    pub lease: Arc<dyn LeaseStore>,
    pub publisher: Arc<dyn EventPublisher>,
}

impl Stores {
    pub fn build(cfg: &AgentConfig) -> Result<Self> {
        let redis = match cfg.redis_url.as_deref() {
            Some(url) => Some(Arc::new(
                RedisHandle::open(url).context("open redis client")?,
            )),
            None => None,
        };

        let (registry, commands, publisher): (
            Arc<dyn SessionRegistry>,
            Arc<dyn CommandStore>,
            Arc<dyn EventPublisher>,
        ) = match (cfg.state_backend, redis.clone()) {
            (Backend::Redis, Some(redis)) => (
                Arc::new(RedisSessionRegistry::new(redis.clone())),
                Arc::new(RedisCommandStore::new(redis.clone())),
                Arc::new(RedisEventPublisher::new(redis)),
            ),
            (Backend::Redis, None) => anyhow::bail!("STATE_BACKEND=redis requires REDIS_URL"),
            (Backend::Memory, _) => (
                InMemorySessionRegistry::new(),
                InMemoryCommandStore::new(),
                Arc::new(BusEventPublisher::new(Arc::new(LocalBus::new()))),
            ),
        };

        let lease: Arc<dyn LeaseStore> = match (cfg.election.enabled, cfg.election.backend) {
            (false, _) => InMemoryLeaseStore::new(),
            (true, ElectionBackend::Memory) => {
                warn!("HA enabled with the in-memory lease; leadership is process-local");
                InMemoryLeaseStore::new()
            }
            (true, ElectionBackend::Redis) => {
                let redis = redis.ok_or_else(|| {
                    ElectionError::LeaseClient("LEADER_ELECTION_BACKEND=redis requires REDIS_URL".into())
                })?;
                Arc::new(RedisLeaseStore::new(redis))
            }
            (true, ElectionBackend::File) => Arc::new(
                FileLeaseStore::open(&cfg.election.lock_dir).map_err(ElectionError::from)?,
            ),
        };

        Ok(Self {
            registry,
            commands,
            lease,
            publisher,
        })
    }
}

/// Runs until ctrl-c, a control-plane shutdown, or a fatal election error.
pub async fn run(cfg: AgentConfig) -> Result<()> {
    let stores = Stores::build(&cfg)?;
    run_with(cfg, stores, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
}

pub async fn run_with(
    cfg: AgentConfig,
    stores: Stores,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let leadership = Leadership::new();
    let active_sessions = Arc::new(AtomicU32::new(0));
    let identity = cfg.identity.clone();
    let scope = cfg.namespace.clone();

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let mut connector_cfg = ConnectorConfig::new(
        cfg.control_plane_url.clone(),
        cfg.api_key.clone(),
        identity.agent_id(),
        identity.platform(),
    );
    connector_cfg.region = cfg.region.clone();
    connector_cfg.capacity = cfg.capacity;
    connector_cfg.instance_name = identity.instance_name().to_string();
    connector_cfg.heartbeat_interval = cfg.heartbeat_interval;
    connector_cfg.backoff = cfg.reconnect_backoff.clone();
    let (connector, connector_handle) = Connector::new(
        connector_cfg,
        reqwest::Client::new(),
        commands_tx,
        active_sessions.clone(),
    );

    let executor: Arc<dyn SessionExecutor> = Arc::new(RegistryExecutor::new(
        stores.registry.clone(),
        stores.publisher.clone(),
        scope.clone(),
        identity.agent_id(),
        identity.platform(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        leadership.clone(),
        stores.commands.clone(),
        executor,
        connector_handle.outbound(),
        cfg.max_concurrent_commands,
    ));
    let tracker = Arc::new(ActivityTracker::new(
        stores.registry.clone(),
        stores.publisher.clone(),
        leadership.clone(),
        scope,
        identity.platform(),
        active_sessions.clone(),
    ));
    let elector = LeaderElector::new(
        ElectionConfig {
            lease_name: cfg.lease_name(),
            identity: identity.instance_name().to_string(),
            lease_duration: cfg.election.lease_duration,
            renew_deadline: cfg.election.renew_deadline,
            retry_period: cfg.election.retry_period,
        },
        stores.lease.clone(),
        leadership.clone(),
    );

    info!(
        agent_id = %identity.agent_id(),
        platform = identity.platform().as_str(),
        instance = %identity.instance_name(),
        ha = cfg.election.enabled,
        election_backend = ?cfg.election.backend,
        state_backend = ?cfg.state_backend,
        max_concurrent_commands = cfg.max_concurrent_commands,
        "starting fleet agent"
    );

    let callbacks = LeaderCallbacks::new(
        || info!("leading: commands execute and idle sessions are evaluated here"),
        || info!("standby: commands are deferred to the leader"),
    );
    let mut election = {
        let cancel = cancel.clone();
        tokio::spawn(async move { elector.run(cancel, callbacks).await })
    };
    let connector_task = connector.spawn(cancel.clone());
    let dispatcher_task = dispatcher.spawn(commands_rx, cancel.clone());
    let monitor_task = tracker.spawn_idle_monitor(cfg.idle_check_interval, cancel.clone());
    let probe_task = cfg.probe_addr.map(|addr| {
        let state = ProbeState {
            agent_id: identity.agent_id().to_string(),
            connector: connector_handle.clone(),
            leadership: leadership.clone(),
            active_sessions: active_sessions.clone(),
        };
        tokio::spawn(probe::serve(addr, state, cancel.clone()))
    });

    let mut finished_election = None;
    tokio::select! {
        _ = shutdown => info!("interrupt received; shutting down"),
        _ = cancel.cancelled() => info!("shutdown requested by control plane"),
        joined = &mut election => finished_election = Some(joined),
    }
    cancel.cancel();

    let joined = match finished_election {
        Some(joined) => joined,
        None => election.await,
    };
    for (name, task) in [
        ("connector", connector_task),
        ("dispatcher", dispatcher_task),
        ("idle monitor", monitor_task),
    ] {
        if let Err(err) = task.await {
            error!(task = name, error = %err, "background task panicked");
        }
    }
    if let Some(task) = probe_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "probe server failed"),
            Err(err) => error!(task = "probe", error = %err, "background task panicked"),
        }
    }

    let election = joined.context("leader election task panicked")?;
    if let Err(err) = election {
        error!(error = %err, "leader election failed; refusing to act without a lease");
        return Err(err).context("leader election failed");
    }
    info!("fleet agent stopped");
    Ok(())
}
