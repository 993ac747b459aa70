use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use fleet_sdk::identity::{AgentIdentity, InvalidPlatform, Platform};
use fleet_sdk::protocol::AgentCapacity;
use thiserror::Error;

use crate::error::validate_election_timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Memory,
    Redis,
}

/// Where the leader lease lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ElectionBackend {
    Memory,
    Redis,
    /// `flock` on a shared directory; replicas must run on one host.
    File,
}

#[derive(Debug, Parser)]
#[command(
    name = "fleet-agent",
    author,
    version,
    about = "Fleet agent managing sessions on behalf of the control plane"
)]
pub struct Cli {
    /// Shared agent identity, `{platform}-{env}-{region}`.
    #[arg(long, env = "AGENT_ID")]
    pub agent_id: Option<String>,

    /// Control-plane channel address (`ws://` or `wss://`).
    #[arg(long, env = "CONTROL_PLANE_URL")]
    pub control_plane_url: Option<String>,

    /// Pre-shared credential presented on registration and upgrade.
    #[arg(long, env = "AGENT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "PLATFORM", default_value = "docker")]
    pub platform: String,

    #[arg(long, env = "REGION")]
    pub region: Option<String>,

    /// Session registry scope.
    #[arg(long, env = "NAMESPACE", default_value = "fleet")]
    pub namespace: String,

    /// Election candidate identity; falls back to `HOSTNAME`.
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    /// Comma separated reconnect delays in seconds.
    #[arg(long, env = "RECONNECT_BACKOFF_SECS", default_value = "2,4,8,16,32")]
    pub reconnect_backoff_secs: String,

    /// Millicores.
    #[arg(long, env = "MAX_CPU", default_value_t = 100_000)]
    pub max_cpu: u32,

    /// Gigabytes.
    #[arg(long, env = "MAX_MEMORY", default_value_t = 128)]
    pub max_memory: u32,

    #[arg(long, env = "MAX_SESSIONS", default_value_t = 100)]
    pub max_sessions: u32,

    #[arg(long, env = "ENABLE_HA", default_value_t = false)]
    pub enable_ha: bool,

    #[arg(long, env = "LEADER_ELECTION_BACKEND", value_enum, default_value = "memory")]
    pub leader_election_backend: ElectionBackend,

    /// Directory for lock files when the election backend is `file`.
    #[arg(long, env = "LOCK_DIR", default_value = "/var/run/fleet-agent")]
    pub lock_dir: PathBuf,

    /// Backend for the session registry, command status and events.
    #[arg(long, env = "STATE_BACKEND", value_enum, default_value = "memory")]
    pub state_backend: Backend,

    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "LEASE_DURATION_SECS", default_value_t = 15)]
    pub lease_duration_secs: u64,

    #[arg(long, env = "RENEW_DEADLINE_SECS", default_value_t = 10)]
    pub renew_deadline_secs: u64,

    #[arg(long, env = "RETRY_PERIOD_SECS", default_value_t = 2)]
    pub retry_period_secs: u64,

    #[arg(long, env = "IDLE_CHECK_INTERVAL_SECS", default_value_t = 60)]
    pub idle_check_interval_secs: u64,

    #[arg(long, env = "MAX_CONCURRENT_COMMANDS", default_value_t = 4)]
    pub max_concurrent_commands: usize,

    /// Optional listener for `/healthz` and `/metrics`.
    #[arg(long, env = "PROBE_ADDR")]
    pub probe_addr: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid control plane url {value}: {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error(transparent)]
    InvalidPlatform(#[from] InvalidPlatform),
    #[error("invalid reconnect backoff {0:?}: expected non-decreasing positive seconds, comma separated")]
    InvalidBackoff(String),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("invalid leader election timing: {0}")]
    InvalidTiming(String),
    #[error("{0} backend requires REDIS_URL")]
    MissingRedisUrl(&'static str),
    #[error("invalid probe address {0}")]
    InvalidProbeAddr(String),
}

#[derive(Debug, Clone)]
pub struct ElectionSettings {
    pub enabled: bool,
    pub backend: ElectionBackend,
    pub lock_dir: PathBuf,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

/// Validated agent configuration. Built once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub identity: AgentIdentity,
    pub control_plane_url: String,
    pub api_key: String,
    pub region: Option<String>,
    pub namespace: String,
    pub heartbeat_interval: Duration,
    pub reconnect_backoff: Vec<Duration>,
    pub capacity: AgentCapacity,
    pub election: ElectionSettings,
    pub state_backend: Backend,
    pub redis_url: Option<String>,
    pub idle_check_interval: Duration,
    pub max_concurrent_commands: usize,
    pub probe_addr: Option<SocketAddr>,
    pub log_filter: String,
}

impl AgentConfig {
    /// Lease name: one lease per agent identity within the namespace.
    pub fn lease_name(&self) -> String {
        format!("{}:{}", self.namespace, self.identity.agent_id())
    }
}

impl TryFrom<Cli> for AgentConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let agent_id = required(cli.agent_id, "AGENT_ID")?;
        let control_plane_url = required(cli.control_plane_url, "CONTROL_PLANE_URL")?;
        let api_key = required(cli.api_key, "AGENT_API_KEY")?;
        validate_channel_url(&control_plane_url)?;

        let platform: Platform = cli.platform.parse()?;
        let instance_name = cli
            .pod_name
            .filter(|v| !v.trim().is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| format!("{agent_id}-{}", std::process::id()));

        if cli.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ZeroValue("HEARTBEAT_INTERVAL_SECS"));
        }
        if cli.idle_check_interval_secs == 0 {
            return Err(ConfigError::ZeroValue("IDLE_CHECK_INTERVAL_SECS"));
        }
        if cli.max_concurrent_commands == 0 {
            return Err(ConfigError::ZeroValue("MAX_CONCURRENT_COMMANDS"));
        }
        let reconnect_backoff = parse_backoff(&cli.reconnect_backoff_secs)?;

        let election = ElectionSettings {
            enabled: cli.enable_ha,
            backend: cli.leader_election_backend,
            lock_dir: cli.lock_dir,
            lease_duration: Duration::from_secs(cli.lease_duration_secs),
            renew_deadline: Duration::from_secs(cli.renew_deadline_secs),
            retry_period: Duration::from_secs(cli.retry_period_secs),
        };
        validate_election_timing(
            election.lease_duration,
            election.renew_deadline,
            election.retry_period,
        )
        .map_err(|e| ConfigError::InvalidTiming(e.to_string()))?;

        let redis_url = cli.redis_url.filter(|v| !v.trim().is_empty());
        if election.enabled && election.backend == ElectionBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl("LEADER_ELECTION_BACKEND"));
        }
        if cli.state_backend == Backend::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl("STATE_BACKEND"));
        }

        let probe_addr = cli
            .probe_addr
            .filter(|v| !v.trim().is_empty())
            .map(|v| {
                v.parse::<SocketAddr>()
                    .map_err(|_| ConfigError::InvalidProbeAddr(v.clone()))
            })
            .transpose()?;

        Ok(AgentConfig {
            identity: AgentIdentity::new(agent_id, platform, instance_name),
            control_plane_url: control_plane_url.trim_end_matches('/').to_string(),
            api_key,
            region: cli.region.filter(|v| !v.is_empty()),
            namespace: cli.namespace,
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
            reconnect_backoff,
            capacity: AgentCapacity {
                max_cpu: cli.max_cpu,
                max_memory: cli.max_memory,
                max_sessions: cli.max_sessions,
            },
            election,
            state_backend: cli.state_backend,
            redis_url,
            idle_check_interval: Duration::from_secs(cli.idle_check_interval_secs),
            max_concurrent_commands: cli.max_concurrent_commands,
            probe_addr,
            log_filter: cli.log_filter,
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn validate_channel_url(value: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(ConfigError::InvalidUrl {
            value: value.to_string(),
            reason: "scheme must be ws or wss".into(),
        });
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(ConfigError::InvalidUrl {
            value: value.to_string(),
            reason: "missing host".into(),
        });
    }
    Ok(())
}

/// Parses `"2,4,8"` into second durations. Entries must be positive integers
/// that never decrease.
pub fn parse_backoff(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    let steps = raw
        .split(',')
        .map(|part| match part.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::InvalidBackoff(raw.to_string())),
        })
        .collect::<Result<Vec<_>, _>>()?;
    if steps.is_empty() || steps.windows(2).any(|pair| pair[1] < pair[0]) {
        return Err(ConfigError::InvalidBackoff(raw.to_string()));
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "fleet-agent",
            "--agent-id",
            "docker-prod-us-east-1",
            "--control-plane-url",
            "wss://control.example.com",
            "--api-key",
            "secret",
            "--pod-name",
            "agent-0",
        ]
    }

    fn parse(args: Vec<&str>) -> Result<AgentConfig, ConfigError> {
        AgentConfig::try_from(Cli::try_parse_from(args).expect("cli parses"))
    }

    #[test]
    fn defaults_are_substituted() {
        let cfg = parse(base_args()).unwrap();
        assert_eq!(cfg.identity.agent_id(), "docker-prod-us-east-1");
        assert_eq!(cfg.identity.instance_name(), "agent-0");
        assert_eq!(cfg.identity.platform(), Platform::Docker);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(
            cfg.reconnect_backoff,
            parse_backoff("2,4,8,16,32").unwrap()
        );
        assert_eq!(cfg.election.lease_duration, Duration::from_secs(15));
        assert_eq!(cfg.election.renew_deadline, Duration::from_secs(10));
        assert_eq!(cfg.election.retry_period, Duration::from_secs(2));
        assert!(!cfg.election.enabled);
        assert_eq!(cfg.lease_name(), "fleet:docker-prod-us-east-1");
    }

    #[test]
    fn missing_identity_is_fatal() {
        let args = vec![
            "fleet-agent",
            "--control-plane-url",
            "wss://control.example.com",
            "--api-key",
            "secret",
        ];
        // AGENT_ID may be set in the environment running the tests.
        if std::env::var("AGENT_ID").is_err() {
            assert!(matches!(parse(args), Err(ConfigError::Missing("AGENT_ID"))));
        }
    }

    #[test]
    fn rejects_http_scheme() {
        let mut args = base_args();
        args[4] = "https://control.example.com";
        assert!(matches!(parse(args), Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn rejects_bad_backoff_and_timing() {
        assert!(parse_backoff("2,,8").is_err());
        assert!(parse_backoff("0").is_err());
        assert!(parse_backoff("x").is_err());
        assert!(matches!(parse_backoff("10,2"), Err(ConfigError::InvalidBackoff(_))));
        assert_eq!(parse_backoff("2,2,5").unwrap().len(), 3);

        let mut args = base_args();
        args.extend(["--renew-deadline-secs", "20"]);
        assert!(matches!(parse(args), Err(ConfigError::InvalidTiming(_))));
    }

    #[test]
    fn file_election_uses_lock_dir() {
        let mut args = base_args();
        args.extend([
            "--enable-ha",
            "--leader-election-backend",
            "file",
            "--lock-dir",
            "/tmp/fleet-locks",
        ]);
        let cfg = parse(args).unwrap();
        assert!(cfg.election.enabled);
        assert_eq!(cfg.election.backend, ElectionBackend::File);
        assert_eq!(cfg.election.lock_dir, PathBuf::from("/tmp/fleet-locks"));
    }

    #[test]
    fn redis_backends_need_url() {
        let mut args = base_args();
        args.extend(["--state-backend", "redis"]);
        if std::env::var("REDIS_URL").is_err() {
            assert!(matches!(
                parse(args),
                Err(ConfigError::MissingRedisUrl("STATE_BACKEND"))
            ));
        }
    }
}
