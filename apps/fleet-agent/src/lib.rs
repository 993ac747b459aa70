//! Fleet agent: keeps a control-plane channel open, executes session
//! commands on the elected leader replica, and hibernates idle sessions.

pub mod activity;
pub mod agent;
pub mod backoff;
pub mod command_redis;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod leader;
pub mod lease_file;
pub mod lease_redis;
pub mod metrics;
pub mod probe;
pub mod publisher;
pub mod redis_store;
pub mod registry_redis;
pub mod telemetry;
