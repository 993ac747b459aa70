use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static BOOT_COUNTER: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new("fleet_agent_boot_total", "agent boots"))
        .expect("metric opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// One series per state, set to 1 for the current state.
pub static CONNECTION_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new(
            "fleet_agent_connection_state",
            "control-plane connection state (1 = current)",
        ),
        &["state"],
    )
    .expect("metric opts");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static CONNECTION_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_agent_connection_transitions_total",
            "control-plane connection state transitions by target state",
        ),
        &["state"],
    )
    .expect("metric opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECONNECT_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "fleet_agent_reconnect_attempts_total",
        "reconnect attempts after backoff",
    ))
    .expect("metric opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static HEARTBEATS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_agent_heartbeats_total",
            "heartbeat ticks by result",
        ),
        &["result"],
    )
    .expect("metric opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_agent_commands_total",
            "commands handled by action and outcome",
        ),
        &["action", "outcome"],
    )
    .expect("metric opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static IS_LEADER: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "fleet_agent_is_leader",
        "1 while this replica holds the lease",
    ))
    .expect("metric opts");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static LEADERSHIP_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_agent_leadership_transitions_total",
            "leadership transitions by direction",
        ),
        &["transition"],
    )
    .expect("metric opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static IDLE_EVALUATIONS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "fleet_agent_idle_evaluations_total",
        "sessions evaluated by the idle monitor",
    ))
    .expect("metric opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static HIBERNATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_agent_hibernations_total",
            "idle hibernation attempts by outcome",
        ),
        &["outcome"],
    )
    .expect("metric opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static EVENTS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fleet_agent_events_published_total",
            "lifecycle events by kind and result",
        ),
        &["kind", "result"],
    )
    .expect("metric opts");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}
