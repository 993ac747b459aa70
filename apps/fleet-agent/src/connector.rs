//! Persistent channel to the control plane.
//!
//! `disconnected -> connecting -> authenticating -> connected -> disconnected`,
//! retried forever with the configured backoff until the agent shuts down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleet_sdk::identity::Platform;
use fleet_sdk::protocol::{
    AgentCapacity, AgentFrame, CommandMessage, HeartbeatPayload, RegistrationRequest, ServerFrame,
};
use fleet_sdk::{ControlPlaneClient, API_KEY_HEADER, CONNECT_PATH};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::ConnectionError;
use crate::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_BUFFER: usize = 1024;
const DEFAULT_MISSED_HEARTBEAT_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
        }
    }

    const ALL: [ConnectionState; 4] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Authenticating,
        ConnectionState::Connected,
    ];
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// `ws(s)://host[:port]` of the control plane.
    pub control_plane_url: String,
    pub api_key: String,
    pub agent_id: String,
    pub platform: Platform,
    pub region: Option<String>,
    pub capacity: AgentCapacity,
    pub instance_name: String,
    pub heartbeat_interval: Duration,
    pub backoff: Vec<Duration>,
    pub missed_heartbeat_limit: u32,
}

impl ConnectorConfig {
    pub fn new(
        control_plane_url: impl Into<String>,
        api_key: impl Into<String>,
        agent_id: impl Into<String>,
        platform: Platform,
    ) -> Self {
        Self {
            control_plane_url: control_plane_url.into(),
            api_key: api_key.into(),
            agent_id: agent_id.into(),
            platform,
            region: None,
            capacity: AgentCapacity::default(),
            instance_name: String::new(),
            heartbeat_interval: Duration::from_secs(10),
            backoff: [2, 4, 8, 16, 32].map(Duration::from_secs).to_vec(),
            missed_heartbeat_limit: DEFAULT_MISSED_HEARTBEAT_LIMIT,
        }
    }

    fn connect_url(&self) -> String {
        format!(
            "{}{}?agent_id={}",
            self.control_plane_url.trim_end_matches('/'),
            CONNECT_PATH,
            self.agent_id
        )
    }
}

/// Sending half for frames bound to the control plane. Frames queue while the
/// channel is down and flush after the next successful connect.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<AgentFrame>,
}

impl Outbound {
    pub fn send(&self, frame: AgentFrame) -> Result<(), ConnectionError> {
        self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ConnectionError::OutboundFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::NotConnected,
        })
    }

    /// Detached outbound queue, for components exercised without a connector.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AgentFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

/// Cloneable view of a running connector.
#[derive(Clone)]
pub struct ConnectorHandle {
    state: watch::Receiver<ConnectionState>,
    outbound: Outbound,
}

impl ConnectorHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }
}

pub struct Connector {
    config: ConnectorConfig,
    client: ControlPlaneClient,
    state_tx: watch::Sender<ConnectionState>,
    outbound_rx: mpsc::Receiver<AgentFrame>,
    commands: mpsc::Sender<CommandMessage>,
    active_sessions: Arc<AtomicU32>,
    /// Dequeued frame whose write failed; written first on the next connection.
    unsent: Option<AgentFrame>,
}

impl Connector {
    /// `commands` receives every decoded command in arrival order.
    /// `active_sessions` feeds the heartbeat payload.
    pub fn new(
        config: ConnectorConfig,
        http: reqwest::Client,
        commands: mpsc::Sender<CommandMessage>,
        active_sessions: Arc<AtomicU32>,
    ) -> (Self, ConnectorHandle) {
        let client = ControlPlaneClient::new(
            http,
            fleet_sdk::http_base_from_ws(&config.control_plane_url),
            config.api_key.clone(),
        );
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (outbound, outbound_rx) = Outbound::channel(OUTBOUND_BUFFER);
        let handle = ConnectorHandle {
            state: state_rx,
            outbound,
        };
        (
            Self {
                config,
                client,
                state_tx,
                outbound_rx,
                commands,
                active_sessions,
                unsent: None,
            },
            handle,
        )
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        info!(
            agent_id = %self.config.agent_id,
            url = %self.config.control_plane_url,
            "control plane connector started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.connect() => res,
            };
            match attempt {
                Ok(ws) => {
                    backoff.reset();
                    match self.serve(ws, &cancel).await {
                        Ok(()) => break,
                        Err(err) => warn!(error = %err, "control plane connection lost"),
                    }
                }
                Err(err) => warn!(error = %err, "control plane connect failed"),
            }
            self.set_state(ConnectionState::Disconnected);

            let delay = backoff.next_delay();
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.failures(),
                "reconnecting after backoff"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            metrics::RECONNECT_ATTEMPTS.inc();
        }
        self.set_state(ConnectionState::Disconnected);
        info!("control plane connector stopped");
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = next.as_str(), "connection state changed");
            metrics::CONNECTION_TRANSITIONS
                .with_label_values(&[next.as_str()])
                .inc();
            for state in ConnectionState::ALL {
                metrics::CONNECTION_STATE
                    .with_label_values(&[state.as_str()])
                    .set(i64::from(state == next));
            }
        }
    }

    async fn connect(&self) -> Result<WsStream, ConnectionError> {
        self.set_state(ConnectionState::Connecting);
        let request = RegistrationRequest {
            agent_id: self.config.agent_id.clone(),
            platform: self.config.platform,
            region: self.config.region.clone(),
            capacity: Some(self.config.capacity),
            metadata: HashMap::from([(
                "instance".to_string(),
                serde_json::Value::String(self.config.instance_name.clone()),
            )]),
        };
        let registered = self
            .client
            .register_agent(&request)
            .await
            .map_err(|e| ConnectionError::RegistrationFailed(e.to_string()))?;
        debug!(id = %registered.id, status = %registered.status, "agent registered");

        self.set_state(ConnectionState::Authenticating);
        let mut upgrade = self
            .config
            .connect_url()
            .into_client_request()
            .map_err(|e| ConnectionError::WebSocketUpgrade(e.to_string()))?;
        let key = HeaderValue::from_str(&self.config.api_key)
            .map_err(|e| ConnectionError::WebSocketUpgrade(e.to_string()))?;
        upgrade.headers_mut().insert(API_KEY_HEADER, key);
        let (ws, _) = connect_async(upgrade)
            .await
            .map_err(|e| ConnectionError::WebSocketUpgrade(e.to_string()))?;
        Ok(ws)
    }

    /// Drives one connected session. `Ok` means the agent is shutting down.
    async fn serve(
        &mut self,
        ws: WsStream,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connected);
        info!(agent_id = %self.config.agent_id, "connected to control plane");
        let (mut sink, mut stream) = ws.split();
        if let Some(frame) = self.unsent.take() {
            debug!(frame = frame.kind(), "resending frame lost with the previous connection");
            self.write_outbound(&mut sink, frame).await?;
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound_since_tick = true;
        let mut missed = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                incoming = stream.next() => {
                    let msg = match incoming {
                        Some(Ok(msg)) => msg,
                        Some(Err(err)) => return Err(ConnectionError::ConnectionClosed(err.to_string())),
                        None => return Err(ConnectionError::ConnectionClosed("stream ended".into())),
                    };
                    inbound_since_tick = true;
                    missed = 0;
                    match msg {
                        Message::Text(text) => {
                            if let Some(reply) = self.handle_text(&text, cancel).await {
                                send_frame(&mut sink, &reply).await?;
                            }
                        }
                        Message::Close(frame) => {
                            let reason = frame
                                .map(|f| f.reason.as_str().to_string())
                                .unwrap_or_else(|| "closed by control plane".into());
                            return Err(ConnectionError::ConnectionClosed(reason));
                        }
                        Message::Binary(_) => debug!("ignoring binary frame"),
                        _ => {}
                    }
                }
                Some(frame) = self.outbound_rx.recv() => {
                    self.write_outbound(&mut sink, frame).await?;
                }
                _ = heartbeat.tick() => {
                    if inbound_since_tick {
                        missed = 0;
                    } else {
                        missed += 1;
                        metrics::HEARTBEATS.with_label_values(&["missed"]).inc();
                        warn!(missed, limit = self.config.missed_heartbeat_limit, "heartbeat not acknowledged");
                        if missed >= self.config.missed_heartbeat_limit {
                            return Err(ConnectionError::ConnectionClosed(format!(
                                "{missed} heartbeats without acknowledgement"
                            )));
                        }
                    }
                    inbound_since_tick = false;
                    send_frame(&mut sink, &self.heartbeat_frame()).await?;
                    sink.send(Message::Ping(Bytes::new()))
                        .await
                        .map_err(|e| ConnectionError::ConnectionClosed(e.to_string()))?;
                    metrics::HEARTBEATS.with_label_values(&["sent"]).inc();
                }
            }
        }
    }

    /// Handles one text frame. Returns an immediate reply, if any.
    async fn handle_text(&self, text: &str, cancel: &CancellationToken) -> Option<AgentFrame> {
        let frame = match ServerFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                return None;
            }
        };
        match frame {
            ServerFrame::Command(cmd) => {
                debug!(command_id = %cmd.command_id, action = %cmd.action, "command received");
                if self.commands.send(cmd).await.is_err() {
                    warn!("dispatcher stopped; command dropped");
                }
                None
            }
            ServerFrame::Ping => Some(AgentFrame::Pong),
            ServerFrame::Shutdown { reason } => {
                info!(reason = reason.as_deref().unwrap_or(""), "shutdown requested by control plane");
                cancel.cancel();
                Some(AgentFrame::ShutdownAck)
            }
            ServerFrame::Unknown(kind) => {
                debug!(kind = %kind, "ignoring unknown frame type");
                None
            }
        }
    }

    async fn write_outbound<S>(&mut self, sink: &mut S, frame: AgentFrame) -> Result<(), ConnectionError>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let sent = send_frame(sink, &frame).await;
        if sent.is_err() {
            self.unsent = Some(frame);
        }
        sent
    }

    fn heartbeat_frame(&self) -> AgentFrame {
        AgentFrame::Heartbeat(HeartbeatPayload {
            status: "online".into(),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            capacity: self.config.capacity,
        })
    }
}

async fn send_frame<S>(sink: &mut S, frame: &AgentFrame) -> Result<(), ConnectionError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = frame
        .encode()
        .map_err(|e| ConnectionError::ConnectionClosed(e.to_string()))?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| ConnectionError::ConnectionClosed(e.to_string()))
}
