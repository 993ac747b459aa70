//! Turns control-plane commands into executor calls.
//!
//! Every command is acknowledged. Only the leader persists and executes;
//! standbys answer with `deferred`. The command store deduplicates by
//! `commandId`, so redelivery never executes or reports twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_sdk::command::{
    CommandAction, CommandRecord, CommandStatus, CommandStore, InsertOutcome, StatusUpdate,
};
use fleet_sdk::protocol::{AgentFrame, CommandMessage, CreateSessionPayload, SessionRefPayload};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::Outbound;
use crate::error::CommandError;
use crate::executor::{ExecutionReport, ExecutorError, SessionExecutor};
use crate::leader::Leadership;
use crate::metrics;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A command with its payload decoded for the action it names.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Create(CreateSessionPayload),
    Terminate(SessionRefPayload),
    Hibernate(SessionRefPayload),
    Resume(SessionRefPayload),
}

impl SessionCommand {
    pub fn parse(action: &str, payload: &Value) -> Result<Self, CommandError> {
        let action: CommandAction = action
            .parse()
            .map_err(|e: fleet_sdk::command::UnknownAction| CommandError::UnknownCommand(e.0))?;
        match action {
            CommandAction::CreateSession => {
                let req: CreateSessionPayload = decode(payload)?;
                require("sessionId", &req.session_id)?;
                require("user", &req.user)?;
                require("template", &req.template)?;
                Ok(SessionCommand::Create(req))
            }
            CommandAction::TerminateSession => Ok(SessionCommand::Terminate(session_ref(payload)?)),
            CommandAction::HibernateSession => Ok(SessionCommand::Hibernate(session_ref(payload)?)),
            CommandAction::ResumeSession => Ok(SessionCommand::Resume(session_ref(payload)?)),
        }
    }

    pub fn action(&self) -> CommandAction {
        match self {
            SessionCommand::Create(_) => CommandAction::CreateSession,
            SessionCommand::Terminate(_) => CommandAction::TerminateSession,
            SessionCommand::Hibernate(_) => CommandAction::HibernateSession,
            SessionCommand::Resume(_) => CommandAction::ResumeSession,
        }
    }
}

fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T, CommandError> {
    serde_json::from_value(payload.clone()).map_err(|e| CommandError::InvalidPayload(e.to_string()))
}

fn require(field: &str, value: &str) -> Result<(), CommandError> {
    if value.trim().is_empty() {
        return Err(CommandError::InvalidPayload(format!("{field} is required")));
    }
    Ok(())
}

fn session_ref(payload: &Value) -> Result<SessionRefPayload, CommandError> {
    let target: SessionRefPayload = decode(payload)?;
    require("sessionId", &target.session_id)?;
    Ok(target)
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Executed and reported `complete`.
    Succeeded,
    /// Reported `failed` with this cause.
    Failed(CommandError),
    /// Not executed on this replica; `deferred` was sent.
    Deferred,
    /// Already handled under the same `commandId`.
    Duplicate,
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Succeeded => "succeeded",
            DispatchOutcome::Failed(_) => "failed",
            DispatchOutcome::Deferred => "deferred",
            DispatchOutcome::Duplicate => "duplicate",
        }
    }
}

type CommandLock = Arc<tokio::sync::Mutex<()>>;

pub struct Dispatcher {
    leadership: Leadership,
    store: Arc<dyn CommandStore>,
    executor: Arc<dyn SessionExecutor>,
    outbound: Outbound,
    in_flight: parking_lot::Mutex<HashMap<String, CommandLock>>,
    max_concurrent: usize,
}

impl Dispatcher {
    pub fn new(
        leadership: Leadership,
        store: Arc<dyn CommandStore>,
        executor: Arc<dyn SessionExecutor>,
        outbound: Outbound,
        max_concurrent: usize,
    ) -> Self {
        Self {
            leadership,
            store,
            executor,
            outbound,
            in_flight: parking_lot::Mutex::new(HashMap::new()),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Consumes commands in arrival order with at most `max_concurrent` in
    /// flight. On cancel, waits briefly for running commands to finish.
    pub fn spawn(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<CommandMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(self.max_concurrent));
            info!(max_concurrent = self.max_concurrent, "command dispatcher started");
            loop {
                let cmd = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = commands.recv() => match next {
                        Some(cmd) => cmd,
                        None => break,
                    },
                };
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    let command_id = cmd.command_id.clone();
                    if let Err(err) = dispatcher.dispatch(cmd).await {
                        warn!(error = %err, command_id = %command_id, "command dispatch failed");
                    }
                    drop(permit);
                });
            }

            let all = self.max_concurrent as u32;
            if tokio::time::timeout(DRAIN_TIMEOUT, permits.acquire_many(all))
                .await
                .is_err()
            {
                warn!("in-flight commands still running at shutdown");
            }
            info!("command dispatcher stopped");
        })
    }

    /// Handles one command end to end. `Err` means the command store failed
    /// and the command's outcome could not be recorded.
    pub async fn dispatch(&self, cmd: CommandMessage) -> Result<DispatchOutcome, CommandError> {
        let outcome = self.dispatch_inner(&cmd).await;
        let label = match &outcome {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        let action = cmd
            .action
            .parse::<CommandAction>()
            .map(|a| a.as_str())
            .unwrap_or("unknown");
        metrics::COMMANDS.with_label_values(&[action, label]).inc();
        outcome
    }

    async fn dispatch_inner(&self, cmd: &CommandMessage) -> Result<DispatchOutcome, CommandError> {
        self.send(AgentFrame::Ack {
            command_id: cmd.command_id.clone(),
        });

        if !self.leadership.is_leader() {
            self.defer(cmd);
            return Ok(DispatchOutcome::Deferred);
        }

        let lock = self.command_lock(&cmd.command_id);
        let outcome = {
            let _guard = lock.lock().await;
            self.handle_locked(cmd).await
        };
        self.release_lock(&cmd.command_id, lock);
        outcome
    }

    async fn handle_locked(&self, cmd: &CommandMessage) -> Result<DispatchOutcome, CommandError> {
        let record = CommandRecord::received(cmd.command_id.clone(), cmd.action.clone());
        if let InsertOutcome::Existing(existing) = self.store.insert_if_absent(record).await? {
            match existing.status {
                status if status.is_terminal() => {
                    debug!(command_id = %cmd.command_id, status = status.as_str(), "duplicate command");
                    self.report_terminal(&existing).await?;
                    return Ok(DispatchOutcome::Duplicate);
                }
                CommandStatus::Running => {
                    // A previous leader died mid-execution; the outcome is unknown.
                    warn!(command_id = %cmd.command_id, "command was interrupted by failover");
                    let failed = self
                        .store
                        .advance(
                            &cmd.command_id,
                            StatusUpdate::failed(CommandError::Interrupted.to_string()),
                        )
                        .await?;
                    self.report_terminal(&failed).await?;
                    return Ok(DispatchOutcome::Failed(CommandError::Interrupted));
                }
                _ => {}
            }
        }

        let command = match SessionCommand::parse(&cmd.action, &cmd.payload) {
            Ok(command) => command,
            Err(err) => return self.fail(cmd, err).await,
        };

        if !self.leadership.is_leader() {
            self.defer(cmd);
            return Ok(DispatchOutcome::Deferred);
        }

        self.store
            .advance(&cmd.command_id, StatusUpdate::running())
            .await?;
        info!(command_id = %cmd.command_id, action = command.action().as_str(), "executing command");

        match self.execute(&command).await {
            Ok(report) => {
                let record = self
                    .store
                    .advance(
                        &cmd.command_id,
                        StatusUpdate::succeeded(Some(report.detail.clone())),
                    )
                    .await?;
                self.send(AgentFrame::Status {
                    session_id: report.session_id.clone(),
                    state: report.state.as_str().to_string(),
                });
                self.report_terminal(&record).await?;
                Ok(DispatchOutcome::Succeeded)
            }
            Err(err) => self.fail(cmd, err.into()).await,
        }
    }

    async fn execute(&self, command: &SessionCommand) -> Result<ExecutionReport, ExecutorError> {
        match command {
            SessionCommand::Create(req) => self.executor.create_session(req).await,
            SessionCommand::Terminate(target) => self.executor.terminate_session(target).await,
            SessionCommand::Hibernate(target) => self.executor.hibernate_session(target).await,
            SessionCommand::Resume(target) => self.executor.resume_session(target).await,
        }
    }

    async fn fail(
        &self,
        cmd: &CommandMessage,
        err: CommandError,
    ) -> Result<DispatchOutcome, CommandError> {
        warn!(error = %err, command_id = %cmd.command_id, action = %cmd.action, "command failed");
        let record = self
            .store
            .advance(&cmd.command_id, StatusUpdate::failed(err.to_string()))
            .await?;
        self.report_terminal(&record).await?;
        Ok(DispatchOutcome::Failed(err))
    }

    /// Sends the single terminal frame for `record`, if nobody has yet. A frame
    /// that cannot be queued is unmarked so a redelivery reports it.
    async fn report_terminal(&self, record: &CommandRecord) -> Result<(), CommandError> {
        let frame = match record.status {
            CommandStatus::Succeeded => AgentFrame::Complete {
                command_id: record.command_id.clone(),
                result: record.result.clone().unwrap_or(Value::Null),
            },
            CommandStatus::Failed => AgentFrame::Failed {
                command_id: record.command_id.clone(),
                error: record.error.clone().unwrap_or_default(),
            },
            _ => return Ok(()),
        };
        if !self.store.mark_reported(&record.command_id).await? {
            return Ok(());
        }
        let kind = frame.kind();
        if let Err(err) = self.outbound.send(frame) {
            warn!(
                error = %err,
                command_id = %record.command_id,
                frame = kind,
                "terminal report not queued; awaiting redelivery"
            );
            self.store.clear_reported(&record.command_id).await?;
        }
        Ok(())
    }

    fn defer(&self, cmd: &CommandMessage) {
        let leader = self.leadership.leader_identity();
        debug!(command_id = %cmd.command_id, leader = ?leader, "standby deferring command");
        self.send(AgentFrame::Deferred {
            command_id: cmd.command_id.clone(),
            reason: "not_leader".into(),
            leader,
        });
    }

    fn send(&self, frame: AgentFrame) {
        let kind = frame.kind();
        if let Err(err) = self.outbound.send(frame) {
            warn!(error = %err, frame = kind, "dropping outbound frame");
        }
    }

    fn command_lock(&self, command_id: &str) -> CommandLock {
        self.in_flight
            .lock()
            .entry(command_id.to_string())
            .or_default()
            .clone()
    }

    fn release_lock(&self, command_id: &str, lock: CommandLock) {
        let mut in_flight = self.in_flight.lock();
        // Map entry plus ours: nobody else is waiting.
        if Arc::strong_count(&lock) <= 2 {
            in_flight.remove(command_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use fleet_sdk::command::InMemoryCommandStore;
    use fleet_sdk::session::SessionState;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
        fail_with: Option<&'static str>,
    }

    impl CountingExecutor {
        fn finish(&self, session_id: &str, state: SessionState) -> Result<ExecutionReport, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(msg) = self.fail_with {
                return Err(ExecutorError::Platform(msg.into()));
            }
            Ok(ExecutionReport {
                session_id: session_id.into(),
                state,
                detail: json!({ "sessionId": session_id }),
            })
        }
    }

    #[async_trait]
    impl SessionExecutor for CountingExecutor {
        async fn create_session(
            &self,
            req: &CreateSessionPayload,
        ) -> Result<ExecutionReport, ExecutorError> {
            tokio::task::yield_now().await;
            self.finish(&req.session_id, SessionState::Running)
        }

        async fn terminate_session(
            &self,
            target: &SessionRefPayload,
        ) -> Result<ExecutionReport, ExecutorError> {
            self.finish(&target.session_id, SessionState::Terminated)
        }

        async fn hibernate_session(
            &self,
            target: &SessionRefPayload,
        ) -> Result<ExecutionReport, ExecutorError> {
            self.finish(&target.session_id, SessionState::Hibernated)
        }

        async fn resume_session(
            &self,
            target: &SessionRefPayload,
        ) -> Result<ExecutionReport, ExecutorError> {
            self.finish(&target.session_id, SessionState::Running)
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        store: Arc<InMemoryCommandStore>,
        executor: Arc<CountingExecutor>,
        frames: mpsc::Receiver<AgentFrame>,
    }

    impl Harness {
        fn new(leadership: Leadership, executor: CountingExecutor) -> Self {
            Self::with_outbound_capacity(leadership, executor, 64)
        }

        fn with_outbound_capacity(
            leadership: Leadership,
            executor: CountingExecutor,
            capacity: usize,
        ) -> Self {
            let store = InMemoryCommandStore::new();
            let executor = Arc::new(executor);
            let (outbound, frames) = Outbound::channel(capacity);
            let dispatcher = Arc::new(Dispatcher::new(
                leadership,
                store.clone(),
                executor.clone(),
                outbound,
                4,
            ));
            Self {
                dispatcher,
                store,
                executor,
                frames,
            }
        }

        fn leader() -> Self {
            Self::new(
                Leadership::new_leading_for_tests("pod-a"),
                CountingExecutor::default(),
            )
        }

        fn drain(&mut self) -> Vec<&'static str> {
            let mut kinds = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                kinds.push(frame.kind());
            }
            kinds
        }
    }

    fn create(id: &str) -> CommandMessage {
        CommandMessage {
            command_id: id.into(),
            action: "create_session".into(),
            payload: json!({ "sessionId": "s1", "user": "alice", "template": "firefox" }),
        }
    }

    #[test]
    fn parses_typed_payloads() {
        let cmd = SessionCommand::parse(
            "start_session",
            &json!({ "sessionId": "s1", "user": "alice", "template": "firefox" }),
        )
        .unwrap();
        let SessionCommand::Create(req) = cmd else {
            panic!("expected create");
        };
        assert_eq!(req.memory, "2Gi");
        assert_eq!(req.cpu, "1000m");

        let cmd = SessionCommand::parse(
            "stop_session",
            &json!({ "sessionId": "s1", "deletePVC": true }),
        )
        .unwrap();
        assert_eq!(
            cmd,
            SessionCommand::Terminate(SessionRefPayload {
                session_id: "s1".into(),
                delete_pvc: true
            })
        );

        assert!(matches!(
            SessionCommand::parse("create_session", &json!({ "sessionId": "s1", "user": "alice", "template": "" })),
            Err(CommandError::InvalidPayload(_))
        ));
        assert!(matches!(
            SessionCommand::parse("hibernate_session", &json!({})),
            Err(CommandError::InvalidPayload(_))
        ));
        assert!(matches!(
            SessionCommand::parse("reboot", &json!({})),
            Err(CommandError::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn leader_executes_and_reports_once() {
        let mut h = Harness::leader();
        let outcome = h.dispatcher.dispatch(create("cmd-1")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Succeeded));
        assert_eq!(h.drain(), vec!["ack", "status", "complete"]);

        let record = h.store.get("cmd-1").await.unwrap().unwrap();
        assert_eq!(record.status, CommandStatus::Succeeded);
        assert!(record.reported);
    }

    #[tokio::test]
    async fn redelivery_is_acknowledged_but_not_re_executed() {
        let mut h = Harness::leader();
        h.dispatcher.dispatch(create("cmd-1")).await.unwrap();
        h.drain();

        let outcome = h.dispatcher.dispatch(create("cmd-1")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Duplicate));
        assert_eq!(h.drain(), vec!["ack"]);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_execute_once() {
        let mut h = Harness::leader();
        let (a, b) = tokio::join!(
            h.dispatcher.dispatch(create("cmd-1")),
            h.dispatcher.dispatch(create("cmd-1"))
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, DispatchOutcome::Succeeded))
                .count(),
            1
        );
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
        let frames = h.drain();
        assert_eq!(frames.iter().filter(|k| **k == "complete").count(), 1);
        assert_eq!(frames.iter().filter(|k| **k == "ack").count(), 2);
    }

    #[tokio::test]
    async fn standby_defers_without_persisting() {
        let leadership = Leadership::new_leading_for_tests("pod-a");
        leadership.step_down_for_tests();
        let mut h = Harness::new(leadership, CountingExecutor::default());

        let outcome = h.dispatcher.dispatch(create("cmd-1")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Deferred));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.get("cmd-1").await.unwrap().is_none());

        let _ack = h.frames.try_recv().unwrap();
        match h.frames.try_recv().unwrap() {
            AgentFrame::Deferred { reason, leader, .. } => {
                assert_eq!(reason, "not_leader");
                assert_eq!(leader.as_deref(), Some("other-replica"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_action_fails_without_execution() {
        let mut h = Harness::leader();
        let outcome = h
            .dispatcher
            .dispatch(CommandMessage {
                command_id: "cmd-9".into(),
                action: "reboot_node".into(),
                payload: json!({}),
            })
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(CommandError::UnknownCommand(_))
        ));
        assert_eq!(h.drain(), vec!["ack", "failed"]);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
        let record = h.store.get("cmd-9").await.unwrap().unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
    }

    #[tokio::test]
    async fn invalid_payload_fails() {
        let mut h = Harness::leader();
        let outcome = h
            .dispatcher
            .dispatch(CommandMessage {
                command_id: "cmd-2".into(),
                action: "create_session".into(),
                payload: json!({ "sessionId": "s1" }),
            })
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(CommandError::InvalidPayload(_))
        ));
        assert_eq!(h.drain(), vec!["ack", "failed"]);
    }

    #[tokio::test]
    async fn executor_errors_become_failed_status() {
        let mut h = Harness::new(
            Leadership::new_leading_for_tests("pod-a"),
            CountingExecutor {
                fail_with: Some("docker daemon unreachable"),
                ..CountingExecutor::default()
            },
        );
        let outcome = h.dispatcher.dispatch(create("cmd-3")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed(CommandError::Execution(_))));
        let record = h.store.get("cmd-3").await.unwrap().unwrap();
        assert!(record.error.unwrap().contains("docker daemon unreachable"));
        assert_eq!(h.drain(), vec!["ack", "failed"]);
    }

    #[tokio::test]
    async fn running_record_from_previous_leader_is_failed() {
        let mut h = Harness::leader();
        h.store
            .insert_if_absent(CommandRecord::received("cmd-4", "create_session"))
            .await
            .unwrap();
        h.store
            .advance("cmd-4", StatusUpdate::running())
            .await
            .unwrap();

        let outcome = h.dispatcher.dispatch(create("cmd-4")).await.unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(CommandError::Interrupted)
        ));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
        let record = h.store.get("cmd-4").await.unwrap().unwrap();
        assert_eq!(record.error.as_deref(), Some("interrupted"));
        assert_eq!(h.drain(), vec!["ack", "failed"]);
    }

    #[tokio::test]
    async fn received_record_from_previous_leader_is_executed() {
        let mut h = Harness::leader();
        h.store
            .insert_if_absent(CommandRecord::received("cmd-5", "create_session"))
            .await
            .unwrap();

        let outcome = h.dispatcher.dispatch(create("cmd-5")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Succeeded));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
        h.drain();
    }

    #[tokio::test]
    async fn spawned_loop_processes_commands() {
        let mut h = Harness::leader();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = h.dispatcher.clone().spawn(rx, cancel.clone());

        tx.send(create("cmd-a")).await.unwrap();
        tx.send(create("cmd-b")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 2);
        let frames = h.drain();
        assert_eq!(frames.iter().filter(|k| **k == "complete").count(), 2);
    }

    #[tokio::test]
    async fn unqueued_terminal_report_is_sent_on_redelivery() {
        // Room for ack and status only; the complete frame is dropped.
        let mut h = Harness::with_outbound_capacity(
            Leadership::new_leading_for_tests("pod-a"),
            CountingExecutor::default(),
            2,
        );
        let outcome = h.dispatcher.dispatch(create("cmd-6")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Succeeded));
        assert_eq!(h.drain(), vec!["ack", "status"]);
        assert!(!h.store.get("cmd-6").await.unwrap().unwrap().reported);

        let outcome = h.dispatcher.dispatch(create("cmd-6")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Duplicate));
        assert_eq!(h.drain(), vec!["ack", "complete"]);
        assert!(h.store.get("cmd-6").await.unwrap().unwrap().reported);

        h.dispatcher.dispatch(create("cmd-6")).await.unwrap();
        assert_eq!(h.drain(), vec!["ack"]);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    }
}
