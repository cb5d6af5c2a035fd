use moka::sync::Cache;
use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connctx::{ConnectionHandle, DisconnectReason, SendError};
use super::history::PendingHistory;
use super::persist::{spawn_persist_worker, PersistJob, RetryPolicy};
use super::registry::{SessionMeta, SessionRegistry};
use super::state::{ApplyError, DiagramState};
use crate::config::CollabSettings;
use crate::db::{DiagramStore, HistoryOutcome, PersistedMutation};
use crate::models::{
    CellPatchOperation, ClientMessage, DiagramKey, DiagramSnapshot, HistoryKind, ServerMessage, UserRef,
    REASON_INSUFFICIENT_PERMISSIONS,
};

/// Everything a diagram actor can be asked to do
#[derive(Debug)]
pub enum DiagramCommand {
    Attach {
        conn: ConnectionHandle,
    },
    Detach {
        conn_id: Uuid,
        reason: DisconnectReason,
    },
    Inbound {
        conn_id: Uuid,
        message: ClientMessage,
    },
    /// A frame that could not be parsed, answered in mailbox order
    Reject {
        conn_id: Uuid,
        message: String,
    },
    /// The user left the REST roster, close their sockets
    RosterRemoved {
        user_id: String,
    },
    PersistFailed {
        update_vector: u64,
    },
    HistoryCompleted {
        seq: u64,
        conn_id: Uuid,
        kind: HistoryKind,
        result: Result<HistoryOutcome, String>,
    },
    Flush,
    Snapshot {
        reply: oneshot::Sender<DiagramSnapshot>,
    },
    Shutdown {
        reason: String,
        done: Option<oneshot::Sender<()>>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("diagram session has ended")]
pub struct SessionGone;

/// Cheap, cloneable address of a diagram actor
#[derive(Debug, Clone)]
pub struct DiagramHandle {
    tx: mpsc::Sender<DiagramCommand>,
}

impl DiagramHandle {
    pub async fn attach(&self, conn: ConnectionHandle) -> Result<(), SessionGone> {
        self.send(DiagramCommand::Attach { conn }).await
    }

    pub async fn detach(&self, conn_id: Uuid, reason: DisconnectReason) -> Result<(), SessionGone> {
        self.send(DiagramCommand::Detach { conn_id, reason }).await
    }

    pub async fn inbound(&self, conn_id: Uuid, message: ClientMessage) -> Result<(), SessionGone> {
        self.send(DiagramCommand::Inbound { conn_id, message }).await
    }

    pub async fn reject(&self, conn_id: Uuid, message: String) -> Result<(), SessionGone> {
        self.send(DiagramCommand::Reject { conn_id, message }).await
    }

    pub async fn roster_removed(&self, user_id: String) -> Result<(), SessionGone> {
        self.send(DiagramCommand::RosterRemoved { user_id }).await
    }

    pub async fn flush(&self) -> Result<(), SessionGone> {
        self.send(DiagramCommand::Flush).await
    }

    /// Consistent copy of the live diagram, read through the actor
    pub async fn snapshot(&self) -> Result<DiagramSnapshot, SessionGone> {
        let (reply, rx) = oneshot::channel();
        self.send(DiagramCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| SessionGone)
    }

    /// End the session and wait until it has flushed and left the registry
    pub async fn shutdown(&self, reason: impl Into<String>) -> Result<(), SessionGone> {
        let (done, rx) = oneshot::channel();
        self.send(DiagramCommand::Shutdown { reason: reason.into(), done: Some(done) }).await?;
        rx.await.map_err(|_| SessionGone)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, cmd: DiagramCommand) -> Result<(), SessionGone> {
        self.tx.send(cmd).await.map_err(|_| SessionGone)
    }
}

#[derive(Debug, Clone)]
pub(super) struct Presenter {
    pub conn_id: Uuid,
    pub user: UserRef,
}

/// Serialized owner of one diagram's state.
///
/// Every mutation, presence change and history step of the diagram runs
/// here, one command at a time. Store I/O is handed to the persistence
/// worker so the actor never waits on it.
pub struct DiagramActor {
    pub(super) key: DiagramKey,
    pub(super) session_id: Uuid,
    pub(super) host_user_id: String,
    pub(super) state: DiagramState,
    pub(super) conns: HashMap<Uuid, ConnectionHandle>,
    pub(super) presenter: Option<Presenter>,
    pub(super) meta: Arc<Mutex<SessionMeta>>,
    pub(super) settings: CollabSettings,
    /// operation_id -> update_vector it was accepted at
    dedup: Cache<String, u64>,
    inbox: mpsc::Receiver<DiagramCommand>,
    pub(super) persist_tx: mpsc::UnboundedSender<PersistJob>,
    worker: JoinHandle<()>,
    registry: SessionRegistry,
    /// Connections that could not keep up, detached after the current command
    pub(super) lagging: Vec<Uuid>,
    /// Undo/redo in flight; diagram traffic is parked until it resolves
    pub(super) history: Option<PendingHistory>,
    pub(super) history_seq: u64,
    pub(super) parked: VecDeque<(Uuid, ClientMessage)>,
    pub(super) flushed_vector: u64,
    pub(super) needs_flush: bool,
    pub(super) ending: Option<String>,
}

pub(super) struct ActorInit {
    pub key: DiagramKey,
    pub session_id: Uuid,
    pub host_user_id: String,
    pub snapshot: DiagramSnapshot,
    pub meta: Arc<Mutex<SessionMeta>>,
    pub store: Arc<dyn DiagramStore>,
    pub settings: CollabSettings,
    pub registry: SessionRegistry,
}

/// Start the actor and its persistence worker
pub(super) fn spawn_diagram_actor(init: ActorInit) -> DiagramHandle {
    let (tx, inbox) = mpsc::channel(init.settings.actor_mailbox_size);
    let (persist_tx, persist_rx) = mpsc::unbounded_channel();
    let policy = RetryPolicy {
        max_retries: init.settings.persist_max_retries,
        backoff: init.settings.persist_backoff,
        backoff_max: init.settings.persist_backoff_max,
    };
    let worker = spawn_persist_worker(init.key, init.store, policy, persist_rx, tx.clone());
    let dedup = Cache::builder()
        .max_capacity(10_000)
        .time_to_live(init.settings.dedup_window)
        .build();

    let actor = DiagramActor {
        key: init.key,
        session_id: init.session_id,
        host_user_id: init.host_user_id,
        flushed_vector: init.snapshot.update_vector,
        state: DiagramState::from_snapshot(init.snapshot),
        conns: HashMap::new(),
        presenter: None,
        meta: init.meta,
        settings: init.settings,
        dedup,
        inbox,
        persist_tx,
        worker,
        registry: init.registry,
        lagging: Vec::new(),
        history: None,
        history_seq: 0,
        parked: VecDeque::new(),
        needs_flush: false,
        ending: None,
    };
    tokio::spawn(actor.run());
    DiagramHandle { tx }
}

impl DiagramActor {
    async fn run(mut self) {
        info!(session = %self.session_id, diagram = %self.key, update_vector = self.state.update_vector(), "diagram actor started");
        let mut flush_tick = tokio::time::interval(self.settings.flush_interval);
        flush_tick.tick().await;
        let mut done_waiters = Vec::new();

        loop {
            let history_deadline = self.history.as_ref().map(|h| h.deadline);
            tokio::select! {
                cmd = self.inbox.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let DiagramCommand::Shutdown { reason, done } = cmd {
                        done_waiters.extend(done);
                        self.ending = Some(reason);
                    } else if self.handle(cmd).await.is_break() {
                        break;
                    }
                }
                _ = flush_tick.tick() => self.flush(),
                _ = tokio::time::sleep_until(history_deadline.unwrap_or_else(Instant::now)), if history_deadline.is_some() => {
                    self.history_timed_out().await;
                }
            }

            // detaching may reveal more lagging peers, so loop until quiet
            while let Some(conn_id) = self.lagging.pop() {
                self.detach(conn_id, DisconnectReason::Lagging).await;
            }
            if self.ending.is_some() {
                break;
            }
        }

        self.finish(done_waiters).await;
    }

    async fn handle(&mut self, cmd: DiagramCommand) -> ControlFlow<()> {
        match cmd {
            DiagramCommand::Attach { conn } => self.attach(conn).await,
            DiagramCommand::Detach { conn_id, reason } => self.detach(conn_id, reason).await,
            DiagramCommand::Inbound { conn_id, message } => {
                self.touch();
                self.dispatch(conn_id, message).await;
            }
            DiagramCommand::Reject { conn_id, message } => {
                self.send_to(conn_id, ServerMessage::error("invalid_message", message)).await;
            }
            DiagramCommand::RosterRemoved { user_id } => {
                let removed: Vec<Uuid> = self
                    .conns
                    .values()
                    .filter(|c| c.user.user_id == user_id)
                    .map(|c| c.conn_id)
                    .collect();
                for conn_id in removed {
                    self.detach(conn_id, DisconnectReason::Removed).await;
                }
            }
            DiagramCommand::PersistFailed { update_vector } => {
                warn!(diagram = %self.key, update_vector, "write not durable, next flush will reconcile");
                self.needs_flush = true;
            }
            DiagramCommand::HistoryCompleted { seq, conn_id, kind, result } => {
                self.history_completed(seq, conn_id, kind, result).await;
            }
            DiagramCommand::Flush => self.flush(),
            DiagramCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
            // intercepted in run()
            DiagramCommand::Shutdown { .. } => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Route one client frame. Diagram and history traffic waits while an
    /// undo or redo is in flight; presence traffic never does.
    pub(super) async fn dispatch(&mut self, conn_id: Uuid, message: ClientMessage) {
        if !self.conns.contains_key(&conn_id) {
            debug!(diagram = %self.key, conn = %conn_id, "frame from detached connection dropped");
            return;
        }

        match message {
            ClientMessage::DiagramOperation { .. } | ClientMessage::UndoRequest | ClientMessage::RedoRequest
                if self.history.is_some() =>
            {
                if self.parked.len() >= self.settings.max_parked_frames {
                    warn!(diagram = %self.key, conn = %conn_id, parked = self.parked.len(), "parked queue full, frame refused");
                    let err = ServerMessage::error(
                        "history_in_progress",
                        "an undo/redo is still pending, resend after it completes",
                    );
                    self.send_to(conn_id, err).await;
                    return;
                }
                self.parked.push_back((conn_id, message));
            }
            ClientMessage::DiagramOperation { operation_id, operation } => {
                self.handle_operation(conn_id, operation_id, operation).await;
            }
            ClientMessage::UndoRequest => self.request_history(conn_id, HistoryKind::Undo).await,
            ClientMessage::RedoRequest => self.request_history(conn_id, HistoryKind::Redo).await,
            ClientMessage::PresenterRequest => self.presenter_request(conn_id).await,
            ClientMessage::ChangePresenter { new_presenter } => self.change_presenter(conn_id, new_presenter).await,
            ClientMessage::PresenterCursor { cursor_position } => {
                self.relay_presenter(conn_id, |user| ServerMessage::PresenterCursor { user, cursor_position }).await;
            }
            ClientMessage::PresenterSelection { selected_cells } => {
                self.relay_presenter(conn_id, |user| ServerMessage::PresenterSelection { user, selected_cells })
                    .await;
            }
            ClientMessage::ResyncRequest => self.resync_request(conn_id).await,
            ClientMessage::SyncStatusRequest => self.sync_status(conn_id).await,
        }
    }

    async fn handle_operation(&mut self, conn_id: Uuid, operation_id: String, operation: CellPatchOperation) {
        let Some(conn) = self.conns.get(&conn_id) else { return };
        let user = conn.user.clone();

        if !conn.role.can_write() {
            debug!(diagram = %self.key, user = %user.user_id, operation_id = %operation_id, "read-only participant attempted a mutation");
            self.send_to(
                conn_id,
                ServerMessage::authorization_denied(Some(operation_id), REASON_INSUFFICIENT_PERMISSIONS),
            )
            .await;
            return;
        }

        if let Some(accepted_at) = self.dedup.get(&operation_id) {
            debug!(diagram = %self.key, operation_id = %operation_id, accepted_at, "duplicate operation ignored");
            return;
        }

        match self.state.apply(&operation) {
            Ok(update_vector) => {
                debug!(
                    diagram = %self.key,
                    user = %user.user_id,
                    operation_id = %operation_id,
                    update_vector,
                    cells = operation.cells.len(),
                    "operation accepted"
                );
                self.dedup.insert(operation_id.clone(), update_vector);
                self.persist(PersistJob::Mutation(PersistedMutation {
                    update_vector,
                    cells: operation.cells.clone(),
                }));
                self.broadcast(
                    ServerMessage::DiagramOperation { operation_id, user, update_vector, operation },
                    Some(conn_id),
                )
                .await;
            }
            Err(err) => {
                info!(diagram = %self.key, user = %user.user_id, operation_id = %operation_id, "operation rejected: {}", err);
                let conflict = matches!(err, ApplyError::Conflict { .. });
                self.send_to(
                    conn_id,
                    ServerMessage::OperationRejected {
                        operation_id: operation_id.clone(),
                        reason: err.reason(),
                        message: err.to_string(),
                        update_vector: self.state.update_vector(),
                        requires_resync: conflict,
                    },
                )
                .await;
                if conflict {
                    self.send_correction(conn_id, Some(operation_id)).await;
                }
            }
        }
    }

    /// Queue a job for the persistence worker. False when the worker is gone.
    pub(super) fn persist(&mut self, job: PersistJob) -> bool {
        if self.persist_tx.send(job).is_err() {
            error!(diagram = %self.key, "persistence worker stopped");
            self.needs_flush = true;
            return false;
        }
        true
    }

    /// Queue a snapshot write if anything changed since the last one
    pub(super) fn flush(&mut self) {
        let update_vector = self.state.update_vector();
        if update_vector == self.flushed_vector && !self.needs_flush {
            return;
        }
        debug!(diagram = %self.key, update_vector, "flushing diagram");
        self.needs_flush = false;
        self.flushed_vector = update_vector;
        self.persist(PersistJob::Snapshot(self.state.snapshot()));
    }

    /// Queue a frame for one connection
    pub(super) async fn send_to(&mut self, conn_id: Uuid, msg: ServerMessage) {
        let Some(conn) = self.conns.get(&conn_id) else { return };
        if let Err(e) = conn.send(msg, self.settings.mutation_send_retries).await {
            self.mark_failed(conn_id, e);
        }
    }

    /// Queue a frame for every live connection except `except`
    pub(super) async fn broadcast(&mut self, msg: ServerMessage, except: Option<Uuid>) {
        let retries = self.settings.mutation_send_retries;
        let mut failed = Vec::new();
        for conn in self.conns.values() {
            if Some(conn.conn_id) == except {
                continue;
            }
            if let Err(e) = conn.send(msg.clone(), retries).await {
                failed.push((conn.conn_id, e));
            }
        }
        for (conn_id, e) in failed {
            self.mark_failed(conn_id, e);
        }
    }

    fn mark_failed(&mut self, conn_id: Uuid, e: SendError) {
        if e == SendError::Lagging {
            warn!(diagram = %self.key, conn = %conn_id, "connection cannot keep up, forcing resync");
        }
        if !self.lagging.contains(&conn_id) {
            self.lagging.push(conn_id);
        }
    }

    pub(super) fn touch(&self) {
        let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
        meta.touch();
    }

    async fn finish(mut self, done_waiters: Vec<oneshot::Sender<()>>) {
        let reason = self.ending.take().unwrap_or_else(|| "session_closed".to_string());
        info!(session = %self.session_id, diagram = %self.key, reason = %reason, "ending collaboration session");

        let ended = ServerMessage::session_ended(reason);
        for conn in self.conns.values() {
            // best effort, the socket is closed right after
            let _ = conn.send(ended.clone(), 0).await;
            conn.close(DisconnectReason::SessionEnded);
        }
        self.conns.clear();
        {
            let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
            meta.live.clear();
            meta.current_presenter = None;
        }

        self.flush();
        self.inbox.close();
        let DiagramActor { persist_tx, worker, registry, key, session_id, .. } = self;
        drop(persist_tx);
        if let Err(e) = worker.await {
            error!(diagram = %key, "persistence worker failed: {}", e);
        }

        registry.remove_if(&key, session_id).await;
        for done in done_waiters {
            let _ = done.send(());
        }
        info!(session = %session_id, diagram = %key, "collaboration session ended");
    }
}
