use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::router::{spawn_diagram_actor, ActorInit, DiagramHandle};
use crate::config::CollabSettings;
use crate::db::{DiagramStore, StoreError};
use crate::models::{DiagramKey, Participant, ParticipantView, Role, SessionResponse, UserRef};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no collaboration session for diagram '{0}'")]
    NotFound(DiagramKey),
    #[error("diagram '{0}' does not exist")]
    DiagramNotFound(DiagramKey),
    #[error("a collaboration session already exists for this diagram")]
    AlreadyExists { session_id: Uuid },
    #[error("user '{0}' is not a participant of this session")]
    NotParticipant(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Roster and presence bookkeeping shared between the registry (REST side)
/// and the session's actor
#[derive(Debug)]
pub struct SessionMeta {
    pub participants: Vec<Participant>,
    pub current_presenter: Option<UserRef>,
    /// user_id -> number of live sockets
    pub live: HashMap<String, usize>,
    pub last_activity: Instant,
}

impl SessionMeta {
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn upsert_participant(&mut self, user: UserRef, role: Role) {
        let now = Utc::now();
        match self.participants.iter_mut().find(|p| p.user.user_id == user.user_id) {
            Some(existing) => {
                existing.role = role;
                existing.user = user;
                existing.last_activity = now;
            }
            None => self.participants.push(Participant { user, role, joined_at: now, last_activity: now }),
        }
        self.touch();
    }

    pub fn live_connections(&self) -> usize {
        self.live.values().sum()
    }
}

/// One live collaboration session on a diagram
#[derive(Debug)]
pub struct CollaborationSession {
    pub session_id: Uuid,
    pub key: DiagramKey,
    pub host: UserRef,
    pub created_at: DateTime<Utc>,
    meta: Arc<Mutex<SessionMeta>>,
    handle: DiagramHandle,
}

impl CollaborationSession {
    pub fn handle(&self) -> &DiagramHandle {
        &self.handle
    }

    fn meta(&self) -> MutexGuard<'_, SessionMeta> {
        self.meta.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.meta().participants.clone()
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.meta().participants.iter().any(|p| p.user.user_id == user_id)
    }

    pub fn live_connections(&self) -> usize {
        self.meta().live_connections()
    }

    pub fn has_presenter(&self) -> bool {
        self.meta().current_presenter.is_some()
    }

    fn idle_for(&self) -> Option<Duration> {
        let meta = self.meta();
        (meta.live_connections() == 0).then(|| meta.last_activity.elapsed())
    }

    pub fn view(&self, websocket_url: String) -> SessionResponse {
        let meta = self.meta();
        let participants = meta
            .participants
            .iter()
            .map(|p| ParticipantView {
                user: p.user.clone(),
                role: p.role,
                joined_at: p.joined_at,
                last_activity: p.last_activity,
                connected: meta.live.contains_key(&p.user.user_id),
            })
            .collect();
        SessionResponse {
            session_id: self.session_id,
            threat_model_id: self.key.threat_model_id,
            diagram_id: self.key.diagram_id,
            host: self.host.clone(),
            current_presenter: meta.current_presenter.clone(),
            participants,
            websocket_url,
        }
    }
}

struct RegistryInner {
    sessions: RwLock<HashMap<DiagramKey, Arc<CollaborationSession>>>,
    store: Arc<dyn DiagramStore>,
    settings: CollabSettings,
}

/// All live sessions, at most one per diagram
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn DiagramStore>, settings: CollabSettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                store,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &CollabSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> Arc<dyn DiagramStore> {
        self.inner.store.clone()
    }

    /// Open a session with `creator` as host.
    ///
    /// Fails if the diagram is unknown to the store or a session is already
    /// running; the check and the insert happen under one write lock.
    pub async fn create_session(
        &self,
        key: DiagramKey,
        creator: UserRef,
        role: Role,
    ) -> Result<Arc<CollaborationSession>, RegistryError> {
        if let Some(existing) = self.get(&key).await {
            return Err(RegistryError::AlreadyExists { session_id: existing.session_id });
        }
        let snapshot = self
            .inner
            .store
            .load(&key)
            .await?
            .ok_or(RegistryError::DiagramNotFound(key))?;

        let mut sessions = self.inner.sessions.write().await;
        if let Some(existing) = sessions.get(&key) {
            return Err(RegistryError::AlreadyExists { session_id: existing.session_id });
        }

        let session_id = Uuid::new_v4();
        let now = Utc::now();
        let meta = Arc::new(Mutex::new(SessionMeta {
            participants: vec![Participant { user: creator.clone(), role, joined_at: now, last_activity: now }],
            current_presenter: None,
            live: HashMap::new(),
            last_activity: Instant::now(),
        }));
        let handle = spawn_diagram_actor(ActorInit {
            key,
            session_id,
            host_user_id: creator.user_id.clone(),
            snapshot,
            meta: meta.clone(),
            store: self.inner.store.clone(),
            settings: self.inner.settings.clone(),
            registry: self.clone(),
        });
        let session = Arc::new(CollaborationSession {
            session_id,
            key,
            host: creator,
            created_at: now,
            meta,
            handle,
        });
        sessions.insert(key, session.clone());
        info!(session = %session_id, diagram = %key, host = %session.host.user_id, "collaboration session created");
        Ok(session)
    }

    /// Add `user` to the roster of a running session
    pub async fn join_session(
        &self,
        key: &DiagramKey,
        user: UserRef,
        role: Role,
    ) -> Result<Arc<CollaborationSession>, RegistryError> {
        let session = self.get(key).await.ok_or(RegistryError::NotFound(*key))?;
        info!(session = %session.session_id, user = %user.user_id, role = %role, "participant joined roster");
        session.meta().upsert_participant(user, role);
        Ok(session)
    }

    /// Take `user_id` off the roster.
    ///
    /// The host leaving ends the session for everyone; anyone else only loses
    /// their own sockets.
    pub async fn leave_session(&self, key: &DiagramKey, user_id: &str) -> Result<(), RegistryError> {
        let session = self.get(key).await.ok_or(RegistryError::NotFound(*key))?;

        if session.host.user_id == user_id {
            info!(session = %session.session_id, "host left, ending session");
            if session.handle.shutdown("host_left").await.is_err() {
                // actor already gone
                self.remove_if(key, session.session_id).await;
            }
            return Ok(());
        }

        {
            let mut meta = session.meta();
            let before = meta.participants.len();
            meta.participants.retain(|p| p.user.user_id != user_id);
            if meta.participants.len() == before {
                return Err(RegistryError::NotParticipant(user_id.to_string()));
            }
        }
        info!(session = %session.session_id, user = %user_id, "participant left roster");
        if session.handle.roster_removed(user_id.to_string()).await.is_err() {
            warn!(session = %session.session_id, "roster removal not delivered, actor gone");
        }
        Ok(())
    }

    pub async fn get(&self, key: &DiagramKey) -> Option<Arc<CollaborationSession>> {
        self.inner.sessions.read().await.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<CollaborationSession>> {
        let mut sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Remove the entry for `key` only if it still belongs to `session_id`
    pub(super) async fn remove_if(&self, key: &DiagramKey, session_id: Uuid) {
        let mut sessions = self.inner.sessions.write().await;
        if sessions.get(key).is_some_and(|s| s.session_id == session_id) {
            sessions.remove(key);
        }
    }

    /// End sessions that have had no live socket for longer than `idle`
    pub async fn sweep_idle(&self, idle: Duration) -> usize {
        let stale: Vec<_> = self
            .list()
            .await
            .into_iter()
            .filter(|s| s.idle_for().is_some_and(|d| d >= idle))
            .collect();

        for session in &stale {
            info!(session = %session.session_id, diagram = %session.key, "reaping idle session");
            if session.handle.shutdown("session_idle_timeout").await.is_err() {
                self.remove_if(&session.key, session.session_id).await;
            }
        }
        stale.len()
    }

    /// Periodically reap idle sessions until `cancel` fires
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.inner.settings.session_sweep_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let reaped = registry.sweep_idle(registry.inner.settings.session_idle_timeout).await;
                        if reaped > 0 {
                            info!(reaped, "idle sessions reaped");
                        }
                    }
                }
            }
        })
    }

    /// End every session, used on server shutdown
    pub async fn shutdown_all(&self, reason: &str) {
        for session in self.list().await {
            let _ = session.handle.shutdown(reason).await;
        }
    }
}
