//! Session registry and per-session state.
//!
//! A session is keyed by the opaque id the client supplies and lives for the
//! process lifetime (reconnects during the same process reuse it, so the
//! mirror, observer history, and message history survive a dropped channel).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use deskconf::ObserverConfig;
use liveosc::LiveBridge;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::claude::ChatMessage;
use crate::events::{self, SessionEvent};
use crate::mixer::MixerMirror;
use crate::observer::ParameterObserver;

/// Mutating tool calls parked until the human answers.
pub struct PendingApproval {
    pub ids: HashSet<String>,
    pub tx: oneshot::Sender<HashMap<String, bool>>,
}

pub struct SessionState {
    pub id: String,
    pub project_id: String,
    /// Rolling message history; touched only from the session's agent task.
    pub history: tokio::sync::Mutex<Vec<ChatMessage>>,
    pub mirror: MixerMirror,
    pub observer: ParameterObserver,
    pub events: broadcast::Sender<SessionEvent>,
    /// One agent turn at a time; later messages queue here.
    pub turn_lock: tokio::sync::Mutex<()>,
    approvals: Mutex<Option<PendingApproval>>,
    indexing: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionState {
    fn create(
        id: &str,
        project_id: &str,
        bridge: Arc<LiveBridge>,
        observer_config: &ObserverConfig,
    ) -> Arc<Self> {
        let events = events::channel();
        let observer = ParameterObserver::new(
            bridge,
            observer_config.history_window(),
            observer_config.debounce(),
            events.clone(),
        );
        let session = Arc::new(Self {
            id: id.to_string(),
            project_id: project_id.to_string(),
            history: tokio::sync::Mutex::new(Vec::new()),
            mirror: MixerMirror::new(),
            observer,
            events,
            turn_lock: tokio::sync::Mutex::new(()),
            approvals: Mutex::new(None),
            indexing: AtomicBool::new(false),
            pump: Mutex::new(None),
        });
        *session.pump.lock().unwrap() = Some(session.observer.spawn_pump());
        session
    }

    /// Emit an event to whatever channel is currently attached. Nobody
    /// listening is fine.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Park a set of tool-call ids awaiting approval. Replaces any stale
    /// pending request (its waiter sees a closed channel and denies).
    pub fn set_pending_approval(&self, ids: HashSet<String>, tx: oneshot::Sender<HashMap<String, bool>>) {
        let mut pending = self.approvals.lock().unwrap();
        if pending.is_some() {
            warn!("session {}: replacing stale pending approval", self.id);
        }
        *pending = Some(PendingApproval { ids, tx });
    }

    pub fn clear_pending_approval(&self) {
        *self.approvals.lock().unwrap() = None;
    }

    /// Route approval decisions to the waiting agent turn. Returns false if
    /// the payload matches no pending request; the pending state is left
    /// untouched in that case.
    pub fn resolve_approvals(&self, decisions: HashMap<String, bool>) -> bool {
        let mut pending = self.approvals.lock().unwrap();
        let matches = pending
            .as_ref()
            .map(|p| decisions.keys().any(|id| p.ids.contains(id)))
            .unwrap_or(false);
        if !matches {
            return false;
        }
        if let Some(p) = pending.take() {
            let _ = p.tx.send(decisions);
        }
        true
    }

    /// Claim the indexing slot. False if another task is already indexing.
    pub fn try_begin_indexing(&self) -> bool {
        self.indexing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_indexing(&self) {
        self.indexing.store(false, Ordering::SeqCst);
    }

    /// Stop the notification pump and drop all subscriptions (best effort).
    pub async fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        self.observer.unsubscribe_all().await;
    }
}

pub struct SessionRegistry {
    bridge: Arc<LiveBridge>,
    observer_config: ObserverConfig,
    sessions: RwLock<HashMap<String, Arc<SessionState>>>,
}

impl SessionRegistry {
    pub fn new(bridge: Arc<LiveBridge>, observer_config: ObserverConfig) -> Self {
        Self {
            bridge,
            observer_config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a session or create it with a fresh message history.
    /// Returns `(session, created)`.
    pub fn get_or_create(&self, id: &str, project_id: &str) -> (Arc<SessionState>, bool) {
        if let Some(existing) = self.sessions.read().unwrap().get(id) {
            if existing.project_id != project_id {
                warn!(
                    "session {}: reconnect with project {} (was {}), keeping original",
                    id, project_id, existing.project_id
                );
            }
            return (existing.clone(), false);
        }

        let mut sessions = self.sessions.write().unwrap();
        // Second check under the write lock: another connection may have won.
        if let Some(existing) = sessions.get(id) {
            return (existing.clone(), false);
        }
        let session = SessionState::create(id, project_id, self.bridge.clone(), &self.observer_config);
        sessions.insert(id.to_string(), session.clone());
        info!("created session {} for project {}", id, project_id);
        (session, true)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Best-effort teardown of every session, for process shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.read().unwrap().values().cloned().collect();
        for session in sessions {
            session.shutdown().await;
        }
    }
}
