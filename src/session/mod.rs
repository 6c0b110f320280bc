#![forbid(unsafe_code)]

// Session module - broadcast session registry and lifecycle orchestration

pub mod fake;
pub mod latency;
pub mod presenter;
pub mod tree;
pub mod viewer;
pub mod wiring;

pub use fake::FakeClientSettings;
pub use presenter::PresenterSession;
pub use tree::TreeSettings;
pub use viewer::{Topology, ViewerParams, ViewerSession};

use crate::engine::{BandwidthLimits, EngineError, IceCandidateInfo, MediaEngine};
use crate::signaling::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, info, warn};

/// Errors surfaced by registry operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("another presenter is already active in session {0}")]
    PresenterAlreadyPresent(String),

    #[error("no presenter is active in session {0}")]
    NoPresenter(String),

    #[error("connection is already viewing session {0}")]
    DuplicateViewer(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SessionError {
    /// True when the failure is an engine capacity rejection, which the
    /// signaling layer answers with `notEnoughResources`
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, SessionError::Engine(EngineError::ResourceExhausted(_)))
    }
}

/// Role a signaling connection holds within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Presenter,
    Viewer,
}

#[derive(Debug, Clone)]
struct ConnEntry {
    session_number: String,
    role: Role,
}

/// One broadcast session: at most one presenter and its viewers, keyed by
/// connection id. Slot existence in the registry means the presenter
/// admission was won (init may still be in flight under the slot lock).
#[derive(Default)]
struct SessionSlot {
    presenter: Option<PresenterSession>,
    viewers: HashMap<String, ViewerSession>,
}

/// Registry of active broadcast sessions.
///
/// Lock discipline: the outer `std::sync::RwLock` maps are only ever held
/// briefly and never across an `.await`. The per-slot `tokio::sync::Mutex`
/// IS held across engine calls; it serializes init, negotiation, and
/// teardown within one session so admission checks and resource lifecycles
/// stay atomic per session.
pub struct SessionRegistry {
    engine: Arc<dyn MediaEngine>,
    limits: BandwidthLimits,
    sessions: StdRwLock<HashMap<String, Arc<TokioMutex<SessionSlot>>>>,
    connections: StdRwLock<HashMap<String, ConnEntry>>,
}

impl SessionRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, limits: BandwidthLimits) -> Self {
        Self {
            engine,
            limits,
            sessions: StdRwLock::new(HashMap::new()),
            connections: StdRwLock::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Number of sessions with a live (or initializing) presenter
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of connections currently holding a session role
    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Session and role held by a connection, if any
    pub fn resolve(&self, connection_id: &str) -> Option<(String, Role)> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections
            .get(connection_id)
            .map(|entry| (entry.session_number.clone(), entry.role))
    }

    /// Admits a presenter into a session, provisioning its engine resources
    /// and negotiating its SDP. Exactly one concurrent caller per session
    /// wins; the rest get `PresenterAlreadyPresent`.
    pub async fn start_presenter(
        &self,
        session_number: &str,
        connection_id: &str,
        sender: mpsc::Sender<Arc<String>>,
        sdp_offer: &str,
        load_points: u32,
    ) -> Result<String, SessionError> {
        // Atomic admission: inserting the slot key under the write lock is
        // the check-and-claim. Losers see the key and bail out.
        let slot = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            if sessions.contains_key(session_number) {
                return Err(SessionError::PresenterAlreadyPresent(
                    session_number.to_string(),
                ));
            }
            let slot = Arc::new(TokioMutex::new(SessionSlot::default()));
            sessions.insert(session_number.to_string(), slot.clone());
            slot
        };

        let mut guard = slot.lock().await;
        match PresenterSession::init(
            &self.engine,
            session_number.to_string(),
            connection_id.to_string(),
            sender,
            sdp_offer,
            load_points,
            self.limits,
        )
        .await
        {
            Ok((presenter, sdp_answer)) => {
                guard.presenter = Some(presenter);
                self.register_connection(connection_id, session_number, Role::Presenter);
                Ok(sdp_answer)
            }
            Err(e) => {
                // Concurrent viewers waiting on the slot observe an empty
                // presenter and fail with NoPresenter; the slot itself goes.
                let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
                sessions.remove(session_number);
                Err(e.into())
            }
        }
    }

    /// Admits a viewer into a session with a live presenter
    pub async fn start_viewer(
        &self,
        session_number: &str,
        connection_id: &str,
        sender: mpsc::Sender<Arc<String>>,
        params: ViewerParams,
    ) -> Result<String, SessionError> {
        let slot = self
            .slot(session_number)
            .ok_or_else(|| SessionError::NoPresenter(session_number.to_string()))?;

        let mut guard = slot.lock().await;
        let (presenter_graph, presenter_endpoint) = match guard.presenter.as_ref() {
            Some(p) => match (p.graph(), p.endpoint()) {
                (Some(graph), Some(endpoint)) => (graph, endpoint),
                _ => return Err(SessionError::NoPresenter(session_number.to_string())),
            },
            None => return Err(SessionError::NoPresenter(session_number.to_string())),
        };
        if guard.viewers.contains_key(connection_id) {
            return Err(SessionError::DuplicateViewer(session_number.to_string()));
        }

        let (viewer, sdp_answer) = ViewerSession::init(
            &self.engine,
            presenter_graph,
            presenter_endpoint,
            session_number.to_string(),
            connection_id.to_string(),
            sender,
            params,
            self.limits,
        )
        .await?;

        guard.viewers.insert(connection_id.to_string(), viewer);
        self.register_connection(connection_id, session_number, Role::Viewer);
        Ok(sdp_answer)
    }

    /// Routes a client ICE candidate to the endpoint owned by this
    /// connection. Candidates from connections without a role are dropped.
    pub async fn add_ice_candidate(
        &self,
        connection_id: &str,
        candidate: IceCandidateInfo,
    ) -> Result<(), SessionError> {
        let Some((session_number, role)) = self.resolve(connection_id) else {
            debug!(
                "Dropping ICE candidate from connection {} with no session role",
                connection_id
            );
            return Ok(());
        };
        let Some(slot) = self.slot(&session_number) else {
            return Ok(());
        };

        let guard = slot.lock().await;
        match role {
            Role::Presenter => {
                if let Some(presenter) = guard.presenter.as_ref() {
                    presenter.add_ice_candidate(self.engine.as_ref(), candidate).await?;
                }
            }
            Role::Viewer => {
                if let Some(viewer) = guard.viewers.get(connection_id) {
                    viewer.add_ice_candidate(self.engine.as_ref(), candidate).await?;
                }
            }
        }
        Ok(())
    }

    /// Stops whatever role the connection holds.
    ///
    /// A presenter stop ends the whole session: every viewer is sent
    /// `stopCommunication` and released, then the presenter's resources go
    /// and the session disappears. A viewer stop removes only that viewer.
    /// Unknown connections are a no-op, so disconnect handling can call
    /// this unconditionally.
    pub async fn stop(&self, connection_id: &str) {
        let Some((session_number, role)) = self.resolve(connection_id) else {
            return;
        };
        let Some(slot) = self.slot(&session_number) else {
            self.unregister_connection(connection_id);
            return;
        };

        let mut guard = slot.lock().await;
        match role {
            Role::Presenter => {
                info!("Presenter stopping session {}", session_number);
                for (viewer_conn, mut viewer) in guard.viewers.drain() {
                    send_to(&viewer.sender, &ServerMessage::StopCommunication);
                    viewer.release(self.engine.as_ref()).await;
                    self.unregister_connection(&viewer_conn);
                }
                if let Some(mut presenter) = guard.presenter.take() {
                    presenter.release(self.engine.as_ref()).await;
                }
                let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
                sessions.remove(&session_number);
            }
            Role::Viewer => {
                if let Some(mut viewer) = guard.viewers.remove(connection_id) {
                    viewer.release(self.engine.as_ref()).await;
                    debug!(
                        "Viewer {} left session {}",
                        connection_id, session_number
                    );
                }
            }
        }
        self.unregister_connection(connection_id);
    }

    fn slot(&self, session_number: &str) -> Option<Arc<TokioMutex<SessionSlot>>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_number).cloned()
    }

    fn register_connection(&self, connection_id: &str, session_number: &str, role: Role) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.insert(
            connection_id.to_string(),
            ConnEntry {
                session_number: session_number.to_string(),
                role,
            },
        );
    }

    fn unregister_connection(&self, connection_id: &str) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.remove(connection_id);
    }
}

/// Serializes a message and pushes it into a connection's outbound channel.
/// Slow or gone clients never block the caller.
pub(crate) fn send_to(sender: &mpsc::Sender<Arc<String>>, message: &ServerMessage) {
    let json = match serde_json::to_string(message) {
        Ok(json) => Arc::new(json),
        Err(e) => {
            warn!("Failed to serialize server message: {}", e);
            return;
        }
    };
    match sender.try_send(json) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Outbound channel full, dropping message");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Outbound channel closed, dropping message");
        }
    }
}
