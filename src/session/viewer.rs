#![forbid(unsafe_code)]

// Viewer session - negotiation, topology, and load generation for one viewer

use crate::engine::{
    BandwidthLimits, EndpointId, EngineError, FilterId, FilterKind, GraphId, IceCandidateInfo,
    MediaEngine,
};
use crate::session::fake::{self, FakeClientSettings, SharedFakeClientState};
use crate::session::latency::{self, SharedLatencyBuffers};
use crate::session::tree::{self, SharedTreeState, TreeSettings};
use crate::session::wiring;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a viewer attaches to the presenter stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Directly on the presenter graph
    Single,
    /// Through a cascade of auxiliary engine instances
    Tree,
}

impl Topology {
    /// Resolves the wire-level `kmsTopology` key. Anything but "tree" is
    /// the single topology.
    pub fn from_key(key: Option<&str>) -> Self {
        match key {
            Some("tree") => Topology::Tree,
            _ => Topology::Single,
        }
    }
}

/// Everything a viewer request configures beyond its session number
pub struct ViewerParams {
    pub sdp_offer: String,
    pub filter_kind: FilterKind,
    pub topology: Topology,
    pub fake: FakeClientSettings,
    pub tree: TreeSettings,
    /// Sampling interval when the latency sampler is enabled
    pub latency_interval: Option<Duration>,
}

/// One viewer of a broadcast session.
///
/// Owns the viewer endpoint (and filter), the shared state of its fake and
/// tree orchestration tasks, and its latency buffers. Created under the
/// session slot lock; `release` aborts the orchestration tasks before
/// draining their shared state, so the two never race.
pub struct ViewerSession {
    pub session_number: String,
    pub connection_id: String,
    pub sender: mpsc::Sender<Arc<String>>,
    endpoint: Option<EndpointId>,
    filter: Option<FilterId>,
    /// Tree topology only: buffers client candidates toward the tree head
    client_ice_tx: Option<mpsc::Sender<IceCandidateInfo>>,
    fake_state: SharedFakeClientState,
    fake_task: Option<JoinHandle<()>>,
    tree_state: SharedTreeState,
    tree_task: Option<JoinHandle<()>>,
    latency: SharedLatencyBuffers,
    sampler: Option<JoinHandle<()>>,
}

impl ViewerSession {
    /// Negotiates a viewer against a live presenter and starts its
    /// orchestration tasks. On failure, everything provisioned so far is
    /// released before the error is returned.
    #[allow(clippy::too_many_arguments)]
    pub async fn init(
        engine: &Arc<dyn MediaEngine>,
        presenter_graph: GraphId,
        presenter_endpoint: EndpointId,
        session_number: String,
        connection_id: String,
        sender: mpsc::Sender<Arc<String>>,
        params: ViewerParams,
        limits: BandwidthLimits,
    ) -> Result<(Self, String), EngineError> {
        let mut session = ViewerSession {
            session_number,
            connection_id,
            sender,
            endpoint: None,
            filter: None,
            client_ice_tx: None,
            fake_state: Arc::default(),
            fake_task: None,
            tree_state: Arc::default(),
            tree_task: None,
            latency: latency::new_buffers(),
            sampler: None,
        };

        let negotiated = match params.topology {
            Topology::Single => {
                session
                    .negotiate_single(engine, presenter_graph, presenter_endpoint, &params, limits)
                    .await
            }
            Topology::Tree => {
                session
                    .negotiate_tree(engine, presenter_graph, presenter_endpoint, &params, limits)
                    .await
            }
        };

        let sdp_answer = match negotiated {
            Ok(answer) => answer,
            Err(e) => {
                warn!(
                    "Viewer init failed in session {}: {}",
                    session.session_number, e
                );
                session.release(engine.as_ref()).await;
                return Err(e);
            }
        };

        if let Some(interval) = params.latency_interval {
            if let Some(endpoint) = session.endpoint {
                session.sampler = Some(latency::spawn_sampler(
                    engine.clone(),
                    endpoint,
                    session.filter,
                    interval,
                    session.latency.clone(),
                ));
            }
        }

        if params.fake.fake_clients > 0 {
            session.fake_task = Some(tokio::spawn(fake::run(
                engine.clone(),
                presenter_graph,
                presenter_endpoint,
                params.fake.clone(),
                limits,
                session.fake_state.clone(),
            )));
        }

        info!(
            "Viewer live in session {} (connection {}, {:?} topology)",
            session.session_number, session.connection_id, params.topology
        );
        Ok((session, sdp_answer))
    }

    async fn negotiate_single(
        &mut self,
        engine: &Arc<dyn MediaEngine>,
        presenter_graph: GraphId,
        presenter_endpoint: EndpointId,
        params: &ViewerParams,
        limits: BandwidthLimits,
    ) -> Result<String, EngineError> {
        let endpoint = engine.create_endpoint(presenter_graph, limits).await?;
        self.endpoint = Some(endpoint);

        wiring::forward_candidates_to_client(engine.as_ref(), endpoint, self.sender.clone());

        self.filter = wiring::build_media_path(
            engine.as_ref(),
            presenter_graph,
            presenter_endpoint,
            endpoint,
            params.filter_kind,
        )
        .await?;

        let sdp_answer = engine.process_offer(endpoint, &params.sdp_offer).await?;
        engine.gather_candidates(endpoint).await?;
        Ok(sdp_answer)
    }

    async fn negotiate_tree(
        &mut self,
        engine: &Arc<dyn MediaEngine>,
        presenter_graph: GraphId,
        presenter_endpoint: EndpointId,
        params: &ViewerParams,
        limits: BandwidthLimits,
    ) -> Result<String, EngineError> {
        let (head_tx, head_rx) = oneshot::channel();
        let (ice_tx, ice_rx) = mpsc::channel(64);
        self.client_ice_tx = Some(ice_tx);

        self.tree_task = Some(tokio::spawn(tree::build(
            engine.clone(),
            presenter_graph,
            presenter_endpoint,
            params.tree.clone(),
            params.sdp_offer.clone(),
            self.sender.clone(),
            ice_rx,
            limits,
            self.tree_state.clone(),
            head_tx,
        )));

        let head = head_rx
            .await
            .map_err(|_| EngineError::Other("tree builder stopped before answering".into()))??;
        self.endpoint = Some(head.endpoint);
        self.filter = head.filter;
        Ok(head.sdp_answer)
    }

    /// Endpoint delivering the stream to this viewer's client
    pub fn endpoint(&self) -> Option<EndpointId> {
        self.endpoint
    }

    /// Latency samples collected so far for this viewer
    pub fn latency_buffers(&self) -> SharedLatencyBuffers {
        self.latency.clone()
    }

    /// Feeds a client ICE candidate to the viewer endpoint
    pub async fn add_ice_candidate(
        &self,
        engine: &dyn MediaEngine,
        candidate: IceCandidateInfo,
    ) -> Result<(), EngineError> {
        if let Some(tx) = &self.client_ice_tx {
            if tx.try_send(candidate).is_err() {
                debug!("Dropping client candidate, tree head feed unavailable");
            }
            return Ok(());
        }
        match self.endpoint {
            Some(endpoint) => engine.add_ice_candidate(endpoint, candidate).await,
            None => Ok(()),
        }
    }

    /// Tears the viewer down: stop the sampler, abort the orchestration
    /// tasks, release the viewer elements, then drain fake and tree state.
    /// Safe to call more than once; no latency sample is appended after this
    /// returns.
    pub async fn release(&mut self, engine: &dyn MediaEngine) {
        latency::stop_sampler(&self.latency, self.sampler.take());

        if let Some(task) = self.fake_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.tree_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.client_ice_tx = None;

        if let Some(filter) = self.filter.take() {
            wiring::release_quietly(engine, filter.into()).await;
        }
        if let Some(endpoint) = self.endpoint.take() {
            wiring::release_quietly(engine, endpoint.into()).await;
        }

        self.fake_state.lock().await.drain_release(engine).await;
        self.tree_state.lock().await.drain_release(engine).await;
        debug!(
            "Viewer resources for connection {} released",
            self.connection_id
        );
    }
}
