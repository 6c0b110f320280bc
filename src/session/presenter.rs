#![forbid(unsafe_code)]

// Presenter session - engine resources and negotiation for the broadcaster

use crate::engine::{
    BandwidthLimits, EndpointId, EngineError, EngineId, GraphId, MediaEngine,
};
use crate::session::wiring;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The presenter's half of a broadcast session.
///
/// Owns one engine instance, the presenter graph, and the upstream WebRTC
/// endpoint. Created by `SessionRegistry::start_presenter` under the session
/// slot lock; `release` is idempotent and tears the whole tree down by
/// releasing the graph and destroying the instance.
pub struct PresenterSession {
    pub session_number: String,
    pub connection_id: String,
    pub sender: mpsc::Sender<Arc<String>>,
    instance: Option<EngineId>,
    graph: Option<GraphId>,
    endpoint: Option<EndpointId>,
}

impl PresenterSession {
    /// Provisions engine resources for a presenter and negotiates its SDP.
    ///
    /// On success the session is live and gathering ICE candidates toward
    /// the client. On failure, everything provisioned so far is released
    /// before the error is returned.
    pub async fn init(
        engine: &Arc<dyn MediaEngine>,
        session_number: String,
        connection_id: String,
        sender: mpsc::Sender<Arc<String>>,
        sdp_offer: &str,
        load_points: u32,
        limits: BandwidthLimits,
    ) -> Result<(Self, String), EngineError> {
        let mut session = PresenterSession {
            session_number,
            connection_id,
            sender,
            instance: None,
            graph: None,
            endpoint: None,
        };

        match session.negotiate(engine, sdp_offer, load_points, limits).await {
            Ok(sdp_answer) => {
                info!(
                    "Presenter live in session {} (connection {})",
                    session.session_number, session.connection_id
                );
                Ok((session, sdp_answer))
            }
            Err(e) => {
                warn!(
                    "Presenter init failed in session {}: {}",
                    session.session_number, e
                );
                session.release(engine.as_ref()).await;
                Err(e)
            }
        }
    }

    async fn negotiate(
        &mut self,
        engine: &Arc<dyn MediaEngine>,
        sdp_offer: &str,
        load_points: u32,
        limits: BandwidthLimits,
    ) -> Result<String, EngineError> {
        let instance = engine.create_instance(load_points).await?;
        self.instance = Some(instance);

        let graph = engine.create_graph(instance).await?;
        self.graph = Some(graph);

        let endpoint = engine.create_endpoint(graph, limits).await?;
        self.endpoint = Some(endpoint);

        wiring::forward_candidates_to_client(engine.as_ref(), endpoint, self.sender.clone());

        let sdp_answer = engine.process_offer(endpoint, sdp_offer).await?;
        engine.gather_candidates(endpoint).await?;
        Ok(sdp_answer)
    }

    /// Graph hosting the presenter's media elements. `None` only before a
    /// successful init or after release.
    pub fn graph(&self) -> Option<GraphId> {
        self.graph
    }

    /// Upstream endpoint receiving the presenter's stream
    pub fn endpoint(&self) -> Option<EndpointId> {
        self.endpoint
    }

    /// Feeds a client ICE candidate to the presenter endpoint
    pub async fn add_ice_candidate(
        &self,
        engine: &dyn MediaEngine,
        candidate: crate::engine::IceCandidateInfo,
    ) -> Result<(), EngineError> {
        match self.endpoint {
            Some(endpoint) => engine.add_ice_candidate(endpoint, candidate).await,
            None => Ok(()),
        }
    }

    /// Releases the presenter graph, then destroys the engine instance.
    /// Safe to call more than once.
    pub async fn release(&mut self, engine: &dyn MediaEngine) {
        self.endpoint = None;

        if let Some(graph) = self.graph.take() {
            if let Err(e) = engine.release_graph(graph).await {
                warn!("Failed to release presenter graph {}: {}", graph, e);
            }
        }
        if let Some(instance) = self.instance.take() {
            if let Err(e) = engine.destroy_instance(instance).await {
                warn!("Failed to destroy presenter instance {}: {}", instance, e);
            }
            debug!("Presenter resources for session {} released", self.session_number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackEngine;

    fn sender() -> mpsc::Sender<Arc<String>> {
        mpsc::channel(16).0
    }

    fn channel() -> (mpsc::Sender<Arc<String>>, mpsc::Receiver<Arc<String>>) {
        mpsc::channel(16)
    }

    #[tokio::test]
    async fn init_provisions_instance_graph_endpoint() {
        let loopback = Arc::new(LoopbackEngine::new());
        let engine: Arc<dyn MediaEngine> = loopback.clone();

        let (session, answer) = PresenterSession::init(
            &engine,
            "1".into(),
            "conn-a".into(),
            sender(),
            "v=0 offer",
            50,
            BandwidthLimits::default(),
        )
        .await
        .unwrap();

        assert!(answer.contains("answer"));
        assert!(session.graph().is_some());
        assert!(session.endpoint().is_some());
        assert_eq!(loopback.live_instances(), 1);
        assert_eq!(loopback.live_graphs(), 1);
        assert_eq!(loopback.live_elements(), 1);
    }

    #[tokio::test]
    async fn init_forwards_gathered_candidates() {
        let loopback = Arc::new(LoopbackEngine::new());
        let engine: Arc<dyn MediaEngine> = loopback.clone();
        let (tx, mut rx) = channel();

        let _session = PresenterSession::init(
            &engine,
            "1".into(),
            "conn-a".into(),
            tx,
            "v=0 offer",
            50,
            BandwidthLimits::default(),
        )
        .await
        .unwrap();

        let raw = rx.try_recv().expect("a gathered candidate should be forwarded");
        assert!(raw.contains("iceCandidate"));
    }

    #[tokio::test]
    async fn failed_init_releases_everything() {
        let loopback = Arc::new(LoopbackEngine::with_capacity(10));
        let engine: Arc<dyn MediaEngine> = loopback.clone();

        let result = PresenterSession::init(
            &engine,
            "1".into(),
            "conn-a".into(),
            sender(),
            "v=0 offer",
            100,
            BandwidthLimits::default(),
        )
        .await;

        assert!(matches!(result, Err(EngineError::ResourceExhausted(_))));
        assert_eq!(loopback.live_instances(), 0);
        assert_eq!(loopback.used_points(), 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let loopback = Arc::new(LoopbackEngine::new());
        let engine: Arc<dyn MediaEngine> = loopback.clone();

        let (mut session, _) = PresenterSession::init(
            &engine,
            "1".into(),
            "conn-a".into(),
            sender(),
            "v=0 offer",
            50,
            BandwidthLimits::default(),
        )
        .await
        .unwrap();

        session.release(engine.as_ref()).await;
        session.release(engine.as_ref()).await;
        assert_eq!(loopback.live_instances(), 0);
        assert_eq!(loopback.live_graphs(), 0);
        assert_eq!(loopback.live_elements(), 0);
    }
}
