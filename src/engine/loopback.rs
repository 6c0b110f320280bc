#![forbid(unsafe_code)]

// In-process loopback implementation of the engine client interface.
//
// Simulates an engine cluster with a global load-points capacity, fabricated
// SDP negotiation, and synthetic latency figures. Used by the test suite and
// as the default engine for dry-run benchmarking of the orchestration layer.

use crate::engine::types::{
    BandwidthLimits, ElementId, EndpointId, EndpointStats, EngineError, EngineId, EngineResult,
    FilterId, FilterStats, GraphId, IceCandidateInfo,
};
use crate::engine::{FilterKind, IceCallback, MediaEngine};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tracing::debug;

struct State {
    capacity_points: Option<u32>,
    used_points: u32,
    instances: HashMap<EngineId, u32>,
    graphs: HashMap<GraphId, EngineId>,
    endpoints: HashMap<EndpointId, GraphId>,
    filters: HashMap<FilterId, GraphId>,
    links: Vec<(ElementId, ElementId)>,
    sample_seq: u64,
}

impl State {
    fn graph_of(&self, element: ElementId) -> Option<GraphId> {
        match element {
            ElementId::Endpoint(id) => self.endpoints.get(&id).copied(),
            ElementId::Filter(id) => self.filters.get(&id).copied(),
        }
    }

    fn drop_graph(&mut self, graph: GraphId) -> Vec<EndpointId> {
        let mut dropped = Vec::new();
        self.endpoints.retain(|id, g| {
            if *g == graph {
                dropped.push(*id);
                false
            } else {
                true
            }
        });
        self.filters.retain(|_, g| *g != graph);
        let endpoints = &self.endpoints;
        let filters = &self.filters;
        let alive = |element: &ElementId| match element {
            ElementId::Endpoint(id) => endpoints.contains_key(id),
            ElementId::Filter(id) => filters.contains_key(id),
        };
        self.links.retain(|(a, b)| alive(a) && alive(b));
        self.graphs.remove(&graph);
        dropped
    }
}

/// Loopback engine: every handle is in-memory, every negotiation succeeds,
/// and releases are idempotent.
pub struct LoopbackEngine {
    state: StdMutex<State>,
    callbacks: StdMutex<HashMap<EndpointId, IceCallback>>,
}

impl LoopbackEngine {
    /// Creates a loopback engine with unlimited load capacity
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Creates a loopback engine that rejects instance creation once the sum
    /// of active load points would exceed `points`
    pub fn with_capacity(points: impl Into<Option<u32>>) -> Self {
        Self {
            state: StdMutex::new(State {
                capacity_points: points.into(),
                used_points: 0,
                instances: HashMap::new(),
                graphs: HashMap::new(),
                endpoints: HashMap::new(),
                filters: HashMap::new(),
                links: Vec::new(),
                sample_seq: 0,
            }),
            callbacks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of engine instances not yet destroyed
    pub fn live_instances(&self) -> usize {
        self.lock().instances.len()
    }

    /// Number of graphs not yet released
    pub fn live_graphs(&self) -> usize {
        self.lock().graphs.len()
    }

    /// Number of endpoints and filters not yet released
    pub fn live_elements(&self) -> usize {
        let state = self.lock();
        state.endpoints.len() + state.filters.len()
    }

    /// Load points currently held by active instances
    pub fn used_points(&self) -> u32 {
        self.lock().used_points
    }

    fn fire_candidates(&self, endpoint: EndpointId) {
        let candidates = vec![
            IceCandidateInfo {
                candidate: format!("candidate:1 1 UDP 2122260223 198.51.100.1 49152 typ host generation 0 ufrag {endpoint}"),
                sdp_mid: "video0".to_string(),
                sdp_m_line_index: 0,
            },
            IceCandidateInfo {
                candidate: format!("candidate:2 1 UDP 1686052607 203.0.113.7 3478 typ srflx generation 0 ufrag {endpoint}"),
                sdp_mid: "video0".to_string(),
                sdp_m_line_index: 0,
            },
        ];
        let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(callback) = callbacks.get(&endpoint) {
            for candidate in candidates {
                callback(candidate);
            }
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_instance(&self, load_points: u32) -> EngineResult<EngineId> {
        let mut state = self.lock();
        if let Some(capacity) = state.capacity_points {
            let remaining = capacity.saturating_sub(state.used_points);
            if load_points > remaining {
                return Err(EngineError::ResourceExhausted(format!(
                    "requested {load_points} load points, {remaining} available"
                )));
            }
        }
        let id = EngineId::new();
        state.used_points += load_points;
        state.instances.insert(id, load_points);
        debug!("Loopback instance {} provisioned with {} points", id, load_points);
        Ok(id)
    }

    async fn create_graph(&self, engine: EngineId) -> EngineResult<GraphId> {
        let mut state = self.lock();
        if !state.instances.contains_key(&engine) {
            return Err(EngineError::UnknownHandle(engine.to_string()));
        }
        let id = GraphId::new();
        state.graphs.insert(id, engine);
        Ok(id)
    }

    async fn create_endpoint(
        &self,
        graph: GraphId,
        _limits: BandwidthLimits,
    ) -> EngineResult<EndpointId> {
        let mut state = self.lock();
        if !state.graphs.contains_key(&graph) {
            return Err(EngineError::UnknownHandle(graph.to_string()));
        }
        let id = EndpointId::new();
        state.endpoints.insert(id, graph);
        Ok(id)
    }

    async fn create_filter(&self, graph: GraphId, kind: FilterKind) -> EngineResult<FilterId> {
        let mut state = self.lock();
        if !state.graphs.contains_key(&graph) {
            return Err(EngineError::UnknownHandle(graph.to_string()));
        }
        let id = FilterId::new();
        state.filters.insert(id, graph);
        debug!("Loopback filter {} ({:?}) created on graph {}", id, kind, graph);
        Ok(id)
    }

    async fn connect(&self, from: ElementId, to: ElementId) -> EngineResult<()> {
        let mut state = self.lock();
        let from_graph = state
            .graph_of(from)
            .ok_or_else(|| EngineError::UnknownHandle(from.to_string()))?;
        let to_graph = state
            .graph_of(to)
            .ok_or_else(|| EngineError::UnknownHandle(to.to_string()))?;
        if from_graph != to_graph {
            return Err(EngineError::Other(format!(
                "cannot connect elements across graphs ({from_graph} -> {to_graph})"
            )));
        }
        state.links.push((from, to));
        Ok(())
    }

    async fn generate_offer(&self, endpoint: EndpointId) -> EngineResult<String> {
        let state = self.lock();
        if !state.endpoints.contains_key(&endpoint) {
            return Err(EngineError::UnknownHandle(endpoint.to_string()));
        }
        Ok(format!(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=loopback-offer-{endpoint}\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n"
        ))
    }

    async fn process_offer(&self, endpoint: EndpointId, offer: &str) -> EngineResult<String> {
        let state = self.lock();
        if !state.endpoints.contains_key(&endpoint) {
            return Err(EngineError::UnknownHandle(endpoint.to_string()));
        }
        if offer.is_empty() {
            return Err(EngineError::NegotiationError("empty SDP offer".to_string()));
        }
        Ok(format!(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=loopback-answer-{endpoint}\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n"
        ))
    }

    async fn process_answer(&self, endpoint: EndpointId, answer: &str) -> EngineResult<()> {
        let state = self.lock();
        if !state.endpoints.contains_key(&endpoint) {
            return Err(EngineError::UnknownHandle(endpoint.to_string()));
        }
        if answer.is_empty() {
            return Err(EngineError::NegotiationError("empty SDP answer".to_string()));
        }
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        endpoint: EndpointId,
        _candidate: IceCandidateInfo,
    ) -> EngineResult<()> {
        let state = self.lock();
        if !state.endpoints.contains_key(&endpoint) {
            return Err(EngineError::UnknownHandle(endpoint.to_string()));
        }
        Ok(())
    }

    async fn gather_candidates(&self, endpoint: EndpointId) -> EngineResult<()> {
        {
            let state = self.lock();
            if !state.endpoints.contains_key(&endpoint) {
                return Err(EngineError::UnknownHandle(endpoint.to_string()));
            }
        }
        self.fire_candidates(endpoint);
        Ok(())
    }

    fn on_ice_candidate(&self, endpoint: EndpointId, callback: IceCallback) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        callbacks.insert(endpoint, callback);
    }

    async fn endpoint_stats(&self, endpoint: EndpointId) -> EngineResult<EndpointStats> {
        let mut state = self.lock();
        if !state.endpoints.contains_key(&endpoint) {
            return Err(EngineError::UnknownHandle(endpoint.to_string()));
        }
        state.sample_seq += 1;
        let jitter_ns = (state.sample_seq % 7) * 500_000;
        Ok(EndpointStats {
            e2e_latency_ns: 30_000_000 + jitter_ns,
            input_latency_ns: 5_000_000 + jitter_ns / 2,
        })
    }

    async fn filter_stats(&self, filter: FilterId) -> EngineResult<FilterStats> {
        let mut state = self.lock();
        if !state.filters.contains_key(&filter) {
            return Err(EngineError::UnknownHandle(filter.to_string()));
        }
        state.sample_seq += 1;
        let jitter_ns = (state.sample_seq % 5) * 400_000;
        Ok(FilterStats {
            input_latency_ns: 12_000_000 + jitter_ns,
        })
    }

    async fn release_element(&self, element: ElementId) -> EngineResult<()> {
        let mut state = self.lock();
        match element {
            ElementId::Endpoint(id) => {
                state.endpoints.remove(&id);
                let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
                callbacks.remove(&id);
            }
            ElementId::Filter(id) => {
                state.filters.remove(&id);
            }
        }
        state.links.retain(|(a, b)| *a != element && *b != element);
        Ok(())
    }

    async fn release_graph(&self, graph: GraphId) -> EngineResult<()> {
        let dropped = {
            let mut state = self.lock();
            state.drop_graph(graph)
        };
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        for endpoint in dropped {
            callbacks.remove(&endpoint);
        }
        Ok(())
    }

    async fn destroy_instance(&self, engine: EngineId) -> EngineResult<()> {
        let dropped = {
            let mut state = self.lock();
            let Some(points) = state.instances.remove(&engine) else {
                return Ok(());
            };
            state.used_points = state.used_points.saturating_sub(points);
            let graphs: Vec<GraphId> = state
                .graphs
                .iter()
                .filter(|(_, e)| **e == engine)
                .map(|(g, _)| *g)
                .collect();
            let mut dropped = Vec::new();
            for graph in graphs {
                dropped.extend(state.drop_graph(graph));
            }
            dropped
        };
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        for endpoint in dropped {
            callbacks.remove(&endpoint);
        }
        debug!("Loopback instance {} destroyed", engine);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn instance_capacity_is_enforced() {
        let engine = LoopbackEngine::with_capacity(100);
        let a = engine.create_instance(60).await.unwrap();
        let err = engine.create_instance(60).await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted(_)));

        engine.destroy_instance(a).await.unwrap();
        assert!(engine.create_instance(60).await.is_ok());
    }

    #[tokio::test]
    async fn offer_answer_round_trip() {
        let engine = LoopbackEngine::new();
        let instance = engine.create_instance(10).await.unwrap();
        let graph = engine.create_graph(instance).await.unwrap();
        let a = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();
        let b = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();

        let offer = engine.generate_offer(a).await.unwrap();
        let answer = engine.process_offer(b, &offer).await.unwrap();
        engine.process_answer(a, &answer).await.unwrap();
    }

    #[tokio::test]
    async fn gather_fires_registered_callback() {
        let engine = LoopbackEngine::new();
        let instance = engine.create_instance(10).await.unwrap();
        let graph = engine.create_graph(instance).await.unwrap();
        let ep = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        engine.on_ice_candidate(ep, Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        engine.gather_candidates(ep).await.unwrap();
        assert!(seen.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let engine = LoopbackEngine::new();
        let instance = engine.create_instance(10).await.unwrap();
        let graph = engine.create_graph(instance).await.unwrap();
        let ep = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();

        engine.release_element(ep.into()).await.unwrap();
        engine.release_element(ep.into()).await.unwrap();
        engine.release_graph(graph).await.unwrap();
        engine.release_graph(graph).await.unwrap();
        engine.destroy_instance(instance).await.unwrap();
        engine.destroy_instance(instance).await.unwrap();
        assert_eq!(engine.live_instances(), 0);
        assert_eq!(engine.live_elements(), 0);
    }

    #[tokio::test]
    async fn destroy_instance_drops_children() {
        let engine = LoopbackEngine::new();
        let instance = engine.create_instance(10).await.unwrap();
        let graph = engine.create_graph(instance).await.unwrap();
        engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();
        engine.create_filter(graph, FilterKind::FaceOverlay).await.unwrap();

        engine.destroy_instance(instance).await.unwrap();
        assert_eq!(engine.live_graphs(), 0);
        assert_eq!(engine.live_elements(), 0);
        assert_eq!(engine.used_points(), 0);
    }

    #[tokio::test]
    async fn cross_graph_connect_is_rejected() {
        let engine = LoopbackEngine::new();
        let instance = engine.create_instance(10).await.unwrap();
        let g1 = engine.create_graph(instance).await.unwrap();
        let g2 = engine.create_graph(instance).await.unwrap();
        let a = engine.create_endpoint(g1, BandwidthLimits::default()).await.unwrap();
        let b = engine.create_endpoint(g2, BandwidthLimits::default()).await.unwrap();

        assert!(engine.connect(a.into(), b.into()).await.is_err());
    }
}
