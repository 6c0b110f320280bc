#![forbid(unsafe_code)]

// Media path and ICE wiring helpers shared by viewer, fake-client, and
// tree-topology orchestration.

use crate::engine::{
    ElementId, EndpointId, EngineResult, FilterId, FilterKind, GraphId, IceCandidateInfo,
    MediaEngine,
};
use crate::signaling::protocol::ServerMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bounded capacity for local ICE forwarding channels. Endpoints gather a
/// handful of candidates; anything beyond this is a runaway engine.
const ICE_CHANNEL_CAPACITY: usize = 32;

/// Builds the media path from `from` to `to` on `graph`.
///
/// With `FilterKind::None` the endpoints are connected directly; otherwise
/// the filter is instantiated and chained between them. Returns the filter
/// handle when one was created.
pub async fn build_media_path(
    engine: &dyn MediaEngine,
    graph: GraphId,
    from: EndpointId,
    to: EndpointId,
    kind: FilterKind,
) -> EngineResult<Option<FilterId>> {
    if kind.is_none() {
        engine.connect(from.into(), to.into()).await?;
        debug!("Media path {} -> {}", from, to);
        return Ok(None);
    }

    let filter = engine.create_filter(graph, kind).await?;
    if let Err(e) = engine.connect(from.into(), filter.into()).await {
        let _ = engine.release_element(filter.into()).await;
        return Err(e);
    }
    if let Err(e) = engine.connect(filter.into(), to.into()).await {
        let _ = engine.release_element(filter.into()).await;
        return Err(e);
    }
    debug!("Media path {} -> {:?} filter -> {}", from, kind, to);
    Ok(Some(filter))
}

/// Wires ICE candidates bidirectionally between two engine-managed
/// endpoints, bypassing any real network path.
///
/// Each direction is a bounded channel fed by the endpoint's candidate
/// callback and drained by a forwarder task into the peer endpoint. The
/// forwarders exit when the engine drops the callbacks on release.
pub fn wire_local_ice(engine: Arc<dyn MediaEngine>, a: EndpointId, b: EndpointId) {
    wire_one_way(engine.clone(), a, b);
    wire_one_way(engine, b, a);
}

fn wire_one_way(engine: Arc<dyn MediaEngine>, from: EndpointId, to: EndpointId) {
    let (tx, mut rx) = mpsc::channel::<IceCandidateInfo>(ICE_CHANNEL_CAPACITY);

    engine.on_ice_candidate(
        from,
        Box::new(move |candidate| {
            if tx.try_send(candidate).is_err() {
                debug!("Local ICE channel for {} full or closed, dropping candidate", from);
            }
        }),
    );

    tokio::spawn(async move {
        while let Some(candidate) = rx.recv().await {
            if let Err(e) = engine.add_ice_candidate(to, candidate).await {
                debug!("Local ICE forward {} -> {} ended: {}", from, to, e);
                break;
            }
        }
    });
}

/// Registers the candidate callback that forwards an endpoint's gathered
/// ICE candidates to the owning signaling connection.
pub fn forward_candidates_to_client(
    engine: &dyn MediaEngine,
    endpoint: EndpointId,
    sender: mpsc::Sender<Arc<String>>,
) {
    engine.on_ice_candidate(
        endpoint,
        Box::new(move |candidate| {
            let message = ServerMessage::IceCandidate { candidate };
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.try_send(Arc::new(json)).is_err() {
                        debug!("Client channel closed, dropping ICE candidate from {}", endpoint);
                    }
                }
                Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
            }
        }),
    );
}

/// Releases an element, logging instead of propagating failure. Used on
/// teardown paths where release must keep going.
pub async fn release_quietly(engine: &dyn MediaEngine, element: ElementId) {
    if let Err(e) = engine.release_element(element).await {
        warn!("Failed to release {}: {}", element, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BandwidthLimits, LoopbackEngine};

    #[tokio::test]
    async fn direct_path_creates_no_filter() {
        let engine = LoopbackEngine::new();
        let instance = engine.create_instance(10).await.unwrap();
        let graph = engine.create_graph(instance).await.unwrap();
        let a = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();
        let b = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();

        let filter = build_media_path(&engine, graph, a, b, FilterKind::None).await.unwrap();
        assert!(filter.is_none());
        assert_eq!(engine.live_elements(), 2);
    }

    #[tokio::test]
    async fn filtered_path_chains_through_filter() {
        let engine = LoopbackEngine::new();
        let instance = engine.create_instance(10).await.unwrap();
        let graph = engine.create_graph(instance).await.unwrap();
        let a = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();
        let b = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();

        let filter = build_media_path(&engine, graph, a, b, FilterKind::Encoder).await.unwrap();
        assert!(filter.is_some());
        assert_eq!(engine.live_elements(), 3);
    }

    #[tokio::test]
    async fn local_ice_wiring_forwards_candidates() {
        let engine = Arc::new(LoopbackEngine::new());
        let instance = engine.create_instance(10).await.unwrap();
        let graph = engine.create_graph(instance).await.unwrap();
        let a = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();
        let b = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();

        wire_local_ice(engine.clone(), a, b);

        // Gathering on one endpoint must not error while the peer consumes
        // the forwarded candidates.
        engine.gather_candidates(a).await.unwrap();
        engine.gather_candidates(b).await.unwrap();
        tokio::task::yield_now().await;
    }
}
