#![forbid(unsafe_code)]

// Tree topology builder - cascades the presenter stream through levels of
// auxiliary engine instances before it reaches the real viewer.

use crate::engine::{
    BandwidthLimits, ElementId, EndpointId, EngineError, EngineId, EngineResult, FilterId,
    FilterKind, GraphId, MediaEngine,
};
use crate::session::wiring;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Knobs for one tree build, taken from the owning viewer's request
#[derive(Debug, Clone)]
pub struct TreeSettings {
    /// Levels of auxiliary engine instances
    pub levels: u32,
    /// Channels fanned out per level
    pub channels: u32,
    /// Minimum pause between provisioning successive levels
    pub level_rate: Duration,
    /// Load budget per auxiliary instance
    pub load_points: u32,
    /// Media filter inserted on every fan-out path
    pub filter_kind: FilterKind,
}

/// Everything the tree builder has provisioned so far. Shared between the
/// builder task and the owning viewer, which drains it on teardown (after
/// aborting the builder, so the two never race).
#[derive(Debug, Default)]
pub struct TreeState {
    /// Fan-out elements on the presenter graph, one per level x channel:
    /// the optional filter and the intermediate endpoint behind it
    pub intermediates: Vec<(Option<FilterId>, EndpointId)>,
    pub instances: Vec<EngineId>,
    pub graphs: Vec<GraphId>,
    /// Elements created on each auxiliary graph, in creation order
    pub elements: HashMap<GraphId, Vec<ElementId>>,
}

impl TreeState {
    /// Releases everything still recorded, leaving the state empty
    pub async fn drain_release(&mut self, engine: &dyn MediaEngine) {
        for (filter, endpoint) in self.intermediates.drain(..) {
            if let Some(filter) = filter {
                wiring::release_quietly(engine, filter.into()).await;
            }
            wiring::release_quietly(engine, endpoint.into()).await;
        }
        for graph in &self.graphs {
            for element in self.elements.remove(graph).unwrap_or_default() {
                wiring::release_quietly(engine, element).await;
            }
        }
        self.elements.clear();
        for graph in self.graphs.drain(..) {
            if let Err(e) = engine.release_graph(graph).await {
                warn!("Failed to release tree graph {}: {}", graph, e);
            }
        }
        for instance in self.instances.drain(..) {
            if let Err(e) = engine.destroy_instance(instance).await {
                warn!("Failed to destroy tree instance {}: {}", instance, e);
            }
        }
    }
}

pub type SharedTreeState = Arc<TokioMutex<TreeState>>;

/// The viewer-facing head of a built tree: the endpoint that answered the
/// client's SDP offer, plus its filter when one was created.
#[derive(Debug)]
pub struct TreeHead {
    pub endpoint: EndpointId,
    pub filter: Option<FilterId>,
    pub sdp_answer: String,
}

/// Builds the tree, sending the viewer-facing head through `head_tx` exactly
/// once: `Ok` as soon as the first level's first channel has answered the
/// client offer, `Err` if the build fails before reaching that point.
/// Failures after the head was sent are logged and end the build without
/// retracting the answer.
///
/// Spawned as a detached task by the owning viewer and aborted on viewer
/// teardown; every `await` is an interruption point. Provisioned handles are
/// recorded in `state` before use, so teardown can always drain them.
#[allow(clippy::too_many_arguments)]
pub async fn build(
    engine: Arc<dyn MediaEngine>,
    presenter_graph: GraphId,
    presenter_endpoint: EndpointId,
    settings: TreeSettings,
    sdp_offer: String,
    client_sender: mpsc::Sender<Arc<String>>,
    client_candidates: mpsc::Receiver<crate::engine::IceCandidateInfo>,
    limits: BandwidthLimits,
    state: SharedTreeState,
    head_tx: oneshot::Sender<Result<TreeHead, EngineError>>,
) {
    let mut head_tx = Some(head_tx);
    let mut client_candidates = Some(client_candidates);

    let result = build_inner(
        &engine,
        presenter_graph,
        presenter_endpoint,
        &settings,
        &sdp_offer,
        &client_sender,
        &mut client_candidates,
        limits,
        &state,
        &mut head_tx,
    )
    .await;

    match result {
        Ok(()) => info!(
            "Tree build finished: {} levels x {} channels",
            settings.levels, settings.channels
        ),
        Err(e) => match head_tx.take() {
            // The real viewer never got an answer: fail its init.
            Some(tx) => {
                let _ = tx.send(Err(e));
            }
            // The viewer is already live on the head; later levels only
            // carried synthetic load.
            None => warn!("Tree build failed after head was delivered: {}", e),
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn build_inner(
    engine: &Arc<dyn MediaEngine>,
    presenter_graph: GraphId,
    presenter_endpoint: EndpointId,
    settings: &TreeSettings,
    sdp_offer: &str,
    client_sender: &mpsc::Sender<Arc<String>>,
    client_candidates: &mut Option<mpsc::Receiver<crate::engine::IceCandidateInfo>>,
    limits: BandwidthLimits,
    state: &SharedTreeState,
    head_tx: &mut Option<oneshot::Sender<Result<TreeHead, EngineError>>>,
) -> EngineResult<()> {
    let levels = settings.levels.max(1);
    let channels = settings.channels.max(1);
    // Both factors come off the wire; reject fan-outs the index math
    // cannot represent instead of overflowing.
    let fan_out = levels.checked_mul(channels).ok_or_else(|| {
        EngineError::Other(format!("tree fan-out {}x{} is out of range", levels, channels))
    })?;

    // Fan-out stage on the presenter graph: one intermediate endpoint per
    // level x channel, each fed from the presenter through the filter path.
    for _ in 0..fan_out {
        let endpoint = engine.create_endpoint(presenter_graph, limits).await?;
        let filter = match wiring::build_media_path(
            engine.as_ref(),
            presenter_graph,
            presenter_endpoint,
            endpoint,
            settings.filter_kind,
        )
        .await
        {
            Ok(filter) => filter,
            Err(e) => {
                wiring::release_quietly(engine.as_ref(), endpoint.into()).await;
                return Err(e);
            }
        };
        state.lock().await.intermediates.push((filter, endpoint));
    }

    for level in 0..levels {
        let started = Instant::now();

        let instance = engine.create_instance(settings.load_points).await?;
        state.lock().await.instances.push(instance);
        let graph = engine.create_graph(instance).await?;
        state.lock().await.graphs.push(graph);

        for channel in 0..channels {
            let index = (level * channels + channel) as usize;
            let intermediate = {
                let guard = state.lock().await;
                guard.intermediates[index].1
            };

            let target = engine.create_endpoint(graph, limits).await?;
            state.lock().await.elements.entry(graph).or_default().push(target.into());

            wiring::wire_local_ice(engine.clone(), intermediate, target);
            let offer = engine.generate_offer(intermediate).await?;
            let answer = engine.process_offer(target, &offer).await?;
            engine.process_answer(intermediate, &answer).await?;
            engine.gather_candidates(intermediate).await?;
            engine.gather_candidates(target).await?;

            if level == 0 && channel == 0 {
                attach_viewer_head(
                    engine,
                    graph,
                    target,
                    settings.filter_kind,
                    sdp_offer,
                    client_sender,
                    client_candidates,
                    limits,
                    state,
                    head_tx,
                )
                .await?;
            } else {
                attach_sink(engine, graph, target, settings.filter_kind, limits, state).await?;
            }
        }

        debug!("Tree level {} wired on graph {}", level, graph);

        if level + 1 < levels {
            let elapsed = started.elapsed();
            match settings.level_rate.checked_sub(elapsed) {
                Some(remaining) => tokio::time::sleep(remaining).await,
                None => info!(
                    "Tree level {} wiring took {:?}, skipping inter-level wait",
                    level, elapsed
                ),
            }
        }
    }

    Ok(())
}

/// Terminates (level 0, channel 0) in the real viewer: an endpoint on the
/// auxiliary graph that answers the client's SDP offer.
#[allow(clippy::too_many_arguments)]
async fn attach_viewer_head(
    engine: &Arc<dyn MediaEngine>,
    graph: GraphId,
    source: EndpointId,
    filter_kind: FilterKind,
    sdp_offer: &str,
    client_sender: &mpsc::Sender<Arc<String>>,
    client_candidates: &mut Option<mpsc::Receiver<crate::engine::IceCandidateInfo>>,
    limits: BandwidthLimits,
    state: &SharedTreeState,
    head_tx: &mut Option<oneshot::Sender<Result<TreeHead, EngineError>>>,
) -> EngineResult<()> {
    let endpoint = engine.create_endpoint(graph, limits).await?;
    state.lock().await.elements.entry(graph).or_default().push(endpoint.into());

    let filter =
        wiring::build_media_path(engine.as_ref(), graph, source, endpoint, filter_kind).await?;
    if let Some(filter) = filter {
        state.lock().await.elements.entry(graph).or_default().push(filter.into());
    }

    wiring::forward_candidates_to_client(engine.as_ref(), endpoint, client_sender.clone());
    // Client candidates that arrived while the tree was still being built
    // are buffered by the registry and replayed here.
    if let Some(mut rx) = client_candidates.take() {
        let feed = engine.clone();
        tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                if let Err(e) = feed.add_ice_candidate(endpoint, candidate).await {
                    debug!("Client ICE feed for {} ended: {}", endpoint, e);
                    break;
                }
            }
        });
    }

    let sdp_answer = engine.process_offer(endpoint, sdp_offer).await?;
    engine.gather_candidates(endpoint).await?;

    if let Some(tx) = head_tx.take() {
        let _ = tx.send(Ok(TreeHead {
            endpoint,
            filter,
            sdp_answer,
        }));
    }
    Ok(())
}

/// Terminates a synthetic channel in a discard sink on the auxiliary graph
async fn attach_sink(
    engine: &Arc<dyn MediaEngine>,
    graph: GraphId,
    source: EndpointId,
    filter_kind: FilterKind,
    limits: BandwidthLimits,
    state: &SharedTreeState,
) -> EngineResult<()> {
    let sink = engine.create_endpoint(graph, limits).await?;
    state.lock().await.elements.entry(graph).or_default().push(sink.into());

    let filter =
        wiring::build_media_path(engine.as_ref(), graph, source, sink, filter_kind).await?;
    if let Some(filter) = filter {
        state.lock().await.elements.entry(graph).or_default().push(filter.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackEngine;

    fn settings(levels: u32, channels: u32) -> TreeSettings {
        TreeSettings {
            levels,
            channels,
            level_rate: Duration::ZERO,
            load_points: 10,
            filter_kind: FilterKind::None,
        }
    }

    async fn presenter_setup(engine: &Arc<LoopbackEngine>) -> (GraphId, EndpointId) {
        let instance = engine.create_instance(50).await.unwrap();
        let graph = engine.create_graph(instance).await.unwrap();
        let ep = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();
        (graph, ep)
    }

    fn client_channels() -> (
        mpsc::Sender<Arc<String>>,
        mpsc::Receiver<crate::engine::IceCandidateInfo>,
    ) {
        let (tx, _rx) = mpsc::channel(64);
        let (ctx, crx) = mpsc::channel(64);
        // The feed task exits once the sender side is gone; the tests never
        // inject client candidates.
        drop(ctx);
        (tx, crx)
    }

    #[tokio::test(start_paused = true)]
    async fn head_is_delivered_and_levels_provisioned() {
        let loopback = Arc::new(LoopbackEngine::new());
        let engine: Arc<dyn MediaEngine> = loopback.clone();
        let (graph, ep) = presenter_setup(&loopback).await;
        let state: SharedTreeState = Arc::default();
        let (head_tx, head_rx) = oneshot::channel();
        let (sender, candidates) = client_channels();

        let builder = tokio::spawn(build(
            engine,
            graph,
            ep,
            settings(2, 2),
            "v=0 client offer".into(),
            sender,
            candidates,
            BandwidthLimits::default(),
            state.clone(),
            head_tx,
        ));

        let head = head_rx.await.unwrap().unwrap();
        assert!(head.sdp_answer.contains("answer"));
        assert!(head.filter.is_none());

        builder.await.unwrap();
        let guard = state.lock().await;
        assert_eq!(guard.instances.len(), 2);
        assert_eq!(guard.graphs.len(), 2);
        assert_eq!(guard.intermediates.len(), 4);
        // Per level: 2 targets + head-or-sink endpoints. Level 0 carries the
        // viewer head, level 1 two sinks.
        let aux_elements: usize = guard.elements.values().map(Vec::len).sum();
        assert_eq!(aux_elements, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_build_reports_error_through_head() {
        // Presenter takes 50 of 55 points; the first auxiliary instance
        // cannot be provisioned.
        let loopback = Arc::new(LoopbackEngine::with_capacity(55));
        let engine: Arc<dyn MediaEngine> = loopback.clone();
        let (graph, ep) = presenter_setup(&loopback).await;
        let state: SharedTreeState = Arc::default();
        let (head_tx, head_rx) = oneshot::channel();
        let (sender, candidates) = client_channels();

        let builder = tokio::spawn(build(
            engine,
            graph,
            ep,
            settings(1, 1),
            "v=0 client offer".into(),
            sender,
            candidates,
            BandwidthLimits::default(),
            state.clone(),
            head_tx,
        ));

        let head = head_rx.await.unwrap();
        assert!(matches!(head, Err(EngineError::ResourceExhausted(_))));
        builder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_fan_out_is_rejected_not_built() {
        let loopback = Arc::new(LoopbackEngine::new());
        let engine: Arc<dyn MediaEngine> = loopback.clone();
        let (graph, ep) = presenter_setup(&loopback).await;
        let state: SharedTreeState = Arc::default();
        let (head_tx, head_rx) = oneshot::channel();
        let (sender, candidates) = client_channels();

        let builder = tokio::spawn(build(
            engine,
            graph,
            ep,
            settings(u32::MAX, 2),
            "v=0 client offer".into(),
            sender,
            candidates,
            BandwidthLimits::default(),
            state.clone(),
            head_tx,
        ));

        let head = head_rx.await.unwrap();
        assert!(matches!(head, Err(EngineError::Other(_))));
        builder.await.unwrap();
        // Nothing was provisioned on the way out.
        assert!(state.lock().await.intermediates.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_release_clears_everything() {
        let loopback = Arc::new(LoopbackEngine::new());
        let engine: Arc<dyn MediaEngine> = loopback.clone();
        let (graph, ep) = presenter_setup(&loopback).await;
        let state: SharedTreeState = Arc::default();
        let (head_tx, head_rx) = oneshot::channel();
        let (sender, candidates) = client_channels();

        let builder = tokio::spawn(build(
            engine.clone(),
            graph,
            ep,
            settings(2, 1),
            "v=0 client offer".into(),
            sender,
            candidates,
            BandwidthLimits::default(),
            state.clone(),
            head_tx,
        ));
        head_rx.await.unwrap().unwrap();
        builder.await.unwrap();

        state.lock().await.drain_release(engine.as_ref()).await;
        // Presenter instance, graph, and endpoint survive.
        assert_eq!(loopback.live_instances(), 1);
        assert_eq!(loopback.live_graphs(), 1);
        assert_eq!(loopback.live_elements(), 1);
    }
}
