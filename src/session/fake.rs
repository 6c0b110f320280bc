#![forbid(unsafe_code)]

// Fake-client load generator - synthetic viewers driven against a live
// presenter to load the engine without real browsers.

use crate::engine::{
    BandwidthLimits, ElementId, EndpointId, EngineId, EngineResult, FilterId, FilterKind, GraphId,
    MediaEngine,
};
use crate::session::wiring;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Knobs for one fake-client run, taken from the owning viewer's request
#[derive(Debug, Clone)]
pub struct FakeClientSettings {
    /// Number of synthetic viewers to launch
    pub fake_clients: u32,
    /// Stagger between launches
    pub time_between_clients: Duration,
    /// Load budget per auxiliary engine instance
    pub fake_points: u32,
    /// Synthetic viewers per auxiliary instance before a new one is provisioned
    pub fake_clients_per_instance: u32,
    /// Media filter inserted on each synthetic path
    pub filter_kind: FilterKind,
    /// Tear the synthetic viewers down again after the hold period
    pub remove_fake_clients: bool,
    /// Hold duration per auxiliary graph before its teardown begins
    pub play_time: Duration,
}

/// Engine elements of one synthetic viewer: the fan-out endpoint on the
/// presenter graph, the simulated client endpoint on an auxiliary graph, and
/// the optional filter between presenter and fan-out endpoint.
#[derive(Debug, Clone, Copy)]
pub struct FakeTriple {
    pub filter: Option<FilterId>,
    pub out_endpoint: EndpointId,
    pub sim_endpoint: EndpointId,
}

/// Everything the generator has provisioned so far. Shared between the
/// generator task and the owning viewer, which drains it on teardown (after
/// aborting the generator, so the two never race).
#[derive(Debug, Default)]
pub struct FakeClientState {
    pub instances: Vec<EngineId>,
    pub graphs: Vec<GraphId>,
    pub elements: HashMap<GraphId, Vec<FakeTriple>>,
    /// Elements of workers still mid-construction, recorded as soon as the
    /// engine hands them out. A worker moves its entries into `elements` on
    /// success and removes them on failure; entries still here when the
    /// generator is aborted belong to interrupted workers and are released
    /// by `drain_release`.
    pub pending: Vec<ElementId>,
}

impl FakeClientState {
    pub fn total_clients(&self) -> usize {
        self.elements.values().map(Vec::len).sum()
    }

    /// Releases everything still recorded, leaving the state empty.
    /// Order per triple: filter, fan-out endpoint, simulated endpoint.
    pub async fn drain_release(&mut self, engine: &dyn MediaEngine) {
        for element in self.pending.drain(..) {
            wiring::release_quietly(engine, element).await;
        }
        for graph in &self.graphs {
            for triple in self.elements.remove(graph).unwrap_or_default() {
                if let Some(filter) = triple.filter {
                    wiring::release_quietly(engine, filter.into()).await;
                }
                wiring::release_quietly(engine, triple.out_endpoint.into()).await;
                wiring::release_quietly(engine, triple.sim_endpoint.into()).await;
            }
        }
        self.elements.clear();
        for graph in self.graphs.drain(..) {
            if let Err(e) = engine.release_graph(graph).await {
                warn!("Failed to release fake-client graph {}: {}", graph, e);
            }
        }
        for instance in self.instances.drain(..) {
            if let Err(e) = engine.destroy_instance(instance).await {
                warn!("Failed to destroy fake-client instance {}: {}", instance, e);
            }
        }
    }
}

pub type SharedFakeClientState = Arc<TokioMutex<FakeClientState>>;

/// Runs a complete fake-client campaign: staggered launches into a worker
/// pool, a completion barrier, and (when requested) the timed teardown.
///
/// Spawned as a detached task by the owning viewer and aborted on viewer
/// teardown; every `await` in here is an interruption point.
pub async fn run(
    engine: Arc<dyn MediaEngine>,
    presenter_graph: GraphId,
    presenter_endpoint: EndpointId,
    settings: FakeClientSettings,
    limits: BandwidthLimits,
    state: SharedFakeClientState,
) {
    let per_instance = settings.fake_clients_per_instance.max(1);
    let mut workers = JoinSet::new();
    let mut current_graph: Option<GraphId> = None;

    for i in 0..settings.fake_clients {
        // The i-th launch is scheduled at i * timeBetweenClients; workers
        // run concurrently once released.
        if i > 0 && !settings.time_between_clients.is_zero() {
            tokio::time::sleep(settings.time_between_clients).await;
        }

        if i % per_instance == 0 {
            current_graph = match provision_instance(engine.as_ref(), settings.fake_points, &state)
                .await
            {
                Ok(graph) => Some(graph),
                Err(e) => {
                    warn!("Failed to provision auxiliary instance for fake client {}: {}", i, e);
                    None
                }
            };
        }

        let Some(aux_graph) = current_graph else {
            warn!("No auxiliary graph available, skipping fake client {}", i);
            continue;
        };

        workers.spawn(launch_worker(
            engine.clone(),
            presenter_graph,
            presenter_endpoint,
            aux_graph,
            settings.filter_kind,
            limits,
            state.clone(),
            i,
        ));
    }

    // Completion barrier: every worker has finished (or failed) before the
    // run counts as launched. A failed worker never aborts its siblings.
    let mut failures = 0u32;
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                warn!("Fake client worker failed: {}", e);
            }
            Err(e) => {
                failures += 1;
                warn!("Fake client worker aborted: {}", e);
            }
        }
    }

    let launched = state.lock().await.total_clients();
    info!(
        "Fake client generation finished: {} live, {} failed",
        launched, failures
    );

    if settings.remove_fake_clients {
        teardown(engine.as_ref(), &settings, &state).await;
    }
}

async fn provision_instance(
    engine: &dyn MediaEngine,
    fake_points: u32,
    state: &SharedFakeClientState,
) -> EngineResult<GraphId> {
    let instance = engine.create_instance(fake_points).await?;
    let graph = match engine.create_graph(instance).await {
        Ok(graph) => graph,
        Err(e) => {
            if let Err(destroy_err) = engine.destroy_instance(instance).await {
                warn!("Failed to destroy instance {}: {}", instance, destroy_err);
            }
            return Err(e);
        }
    };
    let mut guard = state.lock().await;
    guard.instances.push(instance);
    guard.graphs.push(graph);
    Ok(graph)
}

/// Builds one synthetic viewer: fan-out endpoint on the presenter graph,
/// simulated client endpoint on the auxiliary graph, local ICE wiring, the
/// filter path, and a full offer/answer exchange.
#[allow(clippy::too_many_arguments)]
async fn launch_worker(
    engine: Arc<dyn MediaEngine>,
    presenter_graph: GraphId,
    presenter_endpoint: EndpointId,
    aux_graph: GraphId,
    filter_kind: FilterKind,
    limits: BandwidthLimits,
    state: SharedFakeClientState,
    index: u32,
) -> EngineResult<()> {
    // Every handle lands in the shared pending list the moment the engine
    // returns it, so an abort mid-worker never orphans an element: whatever
    // is still pending is released by `drain_release`.
    let mut created: Vec<ElementId> = Vec::new();

    let result = async {
        let out_endpoint = engine.create_endpoint(presenter_graph, limits).await?;
        created.push(out_endpoint.into());
        state.lock().await.pending.push(out_endpoint.into());
        let sim_endpoint = engine.create_endpoint(aux_graph, limits).await?;
        created.push(sim_endpoint.into());
        state.lock().await.pending.push(sim_endpoint.into());

        wiring::wire_local_ice(engine.clone(), out_endpoint, sim_endpoint);

        let filter = wiring::build_media_path(
            engine.as_ref(),
            presenter_graph,
            presenter_endpoint,
            out_endpoint,
            filter_kind,
        )
        .await?;
        if let Some(filter) = filter {
            created.push(filter.into());
            state.lock().await.pending.push(filter.into());
        }

        let offer = engine.generate_offer(out_endpoint).await?;
        let answer = engine.process_offer(sim_endpoint, &offer).await?;
        engine.process_answer(out_endpoint, &answer).await?;
        engine.gather_candidates(out_endpoint).await?;
        engine.gather_candidates(sim_endpoint).await?;

        Ok(FakeTriple {
            filter,
            out_endpoint,
            sim_endpoint,
        })
    }
    .await;

    match result {
        Ok(triple) => {
            let mut guard = state.lock().await;
            guard.pending.retain(|element| !created.contains(element));
            guard.elements.entry(aux_graph).or_default().push(triple);
            debug!("Fake client {} live on graph {}", index, aux_graph);
            Ok(())
        }
        Err(e) => {
            state.lock().await.pending.retain(|element| !created.contains(element));
            for element in created {
                wiring::release_quietly(engine.as_ref(), element).await;
            }
            Err(e)
        }
    }
}

/// Timed teardown: per auxiliary graph, hold for `play_time`, then release
/// its synthetic viewers one by one with the launch stagger, and finally
/// drop the graphs and instances.
async fn teardown(
    engine: &dyn MediaEngine,
    settings: &FakeClientSettings,
    state: &SharedFakeClientState,
) {
    let graphs: Vec<GraphId> = state.lock().await.graphs.clone();

    for graph in &graphs {
        tokio::time::sleep(settings.play_time).await;
        let triples = state.lock().await.elements.remove(graph).unwrap_or_default();
        for (i, triple) in triples.iter().enumerate() {
            if i > 0 && !settings.time_between_clients.is_zero() {
                tokio::time::sleep(settings.time_between_clients).await;
            }
            if let Some(filter) = triple.filter {
                wiring::release_quietly(engine, filter.into()).await;
            }
            wiring::release_quietly(engine, triple.out_endpoint.into()).await;
            wiring::release_quietly(engine, triple.sim_endpoint.into()).await;
        }
        debug!("Fake clients on graph {} removed", graph);
    }

    let mut guard = state.lock().await;
    for graph in guard.graphs.drain(..) {
        if let Err(e) = engine.release_graph(graph).await {
            warn!("Failed to release fake-client graph {}: {}", graph, e);
        }
    }
    for instance in guard.instances.drain(..) {
        if let Err(e) = engine.destroy_instance(instance).await {
            warn!("Failed to destroy fake-client instance {}: {}", instance, e);
        }
    }
    info!("Fake client teardown finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        EndpointStats, FilterStats, IceCallback, IceCandidateInfo, LoopbackEngine,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(fake_clients: u32, per_instance: u32) -> FakeClientSettings {
        FakeClientSettings {
            fake_clients,
            time_between_clients: Duration::ZERO,
            fake_points: 10,
            fake_clients_per_instance: per_instance,
            filter_kind: FilterKind::None,
            remove_fake_clients: false,
            play_time: Duration::ZERO,
        }
    }

    async fn presenter_setup(
        engine: &Arc<LoopbackEngine>,
    ) -> (GraphId, EndpointId) {
        let instance = engine.create_instance(50).await.unwrap();
        let graph = engine.create_graph(instance).await.unwrap();
        let ep = engine.create_endpoint(graph, BandwidthLimits::default()).await.unwrap();
        (graph, ep)
    }

    #[tokio::test]
    async fn five_clients_two_per_instance_need_three_instances() {
        let loopback = Arc::new(LoopbackEngine::new());
        let (graph, ep) = presenter_setup(&loopback).await;
        let state: SharedFakeClientState = Arc::default();

        run(
            loopback.clone(),
            graph,
            ep,
            settings(5, 2),
            BandwidthLimits::default(),
            state.clone(),
        )
        .await;

        let guard = state.lock().await;
        assert_eq!(guard.instances.len(), 3);
        assert_eq!(guard.graphs.len(), 3);
        assert_eq!(guard.total_clients(), 5);
        let mut per_graph: Vec<usize> = guard.elements.values().map(Vec::len).collect();
        per_graph.sort_unstable();
        assert_eq!(per_graph, vec![1, 2, 2]);
    }

    #[tokio::test]
    async fn each_client_adds_two_endpoints_and_a_filter() {
        let loopback = Arc::new(LoopbackEngine::new());
        let (graph, ep) = presenter_setup(&loopback).await;
        let state: SharedFakeClientState = Arc::default();

        let mut cfg = settings(3, 3);
        cfg.filter_kind = FilterKind::Encoder;
        run(
            loopback.clone(),
            graph,
            ep,
            cfg,
            BandwidthLimits::default(),
            state.clone(),
        )
        .await;

        // presenter endpoint + 3 x (out endpoint, sim endpoint, filter)
        assert_eq!(loopback.live_elements(), 1 + 9);
        assert_eq!(state.lock().await.total_clients(), 3);
    }

    #[tokio::test]
    async fn exhausted_engine_skips_clients_without_aborting() {
        // Capacity fits the presenter instance plus exactly one auxiliary
        // instance; the second provisioning attempt fails.
        let loopback = Arc::new(LoopbackEngine::with_capacity(60));
        let (graph, ep) = presenter_setup(&loopback).await;
        let state: SharedFakeClientState = Arc::default();

        run(
            loopback.clone(),
            graph,
            ep,
            settings(4, 2),
            BandwidthLimits::default(),
            state.clone(),
        )
        .await;

        let guard = state.lock().await;
        assert_eq!(guard.instances.len(), 1);
        assert_eq!(guard.total_clients(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_fake_clients_releases_everything() {
        let loopback = Arc::new(LoopbackEngine::new());
        let (graph, ep) = presenter_setup(&loopback).await;
        let state: SharedFakeClientState = Arc::default();

        let mut cfg = settings(4, 2);
        cfg.remove_fake_clients = true;
        cfg.play_time = Duration::from_secs(5);
        run(
            loopback.clone(),
            graph,
            ep,
            cfg,
            BandwidthLimits::default(),
            state.clone(),
        )
        .await;

        let guard = state.lock().await;
        assert_eq!(guard.total_clients(), 0);
        assert!(guard.graphs.is_empty());
        assert!(guard.instances.is_empty());
        // Only the presenter's resources survive.
        assert_eq!(loopback.live_instances(), 1);
        assert_eq!(loopback.live_elements(), 1);
    }

    #[tokio::test]
    async fn drain_release_clears_state() {
        let loopback = Arc::new(LoopbackEngine::new());
        let (graph, ep) = presenter_setup(&loopback).await;
        let state: SharedFakeClientState = Arc::default();

        run(
            loopback.clone(),
            graph,
            ep,
            settings(3, 1),
            BandwidthLimits::default(),
            state.clone(),
        )
        .await;

        state.lock().await.drain_release(loopback.as_ref() as &dyn MediaEngine).await;
        assert_eq!(loopback.live_instances(), 1);
        assert_eq!(loopback.live_graphs(), 1);
        assert_eq!(loopback.live_elements(), 1);
    }

    /// Delegates to a loopback engine but parks forever from the
    /// `stall_from`-th endpoint creation onward, holding a worker
    /// mid-construction at a known point.
    struct StallingEngine {
        inner: Arc<LoopbackEngine>,
        endpoint_calls: AtomicUsize,
        stall_from: usize,
    }

    #[async_trait]
    impl MediaEngine for StallingEngine {
        async fn create_instance(&self, load_points: u32) -> EngineResult<EngineId> {
            self.inner.create_instance(load_points).await
        }

        async fn create_graph(&self, engine: EngineId) -> EngineResult<GraphId> {
            self.inner.create_graph(engine).await
        }

        async fn create_endpoint(
            &self,
            graph: GraphId,
            limits: BandwidthLimits,
        ) -> EngineResult<EndpointId> {
            if self.endpoint_calls.fetch_add(1, Ordering::SeqCst) >= self.stall_from {
                std::future::pending::<()>().await;
            }
            self.inner.create_endpoint(graph, limits).await
        }

        async fn create_filter(
            &self,
            graph: GraphId,
            kind: FilterKind,
        ) -> EngineResult<FilterId> {
            self.inner.create_filter(graph, kind).await
        }

        async fn connect(&self, from: ElementId, to: ElementId) -> EngineResult<()> {
            self.inner.connect(from, to).await
        }

        async fn generate_offer(&self, endpoint: EndpointId) -> EngineResult<String> {
            self.inner.generate_offer(endpoint).await
        }

        async fn process_offer(
            &self,
            endpoint: EndpointId,
            offer: &str,
        ) -> EngineResult<String> {
            self.inner.process_offer(endpoint, offer).await
        }

        async fn process_answer(&self, endpoint: EndpointId, answer: &str) -> EngineResult<()> {
            self.inner.process_answer(endpoint, answer).await
        }

        async fn add_ice_candidate(
            &self,
            endpoint: EndpointId,
            candidate: IceCandidateInfo,
        ) -> EngineResult<()> {
            self.inner.add_ice_candidate(endpoint, candidate).await
        }

        async fn gather_candidates(&self, endpoint: EndpointId) -> EngineResult<()> {
            self.inner.gather_candidates(endpoint).await
        }

        fn on_ice_candidate(&self, endpoint: EndpointId, callback: IceCallback) {
            self.inner.on_ice_candidate(endpoint, callback);
        }

        async fn endpoint_stats(&self, endpoint: EndpointId) -> EngineResult<EndpointStats> {
            self.inner.endpoint_stats(endpoint).await
        }

        async fn filter_stats(&self, filter: FilterId) -> EngineResult<FilterStats> {
            self.inner.filter_stats(filter).await
        }

        async fn release_element(&self, element: ElementId) -> EngineResult<()> {
            self.inner.release_element(element).await
        }

        async fn release_graph(&self, graph: GraphId) -> EngineResult<()> {
            self.inner.release_graph(graph).await
        }

        async fn destroy_instance(&self, engine: EngineId) -> EngineResult<()> {
            self.inner.destroy_instance(engine).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_worker_leaves_no_orphan_elements() {
        let loopback = Arc::new(LoopbackEngine::new());
        let (graph, ep) = presenter_setup(&loopback).await;
        // First endpoint creation is the worker's fan-out endpoint on the
        // presenter graph; the second (the simulated client) parks forever.
        let stalling = Arc::new(StallingEngine {
            inner: loopback.clone(),
            endpoint_calls: AtomicUsize::new(0),
            stall_from: 1,
        });
        let state: SharedFakeClientState = Arc::default();

        let generator = tokio::spawn(run(
            stalling,
            graph,
            ep,
            settings(1, 1),
            BandwidthLimits::default(),
            state.clone(),
        ));
        // Let the worker create its fan-out endpoint and park.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.lock().await.pending.len(), 1);

        generator.abort();
        let _ = generator.await;
        state.lock().await.drain_release(loopback.as_ref() as &dyn MediaEngine).await;

        // Presenter endpoint only; the interrupted worker's endpoint is gone.
        assert_eq!(loopback.live_elements(), 1);
        assert_eq!(loopback.live_graphs(), 1);
        assert_eq!(loopback.live_instances(), 1);
    }
}
