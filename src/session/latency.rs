#![forbid(unsafe_code)]

// Latency sampler - periodic end-to-end latency collection for live viewers

use crate::engine::{EndpointId, FilterId, MediaEngine};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const NS_PER_US: f64 = 1000.0;

/// Collected latency samples for one viewer, in microseconds.
///
/// Guarded by a single std `Mutex` together with the `closed` flag, so the
/// owning session can close the buffers and know no sample lands after the
/// lock is released. The lock is only ever held for a push or a snapshot.
#[derive(Debug, Default)]
pub struct LatencyBuffers {
    /// End-to-end latency through the media graph
    pub graph_us: Vec<f64>,
    /// Latency attributable to the viewer's filter, when one is present
    pub filter_us: Vec<f64>,
    closed: bool,
}

impl LatencyBuffers {
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

pub type SharedLatencyBuffers = Arc<Mutex<LatencyBuffers>>;

pub fn new_buffers() -> SharedLatencyBuffers {
    Arc::new(Mutex::new(LatencyBuffers::default()))
}

/// Spawns the sampler task for one viewer.
///
/// Every `interval` the task queries endpoint stats (and filter stats when a
/// filter is present) and appends the converted values to the buffers. Any
/// engine error ends the loop permanently; release of the sampled elements
/// surfaces as such an error.
pub fn spawn_sampler(
    engine: Arc<dyn MediaEngine>,
    endpoint: EndpointId,
    filter: Option<FilterId>,
    interval: Duration,
    buffers: SharedLatencyBuffers,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so the first sample lands a
        // full interval after the viewer went live.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let endpoint_stats = match engine.endpoint_stats(endpoint).await {
                Ok(stats) => stats,
                Err(e) => {
                    debug!("Latency sampler for {} stopping: {}", endpoint, e);
                    return;
                }
            };

            let filter_sample = match filter {
                Some(filter) => match engine.filter_stats(filter).await {
                    Ok(stats) => {
                        let delta =
                            stats.input_latency_ns.saturating_sub(endpoint_stats.input_latency_ns);
                        Some(delta as f64 / NS_PER_US)
                    }
                    Err(e) => {
                        debug!("Latency sampler for {} stopping: {}", endpoint, e);
                        return;
                    }
                },
                None => None,
            };

            let mut guard = buffers.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_closed() {
                return;
            }
            guard.graph_us.push(endpoint_stats.e2e_latency_ns as f64 / NS_PER_US);
            if let Some(sample) = filter_sample {
                guard.filter_us.push(sample);
            }
        }
    })
}

/// Closes the buffers and cancels the sampler task. After this returns, no
/// further sample is appended.
pub fn stop_sampler(buffers: &SharedLatencyBuffers, task: Option<JoinHandle<()>>) {
    buffers.lock().unwrap_or_else(|e| e.into_inner()).close();
    if let Some(task) = task {
        task.abort();
    }
}
