#![forbid(unsafe_code)]

// Engine module - client interface for the external media-processing engine
//
// The gateway never builds media resources itself; it only requests them
// through this interface. A real deployment points it at a remote engine
// cluster; the loopback implementation simulates one in-process.

pub mod loopback;
pub mod types;

pub use loopback::LoopbackEngine;
pub use types::{
    BandwidthLimits, ElementId, EndpointId, EndpointStats, EngineError, EngineId, EngineResult,
    FilterId, FilterStats, GraphId, IceCandidateInfo,
};

use async_trait::async_trait;
use tracing::warn;

/// Callback invoked by the engine when an endpoint discovers a local ICE
/// candidate. Must be cheap and non-blocking (the usual implementation is a
/// `try_send` into a channel).
pub type IceCallback = Box<dyn Fn(IceCandidateInfo) + Send + Sync + 'static>;

/// Media filter catalog, resolved from the wire-level `processing` key.
///
/// Open enumeration: unknown keys degrade to `None` (pass-through) with a
/// logged warning, preserving lenient behavior for benchmark scripts that
/// request filter names the deployed engine may not carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    None,
    Encoder,
    FaceOverlay,
    ImageOverlay,
    ZBar,
    PlateDetector,
    CrowdDetector,
    Chroma,
}

impl FilterKind {
    /// Resolves a wire key to a filter kind. Unknown keys behave as `None`.
    pub fn from_key(key: &str) -> Self {
        match key {
            "none" | "" => FilterKind::None,
            "encoder" => FilterKind::Encoder,
            "face" => FilterKind::FaceOverlay,
            "image" => FilterKind::ImageOverlay,
            "zbar" => FilterKind::ZBar,
            "plate" => FilterKind::PlateDetector,
            "crowd" => FilterKind::CrowdDetector,
            "chroma" => FilterKind::Chroma,
            other => {
                warn!("Unknown filter kind '{}', falling back to pass-through", other);
                FilterKind::None
            }
        }
    }

    /// True for the pass-through variant (no filter element is created)
    pub fn is_none(&self) -> bool {
        matches!(self, FilterKind::None)
    }
}

/// Client capability of the external media engine.
///
/// Handles are opaque identifiers; every call may block on the engine and
/// may fail. Instance creation is sized by a load budget and fails with
/// `EngineError::ResourceExhausted` when the engine cannot honor it.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Provisions an engine instance sized by `load_points`
    async fn create_instance(&self, load_points: u32) -> EngineResult<EngineId>;

    /// Creates a media processing graph on an instance
    async fn create_graph(&self, engine: EngineId) -> EngineResult<GraphId>;

    /// Creates a WebRTC endpoint on a graph
    async fn create_endpoint(
        &self,
        graph: GraphId,
        limits: BandwidthLimits,
    ) -> EngineResult<EndpointId>;

    /// Instantiates a filter element on a graph
    async fn create_filter(&self, graph: GraphId, kind: FilterKind) -> EngineResult<FilterId>;

    /// Connects the media output of `from` to the input of `to`.
    /// Both elements must live on the same graph.
    async fn connect(&self, from: ElementId, to: ElementId) -> EngineResult<()>;

    /// Generates an SDP offer on an endpoint (local negotiation side)
    async fn generate_offer(&self, endpoint: EndpointId) -> EngineResult<String>;

    /// Processes a remote SDP offer, returning the answer
    async fn process_offer(&self, endpoint: EndpointId, offer: &str) -> EngineResult<String>;

    /// Processes the remote SDP answer to a previously generated offer
    async fn process_answer(&self, endpoint: EndpointId, answer: &str) -> EngineResult<()>;

    /// Feeds a remote ICE candidate to an endpoint
    async fn add_ice_candidate(
        &self,
        endpoint: EndpointId,
        candidate: IceCandidateInfo,
    ) -> EngineResult<()>;

    /// Starts local ICE candidate gathering on an endpoint
    async fn gather_candidates(&self, endpoint: EndpointId) -> EngineResult<()>;

    /// Registers the ICE-candidate-available callback for an endpoint.
    /// The callback is dropped when the endpoint is released.
    fn on_ice_candidate(&self, endpoint: EndpointId, callback: IceCallback);

    /// Queries latency statistics for an endpoint
    async fn endpoint_stats(&self, endpoint: EndpointId) -> EngineResult<EndpointStats>;

    /// Queries latency statistics for a filter
    async fn filter_stats(&self, filter: FilterId) -> EngineResult<FilterStats>;

    /// Releases an endpoint or filter. Idempotent: releasing an unknown or
    /// already-released element succeeds.
    async fn release_element(&self, element: ElementId) -> EngineResult<()>;

    /// Releases a graph and any elements still on it. Idempotent.
    async fn release_graph(&self, graph: GraphId) -> EngineResult<()>;

    /// Destroys an engine instance and everything it hosts. Idempotent.
    async fn destroy_instance(&self, engine: EngineId) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_kind_resolves_known_keys() {
        assert_eq!(FilterKind::from_key("encoder"), FilterKind::Encoder);
        assert_eq!(FilterKind::from_key("zbar"), FilterKind::ZBar);
        assert_eq!(FilterKind::from_key("chroma"), FilterKind::Chroma);
        assert_eq!(FilterKind::from_key("none"), FilterKind::None);
    }

    #[test]
    fn unknown_filter_kind_is_pass_through() {
        assert_eq!(FilterKind::from_key("holograms"), FilterKind::None);
        assert!(FilterKind::from_key("holograms").is_none());
    }
}
