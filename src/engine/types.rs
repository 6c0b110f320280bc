#![forbid(unsafe_code)]

// Common types and error handling for the engine client interface

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error type for engine client operations.
///
/// `ResourceExhausted` is distinguished from every other failure: the
/// signaling layer answers it with `notEnoughResources` instead of a
/// generic error notice.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not enough resources: {0}")]
    ResourceExhausted(String),

    #[error("unknown handle: {0}")]
    UnknownHandle(String),

    #[error("negotiation error: {0}")]
    NegotiationError(String),

    #[error("engine error: {0}")]
    Other(String),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

macro_rules! handle_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

handle_id!(EngineId);
handle_id!(GraphId);
handle_id!(EndpointId);
handle_id!(FilterId);

/// An endpoint or filter, as accepted by `connect` and `release_element`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementId {
    Endpoint(EndpointId),
    Filter(FilterId),
}

impl From<EndpointId> for ElementId {
    fn from(id: EndpointId) -> Self {
        ElementId::Endpoint(id)
    }
}

impl From<FilterId> for ElementId {
    fn from(id: FilterId) -> Self {
        ElementId::Filter(id)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementId::Endpoint(id) => write!(f, "endpoint:{id}"),
            ElementId::Filter(id) => write!(f, "filter:{id}"),
        }
    }
}

/// Bandwidth limits applied when creating an endpoint
#[derive(Debug, Clone, Copy, Default)]
pub struct BandwidthLimits {
    pub max_recv_kbps: Option<u32>,
    pub max_send_kbps: Option<u32>,
}

/// An ICE candidate as exchanged over signaling and with the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInfo {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_m_line_index: u32,
}

/// Latency statistics for an endpoint. The engine reports nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct EndpointStats {
    /// End-to-end latency across the graph up to this endpoint
    pub e2e_latency_ns: u64,
    /// Latency attributable to this endpoint's input
    pub input_latency_ns: u64,
}

/// Latency statistics for a filter
#[derive(Debug, Clone, Copy)]
pub struct FilterStats {
    pub input_latency_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_ids_are_unique() {
        assert_ne!(EndpointId::new(), EndpointId::new());
        assert_ne!(GraphId::new(), GraphId::new());
    }

    #[test]
    fn element_id_display() {
        let ep = EndpointId::new();
        assert!(ElementId::from(ep).to_string().starts_with("endpoint:"));
        let f = FilterId::new();
        assert!(ElementId::from(f).to_string().starts_with("filter:"));
    }

    #[test]
    fn ice_candidate_wire_format() {
        let c = IceCandidateInfo {
            candidate: "candidate:1 1 UDP 2122260223 192.0.2.1 54400 typ host".into(),
            sdp_mid: "video0".into(),
            sdp_m_line_index: 0,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert!(json.get("sdpMid").is_some());
        assert!(json.get("sdpMLineIndex").is_some());
    }
}
