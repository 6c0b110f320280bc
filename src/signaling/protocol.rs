#![forbid(unsafe_code)]

// Signaling protocol - message types for WebSocket communication
//
// JSON messages tagged by "id" with a top-level "sessionNumber", matching
// the benchmark browser clients.

use crate::engine::IceCandidateInfo;
use serde::{Deserialize, Serialize};

fn default_load_points() -> u32 {
    50
}

fn default_fake_points() -> u32 {
    50
}

fn default_fake_clients_per_instance() -> u32 {
    1
}

fn default_kms_number() -> u32 {
    1
}

fn default_webrtc_channels() -> u32 {
    1
}

fn default_kms_rate_secs() -> u64 {
    1
}

fn default_rate_kms_latency_ms() -> u64 {
    1000
}

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Claim the presenter role for a session
    #[serde(rename_all = "camelCase")]
    Presenter {
        session_number: String,
        sdp_offer: String,
        /// Load budget for the presenter's engine instance
        #[serde(default = "default_load_points")]
        load_points: u32,
    },
    /// Attach as a viewer of a session
    #[serde(rename_all = "camelCase")]
    Viewer {
        session_number: String,
        sdp_offer: String,
        /// Filter kind key ("none", "encoder", "face", ...)
        #[serde(default)]
        processing: Option<String>,
        /// Number of synthetic viewers to fan out after this one
        #[serde(default)]
        fake_clients: u32,
        /// Load budget per auxiliary engine instance
        #[serde(default = "default_fake_points")]
        fake_points: u32,
        /// Synthetic viewers sharing one auxiliary instance before a new
        /// one is provisioned
        #[serde(default = "default_fake_clients_per_instance")]
        fake_clients_per_instance: u32,
        /// Stagger between synthetic viewer launches, milliseconds
        #[serde(default)]
        time_between_clients: u64,
        /// Tear synthetic viewers down again after the hold period
        #[serde(default)]
        remove_fake_clients: bool,
        /// Hold duration per auxiliary graph before teardown, seconds
        #[serde(default)]
        play_time: u64,
        /// Attachment topology: "single" (default) or "tree"
        #[serde(default)]
        kms_topology: Option<String>,
        /// Tree levels (auxiliary engine instances) in tree topology
        #[serde(default = "default_kms_number")]
        kms_number: u32,
        /// Channels fanned out per tree level
        #[serde(default = "default_webrtc_channels")]
        webrtc_channels: u32,
        /// Pause between tree levels, seconds
        #[serde(default = "default_kms_rate_secs")]
        kms_rate: u64,
        /// Latency sampling interval, milliseconds
        #[serde(default = "default_rate_kms_latency_ms")]
        rate_kms_latency: u64,
        /// Enable the periodic latency sampler for this viewer
        #[serde(default)]
        kms_latency: bool,
    },
    /// ICE candidate discovered by the client
    #[serde(rename_all = "camelCase")]
    OnIceCandidate {
        session_number: String,
        candidate: IceCandidateInfo,
    },
    /// Stop the session role held by this connection
    #[serde(rename_all = "camelCase")]
    Stop { session_number: String },
}

/// Accepted/rejected verdict in negotiation responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Answer to a presenter request
    #[serde(rename_all = "camelCase")]
    PresenterResponse {
        response: Verdict,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Answer to a viewer request
    #[serde(rename_all = "camelCase")]
    ViewerResponse {
        response: Verdict,
        #[serde(skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// ICE candidate gathered by the engine for this connection's endpoint
    IceCandidate { candidate: IceCandidateInfo },
    /// The presenter stopped; the viewer's stream is over
    StopCommunication,
    /// The engine could not honor the requested load budget
    NotEnoughResources,
    /// Any other failure during negotiation
    Error { message: String },
}

impl ServerMessage {
    pub fn presenter_accepted(sdp_answer: String) -> Self {
        ServerMessage::PresenterResponse {
            response: Verdict::Accepted,
            sdp_answer: Some(sdp_answer),
            message: None,
        }
    }

    pub fn presenter_rejected(message: impl Into<String>) -> Self {
        ServerMessage::PresenterResponse {
            response: Verdict::Rejected,
            sdp_answer: None,
            message: Some(message.into()),
        }
    }

    pub fn viewer_accepted(sdp_answer: String) -> Self {
        ServerMessage::ViewerResponse {
            response: Verdict::Accepted,
            sdp_answer: Some(sdp_answer),
            message: None,
        }
    }

    pub fn viewer_rejected(message: impl Into<String>) -> Self {
        ServerMessage::ViewerResponse {
            response: Verdict::Rejected,
            sdp_answer: None,
            message: Some(message.into()),
        }
    }
}
