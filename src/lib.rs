#![forbid(unsafe_code)]

// stream-bench library - signaling and load-orchestration gateway for
// one-to-many media broadcast benchmarking

pub mod config;
pub mod engine;
pub mod metrics;
pub mod session;
pub mod signaling;
