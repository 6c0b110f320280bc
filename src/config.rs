#![forbid(unsafe_code)]

// Gateway configuration loaded from environment variables

use crate::engine::BandwidthLimits;
use tracing::info;

/// Runtime configuration for the gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// HTTP/WebSocket listen port (PORT, default 3000)
    pub port: u16,
    /// Concurrent WebSocket connection cap (MAX_CONNECTIONS, default 10000)
    pub max_connections: usize,
    /// Total load-point capacity of the loopback engine
    /// (ENGINE_CAPACITY_POINTS, unset = unlimited)
    pub engine_capacity_points: Option<u32>,
    /// Bandwidth limits applied to every endpoint
    /// (MAX_RECV_KBPS / MAX_SEND_KBPS, unset = engine defaults)
    pub bandwidth: BandwidthLimits,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let port = env_parse("PORT").unwrap_or(3000);
        let max_connections = env_parse("MAX_CONNECTIONS").unwrap_or(10_000);
        let engine_capacity_points = env_parse("ENGINE_CAPACITY_POINTS");
        if let Some(points) = engine_capacity_points {
            info!("Engine capacity limited to {} load points", points);
        }
        let bandwidth = BandwidthLimits {
            max_recv_kbps: env_parse("MAX_RECV_KBPS"),
            max_send_kbps: env_parse("MAX_SEND_KBPS"),
        };

        Self {
            port,
            max_connections,
            engine_capacity_points,
            bandwidth,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            max_connections: 10_000,
            engine_capacity_points: None,
            bandwidth: BandwidthLimits::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_connections, 10_000);
        assert!(config.engine_capacity_points.is_none());
        assert!(config.bandwidth.max_recv_kbps.is_none());
    }
}
