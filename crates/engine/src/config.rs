//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Anycast browse protocol configuration
    pub anycast: AnycastConfig,

    /// Gathering consumer configuration
    pub gathering: GatheringConfig,
}

/// Anycast browse protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnycastConfig {
    /// Max wait for one browse-get round trip before the requesting-side
    /// cursor reports a timeout
    pub get_timeout: Duration,

    /// Requesting-side keep-alive period while a browse is open but idle
    pub liveness_interval: Duration,

    /// Hosting-side lease duration; a session with no protocol activity
    /// for this long is reaped
    pub expiry_timeout: Duration,
}

impl Default for AnycastConfig {
    fn default() -> Self {
        Self {
            get_timeout: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(20),
            expiry_timeout: Duration::from_secs(60),
        }
    }
}

/// Gathering consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatheringConfig {
    /// 0-100, probability of preferring the local partition on each pull
    pub local_weighting: u8,

    /// Retry period for reattachment of still-unreachable nodes
    pub reattach_interval: Duration,

    /// Backoff before retrying an attach that got no handshake response
    pub no_response_attach_interval: Duration,

    /// Bound on local retries of a no-response attach
    pub no_response_attach_retries: u32,
}

impl Default for GatheringConfig {
    fn default() -> Self {
        Self {
            local_weighting: 50,
            reattach_interval: Duration::from_secs(10),
            no_response_attach_interval: Duration::from_secs(1),
            no_response_attach_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.anycast.liveness_interval < config.anycast.expiry_timeout);
        assert!(config.gathering.local_weighting <= 100);
        assert!(config.gathering.no_response_attach_retries > 0);
    }
}
