use std::time::Duration;

/// Runtime configuration for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Prefix for tap device names; the VLAN id is appended, so a prefix of
    /// `"tap"` fronts VLAN 100 with a device named `tap100`.
    pub tap_prefix: String,
    /// Bounded timeout for each cache-manager poll. This is also the upper
    /// bound on shutdown latency for the listener worker.
    pub poll_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tap_prefix: "tap".to_string(),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.tap_prefix, "tap");
        assert!(!config.poll_interval.is_zero());
    }
}
