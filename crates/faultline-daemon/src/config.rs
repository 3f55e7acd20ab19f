use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rtds_layer_name must not be empty")]
    EmptyLayerName,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("heartbeat_interval is required when resource_ttl is set")]
    MissingHeartbeatInterval,
    #[error("heartbeat_interval ({heartbeat:?}) must be strictly less than resource_ttl ({ttl:?})")]
    HeartbeatNotBelowTtl { heartbeat: Duration, ttl: Duration },
    #[error("heartbeat_interval is set but resource_ttl is not")]
    HeartbeatWithoutTtl,
}

/// Which field of the client's `Node` identifies its cluster. Deployments
/// differ on this, so it is configured rather than guessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterKey {
    #[default]
    Cluster,
    Id,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name of the runtime layer served to data-plane clients.
    pub rtds_layer_name: String,
    /// Cadence at which the refresher rebuilds snapshots from the store.
    pub cache_refresh_interval: Duration,
    pub ingress_fault_runtime_prefix: String,
    pub egress_fault_runtime_prefix: String,
    /// When set, resources are wrapped with this TTL and kept alive with
    /// heartbeats.
    pub resource_ttl: Option<Duration>,
    /// Required iff `resource_ttl` is set; must be strictly smaller.
    pub heartbeat_interval: Option<Duration>,
    /// Config type URLs the monitor and refresher consider.
    pub enabled_config_types: Vec<String>,
    pub outer_loop_interval: Duration,
    pub per_experiment_check_interval: Duration,
    /// Cluster assumed for clients whose node metadata does not carry one.
    pub default_cluster: String,
    pub cluster_key: ClusterKey,
    /// How long a response may sit unacknowledged before the stream returns
    /// to idle and newer versions may be sent.
    pub nonce_expiry: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rtds_layer_name: "rtds".to_string(),
            cache_refresh_interval: Duration::from_secs(5),
            ingress_fault_runtime_prefix: "fault.http".to_string(),
            egress_fault_runtime_prefix: "egress.fault.http".to_string(),
            resource_ttl: None,
            heartbeat_interval: None,
            enabled_config_types: vec![
                faultline_protocol::INGRESS_FAULT_TYPE_URL.to_string(),
                faultline_protocol::EGRESS_FAULT_TYPE_URL.to_string(),
            ],
            outer_loop_interval: Duration::from_secs(5),
            per_experiment_check_interval: Duration::from_secs(1),
            default_cluster: "default".to_string(),
            cluster_key: ClusterKey::Cluster,
            nonce_expiry: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rtds_layer_name.is_empty() {
            return Err(ConfigError::EmptyLayerName);
        }
        for (name, interval) in [
            ("cache_refresh_interval", self.cache_refresh_interval),
            ("outer_loop_interval", self.outer_loop_interval),
            (
                "per_experiment_check_interval",
                self.per_experiment_check_interval,
            ),
            ("nonce_expiry", self.nonce_expiry),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        match (self.resource_ttl, self.heartbeat_interval) {
            (Some(ttl), Some(heartbeat)) => {
                if heartbeat.is_zero() {
                    return Err(ConfigError::ZeroInterval("heartbeat_interval"));
                }
                if heartbeat >= ttl {
                    return Err(ConfigError::HeartbeatNotBelowTtl { heartbeat, ttl });
                }
            }
            (Some(_), None) => return Err(ConfigError::MissingHeartbeatInterval),
            (None, Some(_)) => return Err(ConfigError::HeartbeatWithoutTtl),
            (None, None) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_layer_name() {
        let cfg = ControllerConfig {
            rtds_layer_name: String::new(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyLayerName)));
    }

    #[test]
    fn rejects_zero_intervals() {
        let cfg = ControllerConfig {
            cache_refresh_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZeroInterval("cache_refresh_interval"))
        ));
    }

    #[test]
    fn ttl_requires_heartbeat() {
        let cfg = ControllerConfig {
            resource_ttl: Some(Duration::from_secs(1)),
            heartbeat_interval: None,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingHeartbeatInterval)
        ));
    }

    #[test]
    fn heartbeat_must_be_strictly_below_ttl() {
        let cfg = ControllerConfig {
            resource_ttl: Some(Duration::from_secs(1)),
            heartbeat_interval: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::HeartbeatNotBelowTtl { .. })
        ));

        let cfg = ControllerConfig {
            resource_ttl: Some(Duration::from_secs(1)),
            heartbeat_interval: Some(Duration::from_millis(400)),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn heartbeat_without_ttl_is_rejected() {
        let cfg = ControllerConfig {
            resource_ttl: None,
            heartbeat_interval: Some(Duration::from_millis(400)),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::HeartbeatWithoutTtl)
        ));
    }
}
