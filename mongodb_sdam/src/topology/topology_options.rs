use std::time::Duration;

use serde::Deserialize;

use crate::{validate_srv_host, SdamError, TopologyType};

/// Every knob of a [`Topology`](crate::Topology). Durations are in milliseconds so the
/// struct can be read straight from a config file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TopologyOptions {
    /// Seed list, `host[:port]` each.
    pub hosts: Vec<String>,
    /// Resolve the seed list from `_<srv_service_name>._tcp.<srv_host>` instead of `hosts`.
    pub srv_host: Option<String>,
    pub replica_set: Option<String>,
    pub direct_connection: Option<bool>,
    pub load_balanced: bool,
    pub heartbeat_frequency_ms: u64,
    pub min_heartbeat_frequency_ms: u64,
    pub server_selection_timeout_ms: u64,
    pub local_threshold_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_pool_size: usize,
    pub retry_writes: bool,
    pub server_monitoring_streaming: bool,
    pub rtt_smoothing_factor: f64,
    pub srv_service_name: String,
    pub srv_max_hosts: usize,
    pub rescan_srv_interval_ms: u64,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            srv_host: None,
            replica_set: None,
            direct_connection: None,
            load_balanced: false,
            heartbeat_frequency_ms: 10_000,
            min_heartbeat_frequency_ms: 500,
            server_selection_timeout_ms: 30_000,
            local_threshold_ms: 15,
            connect_timeout_ms: 30_000,
            max_pool_size: 100,
            retry_writes: true,
            server_monitoring_streaming: true,
            rtt_smoothing_factor: 0.2,
            srv_service_name: "mongodb".to_string(),
            srv_max_hosts: 0,
            rescan_srv_interval_ms: 60_000,
        }
    }
}

impl TopologyOptions {
    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.heartbeat_frequency_ms)
    }

    pub fn min_heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_frequency_ms)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms)
    }

    pub fn local_threshold(&self) -> Duration {
        Duration::from_millis(self.local_threshold_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rescan_srv_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_srv_interval_ms)
    }

    /// The type a new topology starts out as, given how many seeds it has.
    pub fn initial_topology_type(&self, seed_count: usize) -> TopologyType {
        if self.load_balanced {
            TopologyType::LoadBalanced
        } else if self.direct_connection == Some(true) {
            TopologyType::Single
        } else if self.replica_set.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if seed_count == 1
            && self.direct_connection.is_none()
            && self.srv_host.is_none()
        {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        }
    }

    /// Checks the combinations that can't work, independent of the seed list.
    pub fn validate(&self) -> Result<(), SdamError> {
        let invalid = |message: &str| Err(SdamError::InvalidArgument(message.to_string()));

        if self.heartbeat_frequency_ms < self.min_heartbeat_frequency_ms {
            return invalid("heartbeat_frequency_ms must not be lower than min_heartbeat_frequency_ms");
        }
        if self.min_heartbeat_frequency_ms == 0 {
            return invalid("min_heartbeat_frequency_ms must be positive");
        }
        if !(self.rtt_smoothing_factor > 0.0 && self.rtt_smoothing_factor <= 1.0) {
            return invalid("rtt_smoothing_factor must be in (0, 1]");
        }
        if self.max_pool_size == 0 {
            return invalid("max_pool_size must be positive");
        }
        if self.load_balanced {
            if self.replica_set.is_some() {
                return invalid("load_balanced cannot be combined with replica_set");
            }
            if self.direct_connection == Some(true) {
                return invalid("load_balanced cannot be combined with direct_connection");
            }
        }
        if let Some(srv_host) = &self.srv_host {
            if self.direct_connection == Some(true) {
                return invalid("direct_connection cannot be combined with an SRV host");
            }
            validate_srv_host(srv_host)?;
        }
        if self.srv_max_hosts > 0 {
            if self.replica_set.is_some() {
                return invalid("srv_max_hosts cannot be combined with replica_set");
            }
            if self.load_balanced {
                return invalid("srv_max_hosts cannot be combined with load_balanced");
            }
        }
        Ok(())
    }
}
