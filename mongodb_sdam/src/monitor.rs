mod monitor_actor;
mod monitor_handle;
mod rtt_pinger;

use std::time::Duration;

pub(crate) use monitor_actor::*;
pub(crate) use monitor_handle::*;
pub(crate) use rtt_pinger::*;

use crate::TopologyOptions;

/// The subset of [`TopologyOptions`] a monitor runs on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MonitorOptions {
    pub heartbeat_frequency: Duration,
    pub min_heartbeat_frequency: Duration,
    pub connect_timeout: Duration,
    pub streaming: bool,
    pub rtt_smoothing_factor: f64,
}

impl From<&TopologyOptions> for MonitorOptions {
    fn from(options: &TopologyOptions) -> Self {
        Self {
            heartbeat_frequency: options.heartbeat_frequency(),
            min_heartbeat_frequency: options.min_heartbeat_frequency(),
            connect_timeout: options.connect_timeout(),
            streaming: options.server_monitoring_streaming,
            rtt_smoothing_factor: options.rtt_smoothing_factor,
        }
    }
}
