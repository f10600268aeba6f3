use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    ClusterTime, Connector, SdamError, Server, ServerAddress, ServerDescription, ServerSelector,
    SrvResolver, TopologyOptions,
};

/// Identifies one topology in events and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TopologyId(Uuid);

impl TopologyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for TopologyId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TopologyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per call knobs of [`Topology::select_server`](crate::Topology::select_server).
#[derive(Clone, Debug, Default)]
pub struct SelectServerOptions {
    /// Overrides the topology wide `server_selection_timeout_ms`.
    pub server_selection_timeout: Option<Duration>,
    /// A sharded transaction's mongos; returned as is while the topology is Sharded.
    pub pinned_server: Option<ServerAddress>,
}

#[derive(Debug)]
pub(crate) enum TopologyMessage {
    /// Opens the topology and answers once a server is selectable.
    Connect {
        respond_to: oneshot::Sender<Result<(), SdamError>>,
    },
    Close {
        respond_to: oneshot::Sender<Result<(), SdamError>>,
    },
    SelectServer {
        selector: ServerSelector,
        options: SelectServerOptions,
        respond_to: oneshot::Sender<Result<Arc<Server>, SdamError>>,
    },
    /// A monitor's successful heartbeat.
    ServerHeartbeat(ServerDescription),
    /// A server became unusable, from a failed heartbeat or an operation error.
    InvalidateServer(ServerDescription),
    /// A fresh non-empty answer of the SRV poller.
    SrvRecordsDiscovered(Vec<ServerAddress>),
}

/// The narrow view of the topology handed to servers, monitors and the SRV poller: the
/// gossiped cluster time and a channel for reporting what they observe.
#[derive(Clone, Debug)]
pub(crate) struct TopologyContext {
    topology_id: TopologyId,
    sender: mpsc::UnboundedSender<TopologyMessage>,
    cluster_time: Arc<Mutex<Option<ClusterTime>>>,
}

impl TopologyContext {
    pub(crate) fn new(topology_id: TopologyId, sender: mpsc::UnboundedSender<TopologyMessage>) -> Self {
        Self {
            topology_id,
            sender,
            cluster_time: Arc::new(Mutex::new(None)),
        }
    }

    /// The highest cluster time seen so far.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        match self.cluster_time.lock() {
            Ok(cluster_time) => cluster_time.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn resolve_cluster_time(&self, incoming: &ClusterTime) {
        let mut cluster_time = match self.cluster_time.lock() {
            Ok(cluster_time) => cluster_time,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cluster_time = Some(ClusterTime::max(cluster_time.take(), incoming.clone()));
    }

    pub(crate) fn server_heartbeat(&self, description: ServerDescription) {
        self.send(TopologyMessage::ServerHeartbeat(description));
    }

    pub(crate) fn invalidate_server(&self, description: ServerDescription) {
        self.send(TopologyMessage::InvalidateServer(description));
    }

    pub(crate) fn srv_records(&self, addresses: Vec<ServerAddress>) {
        self.send(TopologyMessage::SrvRecordsDiscovered(addresses));
    }

    fn send(&self, message: TopologyMessage) {
        if let Err(e) = self.sender.send(message) {
            // The topology is gone; nothing is listening anymore.
            tracing::trace!(
                "Topology `{}` dropped an internal message: {:?}",
                self.topology_id,
                e.0
            );
        }
    }
}

/// Everything the builder hands to a new topology actor.
#[derive(Debug)]
pub(crate) struct TopologyInitialConfiguration {
    pub(crate) topology_id: TopologyId,
    pub(crate) options: Arc<TopologyOptions>,
    pub(crate) seeds: Vec<ServerAddress>,
    pub(crate) connector: Box<dyn Connector>,
    pub(crate) srv_resolver: Option<Box<dyn SrvResolver>>,
}
