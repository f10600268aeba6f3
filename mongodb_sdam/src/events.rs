//! Monitoring events published by a [`Topology`](crate::Topology) and everything it owns.
use std::{sync::Arc, time::Duration};

use tokio::sync::broadcast;

use crate::{Document, ServerAddress, ServerDescription, TopologyDescription, TopologyId};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct ServerOpeningEvent {
    pub topology_id: TopologyId,
    pub address: ServerAddress,
}

#[derive(Clone, Debug)]
pub struct ServerClosedEvent {
    pub topology_id: TopologyId,
    pub address: ServerAddress,
}

#[derive(Clone, Debug)]
pub struct ServerDescriptionChangedEvent {
    pub topology_id: TopologyId,
    pub address: ServerAddress,
    pub previous_description: Arc<ServerDescription>,
    pub new_description: Arc<ServerDescription>,
}

#[derive(Clone, Debug)]
pub struct TopologyOpeningEvent {
    pub topology_id: TopologyId,
}

#[derive(Clone, Debug)]
pub struct TopologyClosedEvent {
    pub topology_id: TopologyId,
}

#[derive(Clone, Debug)]
pub struct TopologyDescriptionChangedEvent {
    pub topology_id: TopologyId,
    pub previous_description: Arc<TopologyDescription>,
    pub new_description: Arc<TopologyDescription>,
}

#[derive(Clone, Debug)]
pub struct ServerHeartbeatStartedEvent {
    pub address: ServerAddress,
    pub awaited: bool,
}

#[derive(Clone, Debug)]
pub struct ServerHeartbeatSucceededEvent {
    pub address: ServerAddress,
    pub duration: Duration,
    pub reply: Document,
    pub awaited: bool,
}

#[derive(Clone, Debug)]
pub struct ServerHeartbeatFailedEvent {
    pub address: ServerAddress,
    pub duration: Duration,
    pub failure: String,
    pub awaited: bool,
}

#[derive(Clone, Debug)]
pub struct SrvRecordDiscoveryEvent {
    pub topology_id: TopologyId,
    pub addresses: Vec<ServerAddress>,
}

#[derive(Clone, Debug)]
pub enum SdamEvent {
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    ServerDescriptionChanged(ServerDescriptionChangedEvent),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    TopologyDescriptionChanged(TopologyDescriptionChangedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
    SrvRecordDiscovery(SrvRecordDiscoveryEvent),
}

/// Fan-out of [`SdamEvent`]s. Publishing never blocks; a subscriber that falls more than
/// the channel capacity behind loses the oldest events.
#[derive(Clone, Debug)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<SdamEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub(crate) fn publish(&self, event: SdamEvent) {
        tracing::trace!("Publishing event: {:?}", &event);
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SdamEvent> {
        self.sender.subscribe()
    }
}
