use std::{collections::HashMap, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep_until, Instant, MissedTickBehavior},
};
use tracing::{instrument, Span};
use uuid::Uuid;

use crate::{
    compare_topology_version,
    events::{
        EventBus, SdamEvent, ServerClosedEvent, ServerDescriptionChangedEvent, ServerOpeningEvent,
        SrvRecordDiscoveryEvent, TopologyClosedEvent, TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    select_server,
    srv_poller::SrvPoller,
    state_machine::StateMachine,
    ConnectionState, Connector, ReadPreference, SdamError, Server, ServerAddress,
    ServerDescription, ServerSelector, SrvResolver, TopologyDescription, TopologyType,
};

use super::{
    SelectServerOptions, TopologyContext, TopologyId, TopologyInitialConfiguration,
    TopologyMessage, TopologyOptions, WaitQueue, WaitQueueCallback, WaitQueueMember,
};

/// The description a topology starts from, and returns to when it is reconnected.
pub(crate) fn initial_description(
    options: &TopologyOptions,
    seeds: &[ServerAddress],
) -> TopologyDescription {
    TopologyDescription::new(
        options.initial_topology_type(seeds.len()),
        seeds,
        options.replica_set.clone(),
        options.heartbeat_frequency(),
        options.local_threshold(),
    )
}

pub(crate) struct TopologyActor {
    id: TopologyId,
    options: Arc<TopologyOptions>,
    connector: Box<dyn Connector>,
    srv_resolver: Option<Box<dyn SrvResolver>>,
    state: StateMachine<ConnectionState>,
    initial_description: TopologyDescription,
    description: Arc<TopologyDescription>,
    description_tx: watch::Sender<Arc<TopologyDescription>>,
    servers: HashMap<ServerAddress, Arc<Server>>,
    wait_queue: WaitQueue,
    srv_poller: Option<SrvPoller>,
    receiver: mpsc::Receiver<TopologyMessage>,
    /// Reports from servers, monitors and the SRV poller.
    receiver_internal: mpsc::UnboundedReceiver<TopologyMessage>,
    /// Handed to every server; also keeps `receiver_internal` open.
    context: TopologyContext,
    events: EventBus,
}

impl TopologyActor {
    pub(crate) fn new(
        receiver: mpsc::Receiver<TopologyMessage>,
        initial_config: TopologyInitialConfiguration,
        description_tx: watch::Sender<Arc<TopologyDescription>>,
        events: EventBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let initial_description =
            initial_description(&initial_config.options, &initial_config.seeds);
        Self {
            id: initial_config.topology_id,
            context: TopologyContext::new(initial_config.topology_id, tx),
            options: initial_config.options,
            connector: initial_config.connector,
            srv_resolver: initial_config.srv_resolver,
            state: StateMachine::new(ConnectionState::Closed),
            description: Arc::new(initial_description.clone()),
            initial_description,
            description_tx,
            servers: HashMap::new(),
            wait_queue: WaitQueue::new(),
            srv_poller: None,
            receiver,
            receiver_internal: rx,
            events,
        }
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    /// Message handler for the TopologyActor
    #[instrument(
        level = "debug",
        name = "Topology Actor - Handle Message",
        skip(self),
        fields(correlation_id)
    )]
    async fn handle_message(&mut self, msg: TopologyMessage) {
        // Apply a correlation id to all child spans of this message handler
        Span::current().record("correlation_id", Uuid::new_v4().to_string());
        match msg {
            TopologyMessage::Connect { respond_to } => self.connect(respond_to).await,
            TopologyMessage::Close { respond_to } => {
                self.close_topology().await;
                let _ = respond_to.send(Ok(()));
            }
            TopologyMessage::SelectServer {
                selector,
                options,
                respond_to,
            } => self.enqueue_selection(selector, options, respond_to),
            TopologyMessage::ServerHeartbeat(description)
            | TopologyMessage::InvalidateServer(description) => {
                self.on_server_update(description).await
            }
            TopologyMessage::SrvRecordsDiscovered(addresses) => {
                self.on_srv_records(addresses).await
            }
        }
    }

    async fn connect(&mut self, respond_to: oneshot::Sender<Result<(), SdamError>>) {
        match self.state.state() {
            ConnectionState::Connected => {
                let _ = respond_to.send(Ok(()));
                return;
            }
            ConnectionState::Connecting => {
                self.push_readiness_gate(respond_to);
                self.process_wait_queue();
                return;
            }
            ConnectionState::Closing => {
                let _ = respond_to.send(Err(SdamError::TopologyClosed));
                return;
            }
            ConnectionState::Closed => {}
        }

        tracing::info!(
            "Opening topology `{}` as {:?}",
            self.id,
            self.initial_description.topology_type
        );
        self.state.transition(ConnectionState::Connecting);
        self.set_description(Arc::new(self.initial_description.clone()));
        self.events
            .publish(SdamEvent::TopologyOpening(TopologyOpeningEvent {
                topology_id: self.id,
            }));
        self.reconcile_servers().await;

        if self.description.topology_type == TopologyType::LoadBalanced {
            self.state.transition(ConnectionState::Connected);
            let _ = respond_to.send(Ok(()));
            return;
        }

        self.push_readiness_gate(respond_to);
        self.process_wait_queue();
    }

    /// `connect()` answers once any server is selectable for a primaryPreferred read.
    fn push_readiness_gate(&mut self, respond_to: oneshot::Sender<Result<(), SdamError>>) {
        self.wait_queue.push(
            ServerSelector::ReadPreference(ReadPreference::primary_preferred()),
            None,
            self.options.server_selection_timeout(),
            WaitQueueCallback::Connect(respond_to),
        );
    }

    fn enqueue_selection(
        &mut self,
        selector: ServerSelector,
        options: SelectServerOptions,
        respond_to: oneshot::Sender<Result<Arc<Server>, SdamError>>,
    ) {
        if !self.is_open() {
            let _ = respond_to.send(Err(SdamError::TopologyClosed));
            return;
        }
        if let Err(e) = selector.validate(self.options.heartbeat_frequency()) {
            let _ = respond_to.send(Err(e));
            return;
        }

        let timeout = options
            .server_selection_timeout
            .unwrap_or_else(|| self.options.server_selection_timeout());
        tracing::debug!(
            "Selecting a server for {:?} within {} ms",
            selector,
            timeout.as_millis()
        );
        self.wait_queue.push(
            selector,
            options.pinned_server,
            timeout,
            WaitQueueCallback::Select(respond_to),
        );
        self.process_wait_queue();
    }

    fn set_description(&mut self, description: Arc<TopologyDescription>) {
        self.description = description.clone();
        self.description_tx.send_replace(description);
    }

    /// Applies one server's new description to the topology.
    async fn on_server_update(&mut self, incoming: ServerDescription) {
        if !self.is_open() {
            return;
        }
        let Some(current) = self.description.server(&incoming.address).cloned() else {
            tracing::trace!(
                "Ignoring update for `{}` which is no longer part of the topology",
                incoming.address
            );
            return;
        };
        if compare_topology_version(
            current.topology_version.as_ref(),
            incoming.topology_version.as_ref(),
        ) > 0
        {
            tracing::debug!(
                "Ignoring stale description of `{}`, topology version {:?} is older than {:?}",
                incoming.address,
                incoming.topology_version,
                current.topology_version
            );
            return;
        }
        if let Some(cluster_time) = &incoming.cluster_time {
            self.context.resolve_cluster_time(cluster_time);
        }

        let server_changed = !current.equals(&incoming);
        let previous = self.description.clone();
        let next = Arc::new(previous.update(incoming.clone()));
        self.set_description(next.clone());

        if let Some(error) = &next.compatibility_error {
            tracing::error!("Topology `{}` is incompatible: {}", self.id, error);
            for member in self.wait_queue.drain() {
                member.fail(SdamError::Compatibility(error.clone()));
            }
            return;
        }

        for (address, server) in &self.servers {
            if let Some(description) = next.server(address) {
                server.set_description(Arc::new(description.clone()));
            }
        }
        self.reconcile_servers().await;

        if server_changed {
            let new_description = next
                .server(&incoming.address)
                .cloned()
                .unwrap_or_else(|| incoming.clone());
            self.events.publish(SdamEvent::ServerDescriptionChanged(
                ServerDescriptionChangedEvent {
                    topology_id: self.id,
                    address: incoming.address.clone(),
                    previous_description: Arc::new(current),
                    new_description: Arc::new(new_description),
                },
            ));
        }
        if !previous.equals(&next) {
            tracing::debug!(
                "Topology `{}` changed: {:?} -> {:?}",
                self.id,
                previous.topology_type,
                next.topology_type
            );
            self.events.publish(SdamEvent::TopologyDescriptionChanged(
                TopologyDescriptionChangedEvent {
                    topology_id: self.id,
                    previous_description: previous.clone(),
                    new_description: next.clone(),
                },
            ));
        }

        if incoming.is_known() {
            if let Some(server) = self.servers.get(&incoming.address) {
                server.mark_connected();
            }
        }
        if previous.topology_type != TopologyType::Sharded
            && next.topology_type == TopologyType::Sharded
        {
            self.start_srv_poller();
        }

        self.process_wait_queue();
    }

    async fn on_srv_records(&mut self, addresses: Vec<ServerAddress>) {
        if !self.is_open() {
            return;
        }
        if self.description.topology_type != TopologyType::Sharded {
            tracing::debug!("Ignoring SRV records, the topology is no longer sharded");
            return;
        }

        self.events
            .publish(SdamEvent::SrvRecordDiscovery(SrvRecordDiscoveryEvent {
                topology_id: self.id,
                addresses: addresses.clone(),
            }));

        let previous = self.description.clone();
        let next = Arc::new(previous.update_from_srv_records(&addresses, self.options.srv_max_hosts));
        if previous.equals(&next) {
            return;
        }

        tracing::info!(
            "SRV records changed the host list of topology `{}` to {:?}",
            self.id,
            next.servers.keys().collect::<Vec<_>>()
        );
        self.set_description(next.clone());
        self.reconcile_servers().await;
        self.events.publish(SdamEvent::TopologyDescriptionChanged(
            TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description: previous,
                new_description: next,
            },
        ));
        self.process_wait_queue();
    }

    fn start_srv_poller(&mut self) {
        if self.srv_poller.is_some() {
            return;
        }
        let (Some(host), Some(resolver)) = (self.options.srv_host.clone(), self.srv_resolver.clone())
        else {
            return;
        };
        tracing::debug!("Starting SRV polling of `{}`", host);
        self.srv_poller = Some(SrvPoller::start(
            resolver,
            host,
            self.options.srv_service_name.clone(),
            self.options.rescan_srv_interval(),
            self.options.heartbeat_frequency(),
            self.context.clone(),
        ));
    }

    /// Creates a server for every address the description has gained and destroys the ones
    /// for addresses it has lost.
    async fn reconcile_servers(&mut self) {
        let description = self.description.clone();

        for (address, server_description) in &description.servers {
            if self.servers.contains_key(address) {
                continue;
            }
            let server = Arc::new(Server::new(
                server_description.clone(),
                self.connector.clone(),
                self.context.clone(),
                self.events.clone(),
                &self.options,
            ));
            self.events
                .publish(SdamEvent::ServerOpening(ServerOpeningEvent {
                    topology_id: self.id,
                    address: address.clone(),
                }));
            server.connect();
            self.servers.insert(address.clone(), server);
        }

        let removed: Vec<ServerAddress> = self
            .servers
            .keys()
            .filter(|address| !description.has_server(address))
            .cloned()
            .collect();
        for address in removed {
            if let Some(server) = self.servers.remove(&address) {
                self.destroy_server(server).await;
            }
        }
    }

    async fn destroy_server(&self, server: Arc<Server>) {
        server.destroy().await;
        self.events
            .publish(SdamEvent::ServerClosed(ServerClosedEvent {
                topology_id: self.id,
                address: server.address().clone(),
            }));
    }

    /// Offers every waiting caller a server, oldest first. When callers are still waiting
    /// afterwards every monitor is asked to check early.
    fn process_wait_queue(&mut self) {
        if self.wait_queue.is_empty() {
            return;
        }

        let description = self.description.clone();
        let servers = &self.servers;
        let mut ready = false;
        self.wait_queue.process(|member| {
            if member.is_abandoned() {
                return None;
            }
            if let Some(error) = &description.compatibility_error {
                member.fail(SdamError::Compatibility(error.clone()));
                return None;
            }
            match select_for_member(&description, servers, &member) {
                Some(server) => {
                    tracing::debug!("Selected `{}`", server.address());
                    ready = ready || member.is_connect();
                    member.resolve(server);
                    None
                }
                None => Some(member),
            }
        });

        if ready && self.state.is(ConnectionState::Connecting) {
            tracing::info!("Topology `{}` connected", self.id);
            self.state.transition(ConnectionState::Connected);
        }
        if !self.wait_queue.is_empty() {
            for server in self.servers.values() {
                server.request_check();
            }
        }
    }

    /// Fails every caller whose deadline has passed. A failed readiness gate closes the
    /// topology first.
    async fn expire_waiters(&mut self) {
        for member in self.wait_queue.take_expired(Instant::now()) {
            let error = SdamError::ServerSelection {
                message: format!(
                    "Server selection timed out after {} ms",
                    member.timeout.as_millis()
                ),
                description: self.description.clone(),
            };
            if member.is_connect() {
                tracing::error!(
                    "Topology `{}` found no usable server while connecting, closing it",
                    self.id
                );
                self.close_topology().await;
            } else {
                tracing::warn!("{} for {:?}", error, member.selector);
            }
            member.fail(error);
        }
    }

    #[instrument(level = "debug", name = "Topology Actor - Close", skip(self), fields(topology_id = %self.id))]
    async fn close_topology(&mut self) {
        if !self.is_open() {
            return;
        }
        self.state.transition(ConnectionState::Closing);

        for member in self.wait_queue.drain() {
            member.fail(SdamError::TopologyClosed);
        }
        self.srv_poller = None;

        let servers: Vec<Arc<Server>> = self.servers.drain().map(|(_, server)| server).collect();
        for server in servers {
            self.destroy_server(server).await;
        }

        self.state.transition(ConnectionState::Closed);
        self.events
            .publish(SdamEvent::TopologyClosed(TopologyClosedEvent {
                topology_id: self.id,
            }));
        tracing::info!("Topology `{}` closed", self.id);
    }
}

fn select_for_member(
    description: &TopologyDescription,
    servers: &HashMap<ServerAddress, Arc<Server>>,
    member: &WaitQueueMember,
) -> Option<Arc<Server>> {
    if description.topology_type == TopologyType::Sharded {
        if let Some(pinned) = &member.pinned_server {
            return servers.get(pinned).cloned();
        }
    }
    let selected = select_server(description, &member.selector)?;
    servers.get(&selected.address).cloned()
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[instrument(level = "debug", name = "Running Topology Actor", skip(actor), fields(topology_id = %actor.id))]
pub(crate) async fn run_topology_actor(mut actor: TopologyActor) {
    let mut rescan_timer = tokio::time::interval(actor.options.min_heartbeat_frequency());
    rescan_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let next_deadline = actor.wait_queue.next_deadline();
        // Reports from servers and monitors are applied before any selection queued after them.
        tokio::select! {
            biased;
            Some(msg) = actor.receiver_internal.recv() => {
                actor.handle_message(msg).await;
            },
            opt_msg = actor.receiver.recv() => {
                let msg = match opt_msg {
                    Some(msg) => msg,
                    None => break,
                };
                actor.handle_message(msg).await;
            },
            _ = sleep_until_deadline(next_deadline) => {
                actor.expire_waiters().await;
            },
            _ = rescan_timer.tick() => {
                if !actor.wait_queue.is_empty() {
                    tracing::trace!("Rescanning {} waiting selections", actor.wait_queue.len());
                    actor.process_wait_queue();
                }
            },
        }
    }

    // Every handle is gone.
    actor.close_topology().await;
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{ConnectOptions, Connection, Document, ServerType};

    /// Never answers a heartbeat, so only messages sent by the test change the topology.
    #[derive(Clone, Debug)]
    struct SilentConnector;

    #[derive(Debug)]
    struct SilentConnection;

    #[async_trait]
    impl Connection for SilentConnection {
        async fn command(&mut self, _db: &str, _command: Document) -> Result<Document, SdamError> {
            std::future::pending().await
        }

        async fn destroy(&mut self, _force: bool) {}
    }

    #[async_trait]
    impl Connector for SilentConnector {
        async fn connect(
            &self,
            _address: &ServerAddress,
            _options: &ConnectOptions,
        ) -> Result<Box<dyn Connection>, SdamError> {
            Ok(Box::new(SilentConnection))
        }
    }

    fn actor_with(options: TopologyOptions, seeds: &[&str]) -> TopologyActor {
        let seeds: Vec<ServerAddress> = seeds
            .iter()
            .map(|s| ServerAddress::parse(s).unwrap())
            .collect();
        let (_sender, receiver) = mpsc::channel(8);
        let config = TopologyInitialConfiguration {
            topology_id: TopologyId::new(),
            options: Arc::new(options),
            seeds: seeds.clone(),
            connector: Box::new(SilentConnector),
            srv_resolver: None,
        };
        let (description_tx, _) = watch::channel(Arc::new(initial_description(
            &config.options,
            &seeds,
        )));
        TopologyActor::new(receiver, config, description_tx, EventBus::new())
    }

    fn hello(address: &str, reply: serde_json::Value) -> ServerDescription {
        let reply = crate::HelloReply::parse(reply.as_object().unwrap()).unwrap();
        ServerDescription::from_hello(
            ServerAddress::parse(address).unwrap(),
            &reply,
            Some(Duration::from_millis(5)),
            false,
        )
    }

    #[tokio::test]
    async fn connect_waits_for_a_selectable_server() {
        // Arrange
        let mut actor = actor_with(TopologyOptions::default(), &["a:27017"]);
        let (tx, mut rx) = oneshot::channel();

        // Act
        actor.connect(tx).await;
        let before = rx.try_recv();
        actor
            .on_server_update(hello("a:27017", json!({"ok": 1, "maxWireVersion": 17})))
            .await;

        // Assert
        assert!(before.is_err());
        assert!(matches!(rx.await, Ok(Ok(()))));
        assert!(actor.state.is(ConnectionState::Connected));
        assert_eq!(actor.description.topology_type, TopologyType::Single);
    }

    #[tokio::test]
    async fn updates_for_unknown_addresses_are_ignored() {
        let mut actor = actor_with(TopologyOptions::default(), &["a:27017"]);
        let (tx, _rx) = oneshot::channel();
        actor.connect(tx).await;
        let before = actor.description.clone();

        actor
            .on_server_update(hello("b:27017", json!({"ok": 1, "maxWireVersion": 17})))
            .await;

        assert!(Arc::ptr_eq(&before, &actor.description));
    }

    #[tokio::test]
    async fn discovered_members_get_servers() {
        // Arrange
        let options = TopologyOptions {
            replica_set: Some("rs0".to_string()),
            ..Default::default()
        };
        let mut actor = actor_with(options, &["a:27017"]);
        let (tx, _rx) = oneshot::channel();
        actor.connect(tx).await;

        // Act
        actor
            .on_server_update(hello(
                "a:27017",
                json!({
                    "ok": 1, "isWritablePrimary": true, "setName": "rs0",
                    "hosts": ["a:27017", "b:27017", "c:27017"], "maxWireVersion": 17
                }),
            ))
            .await;

        // Assert
        assert_eq!(actor.servers.len(), 3);
        assert_eq!(
            actor.description.topology_type,
            TopologyType::ReplicaSetWithPrimary
        );
        let primary = &actor.servers[&ServerAddress::parse("a:27017").unwrap()];
        assert_eq!(primary.description().server_type, ServerType::RSPrimary);
        assert_eq!(primary.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn stale_topology_versions_are_ignored() {
        // Arrange
        let mut actor = actor_with(TopologyOptions::default(), &["a:27017"]);
        let (tx, _rx) = oneshot::channel();
        actor.connect(tx).await;
        let tv = |counter: i64| json!({"processId": "000000000000000000000001", "counter": counter});
        actor
            .on_server_update(hello(
                "a:27017",
                json!({"ok": 1, "maxWireVersion": 17, "topologyVersion": tv(5)}),
            ))
            .await;

        // Act
        actor
            .on_server_update(hello(
                "a:27017",
                json!({"ok": 1, "msg": "isdbgrid", "maxWireVersion": 17, "topologyVersion": tv(4)}),
            ))
            .await;

        // Assert
        let address = ServerAddress::parse("a:27017").unwrap();
        assert_eq!(
            actor.description.server(&address).unwrap().server_type,
            ServerType::Standalone
        );
    }

    #[tokio::test]
    async fn incompatible_servers_fail_waiting_selections() {
        // Arrange
        let mut actor = actor_with(TopologyOptions::default(), &["a:27017"]);
        let (connect_tx, _connect_rx) = oneshot::channel();
        actor.connect(connect_tx).await;
        let (tx, rx) = oneshot::channel();
        actor.enqueue_selection(ServerSelector::Writable, Default::default(), tx);

        // Act
        actor
            .on_server_update(hello("a:27017", json!({"ok": 1, "maxWireVersion": 2})))
            .await;

        // Assert
        assert!(matches!(rx.await, Ok(Err(SdamError::Compatibility(_)))));
    }

    #[tokio::test]
    async fn expired_selection_reports_the_description() {
        // Arrange
        let mut actor = actor_with(TopologyOptions::default(), &["a:27017"]);
        let (connect_tx, _connect_rx) = oneshot::channel();
        actor.connect(connect_tx).await;
        let (tx, rx) = oneshot::channel();
        let options = SelectServerOptions {
            server_selection_timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        actor.enqueue_selection(ServerSelector::Writable, options, tx);

        // Act
        tokio::time::sleep(Duration::from_millis(20)).await;
        actor.expire_waiters().await;

        // Assert
        match rx.await {
            Ok(Err(SdamError::ServerSelection { message, description })) => {
                assert!(message.contains("10 ms"));
                assert_eq!(description.servers.len(), 1);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(actor.state.is(ConnectionState::Connecting));
    }

    #[tokio::test]
    async fn close_drains_waiters_and_servers() {
        let mut actor = actor_with(TopologyOptions::default(), &["a:27017", "b:27017"]);
        let (connect_tx, connect_rx) = oneshot::channel();
        actor.connect(connect_tx).await;

        actor.close_topology().await;
        actor.close_topology().await;

        assert!(matches!(connect_rx.await, Ok(Err(SdamError::TopologyClosed))));
        assert!(actor.servers.is_empty());
        assert!(actor.state.is(ConnectionState::Closed));
    }

    #[tokio::test]
    async fn load_balanced_topology_connects_without_waiting() {
        let options = TopologyOptions {
            load_balanced: true,
            ..Default::default()
        };
        let mut actor = actor_with(options, &["lb:27017"]);
        let (tx, rx) = oneshot::channel();

        actor.connect(tx).await;

        assert!(matches!(rx.await, Ok(Ok(()))));
        let server = actor.servers.values().next().unwrap();
        assert_eq!(server.state(), ConnectionState::Connected);
        assert_eq!(
            server.description().server_type,
            ServerType::LoadBalancer
        );
    }
}
