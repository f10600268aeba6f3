use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tracing::instrument;

use crate::{
    compare_topology_version, delete_command,
    events::EventBus,
    find_command, get_more_command, insert_command, kill_cursors_command,
    monitor::{Monitor, MonitorOptions},
    sdam_error::check_command_reply,
    state_machine::StateMachine,
    topology::TopologyContext,
    update_command,
    ClusterTime, CommandOptions, ConnectOptions, ConnectionPool, ConnectionState, Connector,
    Document, Namespace, SdamError, ServerAddress, ServerDescription, TopologyOptions,
};

/// Oldest wire version that understands `collation`.
const COLLATION_MIN_WIRE_VERSION: i32 = 5;
/// Oldest wire version that accepts `$clusterTime`.
const CLUSTER_TIME_MIN_WIRE_VERSION: i32 = 6;
/// Servers up to this wire version close their connections when they step down.
const POOL_CLEARING_MAX_WIRE_VERSION: i32 = 7;

/// One node of the deployment: its current description, its connection pool and the monitor
/// that keeps the description fresh. Handed out by server selection as `Arc<Server>`.
#[derive(Debug)]
pub struct Server {
    address: ServerAddress,
    description: watch::Sender<Arc<ServerDescription>>,
    pool: ConnectionPool,
    /// Load balancers are never monitored.
    monitor: Option<Monitor>,
    state: Mutex<StateMachine<ConnectionState>>,
    context: TopologyContext,
    load_balanced: bool,
}

impl Server {
    pub(crate) fn new(
        description: ServerDescription,
        connector: Box<dyn Connector>,
        context: TopologyContext,
        events: EventBus,
        options: &TopologyOptions,
    ) -> Self {
        let address = description.address.clone();
        let (description_tx, description_rx) = watch::channel(Arc::new(description));
        let pool = ConnectionPool::new(
            address.clone(),
            connector.clone(),
            ConnectOptions {
                connect_timeout: options.connect_timeout(),
                monitoring: false,
            },
            options.max_pool_size,
        );
        let monitor = if options.load_balanced {
            None
        } else {
            Some(Monitor::new(
                address.clone(),
                connector,
                pool.clone(),
                context.clone(),
                events,
                description_rx,
                MonitorOptions::from(options),
            ))
        };

        Self {
            address,
            description: description_tx,
            pool,
            monitor,
            state: Mutex::new(StateMachine::new(ConnectionState::Closed)),
            context,
            load_balanced: options.load_balanced,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The latest description the topology has for this server.
    pub fn description(&self) -> Arc<ServerDescription> {
        self.description.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.with_state(|s| s.state())
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StateMachine<ConnectionState>) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut *state),
            Err(poisoned) => f(&mut *poisoned.into_inner()),
        }
    }

    fn is_closing(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    /// Starts monitoring. A load balancer has nothing to monitor and is usable right away.
    pub(crate) fn connect(&self) {
        let started = self.with_state(|s| {
            if !s.is(ConnectionState::Closed) {
                return false;
            }
            s.transition(ConnectionState::Connecting);
            true
        });
        if !started {
            return;
        }

        match &self.monitor {
            Some(monitor) => monitor.connect(),
            None => self.mark_connected(),
        }
    }

    /// Publishes the topology's newest view of this server to the server and its monitor.
    pub(crate) fn set_description(&self, description: Arc<ServerDescription>) {
        self.description.send_replace(description);
    }

    /// The first successful heartbeat makes a connecting server connected.
    pub(crate) fn mark_connected(&self) {
        self.with_state(|s| {
            if s.is(ConnectionState::Connecting) {
                s.transition(ConnectionState::Connected);
                tracing::debug!("Server `{}` connected", self.address);
            }
        })
    }

    pub(crate) fn request_check(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.request_check();
        }
    }

    /// Stops the monitor and closes the pool. Calling it again does nothing.
    pub(crate) async fn destroy(&self) {
        let closing = self.with_state(|s| {
            if matches!(s.state(), ConnectionState::Closing | ConnectionState::Closed) {
                return false;
            }
            s.transition(ConnectionState::Closing);
            true
        });
        if !closing {
            return;
        }

        if let Some(monitor) = &self.monitor {
            monitor.close();
        }
        self.pool.close().await;
        self.with_state(|s| s.transition(ConnectionState::Closed));
        tracing::debug!("Server `{}` destroyed", self.address);
    }

    /// Runs a command on this server and returns its reply. An `ok: 0` reply is returned as
    /// [`SdamError::Command`]; failures are reported to the topology before they are returned.
    #[instrument(level = "debug", name = "Server - Command", skip(self, command, options), fields(address = %self.address))]
    pub async fn command(
        &self,
        ns: &Namespace,
        mut command: Document,
        options: &CommandOptions,
    ) -> Result<Document, SdamError> {
        if self.is_closing() {
            return Err(SdamError::ServerClosed(self.address.clone()));
        }
        let description = self.description();
        if options.collation.is_some() && description.max_wire_version < COLLATION_MIN_WIRE_VERSION
        {
            return Err(SdamError::CollationNotSupported(self.address.clone()));
        }

        if description.max_wire_version >= CLUSTER_TIME_MIN_WIRE_VERSION {
            if let Some(cluster_time) = self.context.cluster_time() {
                let value = serde_json::to_value(&cluster_time)
                    .map_err(|e| SdamError::UnexpectedError(e.into()))?;
                command.insert("$clusterTime".to_string(), value);
            }
        }

        let result = self
            .pool
            .command(&ns.db, command)
            .await
            .and_then(|reply| {
                self.gossip_cluster_time(&reply);
                check_command_reply(reply)
            });

        if let Err(e) = &result {
            self.handle_error(e).await;
        }
        result
    }

    /// Runs `find` and returns the reply holding the first batch.
    pub async fn query(
        &self,
        ns: &Namespace,
        filter: Document,
        batch_size: Option<u32>,
        options: &CommandOptions,
    ) -> Result<Document, SdamError> {
        let command = find_command(ns, filter, batch_size, options.collation.as_ref())?;
        self.command(ns, command, options).await
    }

    pub async fn get_more(
        &self,
        ns: &Namespace,
        cursor_id: i64,
        batch_size: Option<u32>,
    ) -> Result<Document, SdamError> {
        let command = get_more_command(ns, cursor_id, batch_size)?;
        self.command(ns, command, &CommandOptions::default()).await
    }

    pub async fn kill_cursors(&self, ns: &Namespace, cursor_ids: &[i64]) -> Result<Document, SdamError> {
        let command = kill_cursors_command(ns, cursor_ids)?;
        self.command(ns, command, &CommandOptions::default()).await
    }

    pub async fn insert(
        &self,
        ns: &Namespace,
        documents: Vec<Document>,
        options: &CommandOptions,
    ) -> Result<Document, SdamError> {
        let command = insert_command(ns, documents, true)?;
        self.command(ns, command, options).await
    }

    pub async fn update(
        &self,
        ns: &Namespace,
        updates: Vec<Document>,
        options: &CommandOptions,
    ) -> Result<Document, SdamError> {
        let command = update_command(ns, updates, options.collation.as_ref())?;
        self.command(ns, command, options).await
    }

    pub async fn remove(
        &self,
        ns: &Namespace,
        deletes: Vec<Document>,
        options: &CommandOptions,
    ) -> Result<Document, SdamError> {
        let command = delete_command(ns, deletes, options.collation.as_ref())?;
        self.command(ns, command, options).await
    }

    fn gossip_cluster_time(&self, reply: &Document) {
        if let Some(cluster_time) = reply
            .get("$clusterTime")
            .cloned()
            .and_then(|v: Value| serde_json::from_value::<ClusterTime>(v).ok())
        {
            self.context.resolve_cluster_time(&cluster_time);
        }
    }

    /// Classifies an operation failure and updates the topology accordingly.
    async fn handle_error(&self, error: &SdamError) {
        if self.is_closing() {
            return;
        }

        if error.is_network_error() {
            if error.is_network_timeout() {
                tracing::debug!(
                    "Network timeout on `{}` leaves the server as is: {}",
                    self.address,
                    error
                );
                return;
            }
            if self.load_balanced {
                self.pool.clear().await;
                return;
            }
            tracing::info!(
                "Network error on `{}`, marking it unknown. Caused by: {}",
                self.address,
                error
            );
            if let Some(monitor) = &self.monitor {
                monitor.reset();
            }
            self.invalidate(error);
            self.pool.clear().await;
            return;
        }

        if !error.is_sdam_unrecoverable() || self.load_balanced {
            return;
        }

        let description = self.description();
        if compare_topology_version(description.topology_version.as_ref(), error.topology_version())
            >= 0
        {
            tracing::debug!(
                "Ignoring stale error from `{}`: {}",
                self.address,
                error
            );
            return;
        }

        tracing::info!(
            "`{}` is no longer usable as it was, marking it unknown. Caused by: {}",
            self.address,
            error
        );
        if description.max_wire_version <= POOL_CLEARING_MAX_WIRE_VERSION
            || error.is_node_shutting_down()
        {
            self.pool.clear().await;
        }
        self.invalidate(error);
        self.request_check();
    }

    fn invalidate(&self, error: &SdamError) {
        let description = self.description();
        self.context.invalidate_server(ServerDescription::from_error(
            self.address.clone(),
            error,
            description.topology_version.clone(),
        ));
    }
}
