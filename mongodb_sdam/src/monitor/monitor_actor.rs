use std::sync::{Arc, Mutex};

use tokio::{
    sync::watch,
    time::{sleep_until, Instant},
};
use tracing::{instrument, Span};
use uuid::Uuid;

use crate::{
    events::{
        EventBus, SdamEvent, ServerHeartbeatFailedEvent, ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::hello_command,
    pool,
    sdam_error::check_command_reply,
    state_machine::MonitorState,
    topology::TopologyContext,
    ConnectOptions, Connection, ConnectionPool, Connector, HelloReply, SdamError, ServerAddress,
    ServerDescription, ServerType, TopologyVersion,
};

use super::{
    add_rtt_sample, average_rtt, MonitorOptions, MonitorShared, RttPinger, RttTracker,
    SharedRttTracker,
};

#[derive(Debug)]
pub(crate) struct MonitorActor {
    address: ServerAddress,
    shared: Arc<MonitorShared>,
    connector: Box<dyn Connector>,
    pool: ConnectionPool,
    context: TopologyContext,
    events: EventBus,
    /// The server's description as the topology last published it.
    description: watch::Receiver<Arc<ServerDescription>>,
    options: MonitorOptions,
    connection: Option<Box<dyn Connection>>,
    /// Set once the handshake reply carried `helloOk: true`.
    use_hello: bool,
    /// Topology version from this monitor's last successful reply.
    topology_version: Option<TopologyVersion>,
    rtt: SharedRttTracker,
    pinger: Option<RttPinger>,
}

/// What one round of checking did, as far as scheduling the next round goes.
enum CheckOutcome {
    /// The next check may start right away.
    Immediate,
    Scheduled,
}

impl MonitorActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        address: ServerAddress,
        shared: Arc<MonitorShared>,
        connector: Box<dyn Connector>,
        pool: ConnectionPool,
        context: TopologyContext,
        events: EventBus,
        description: watch::Receiver<Arc<ServerDescription>>,
        options: MonitorOptions,
    ) -> Self {
        let rtt = Arc::new(Mutex::new(RttTracker::new(options.rtt_smoothing_factor)));
        Self {
            address,
            shared,
            connector,
            pool,
            context,
            events,
            description,
            options,
            connection: None,
            use_hello: false,
            topology_version: None,
            rtt,
            pinger: None,
        }
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.options.connect_timeout,
            monitoring: true,
        }
    }

    /// Checks the server, retrying once when a previously known server stops answering, and
    /// reports the result to the topology.
    #[instrument(
        level = "debug",
        name = "Monitor Actor - Check Server",
        skip(self),
        fields(address = %self.address, correlation_id)
    )]
    async fn check_server(&mut self) -> CheckOutcome {
        Span::current().record("correlation_id", Uuid::new_v4().to_string());
        let previous = self.description.borrow().clone();

        let first_error = match self.check_once().await {
            Ok(description) => return self.report_success(description),
            Err(e) => e,
        };

        self.stop_rtt_measurement();
        if previous.server_type == ServerType::Unknown {
            self.invalidate(first_error, previous.topology_version.clone())
                .await;
            return CheckOutcome::Scheduled;
        }

        tracing::info!(
            "Heartbeat to known server `{}` failed, retrying once. Caused by: {}",
            self.address,
            first_error
        );
        self.pool.clear().await;
        match self.check_once().await {
            Ok(description) => self.report_success(description),
            Err(e) => {
                tracing::debug!("Retried heartbeat to `{}` failed too: {}", self.address, e);
                self.stop_rtt_measurement();
                self.invalidate(first_error, previous.topology_version.clone())
                    .await;
                CheckOutcome::Scheduled
            }
        }
    }

    fn report_success(&mut self, description: ServerDescription) -> CheckOutcome {
        self.topology_version = description.topology_version.clone();
        let streaming = self.options.streaming && self.topology_version.is_some();
        self.context.server_heartbeat(description);
        if streaming {
            CheckOutcome::Immediate
        } else {
            CheckOutcome::Scheduled
        }
    }

    async fn invalidate(&mut self, error: SdamError, topology_version: Option<TopologyVersion>) {
        tracing::warn!(
            "Marking `{}` unknown after a failed heartbeat. Caused by: {}",
            self.address,
            error
        );
        self.pool.clear().await;
        self.context.invalidate_server(ServerDescription::from_error(
            self.address.clone(),
            &error,
            topology_version,
        ));
    }

    /// Runs a single heartbeat and turns its reply into a description.
    async fn check_once(&mut self) -> Result<ServerDescription, SdamError> {
        let awaited = self.connection.is_some()
            && self.options.streaming
            && self.topology_version.is_some();

        self.events
            .publish(SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                address: self.address.clone(),
                awaited,
            }));

        let started = std::time::Instant::now();
        let result = self
            .run_hello(awaited)
            .await
            .and_then(|reply| HelloReply::parse(&reply).map(|parsed| (reply, parsed)));
        let duration = started.elapsed();

        match result {
            Ok((reply, parsed)) => {
                if awaited {
                    if self.pinger.is_none() {
                        self.pinger = Some(RttPinger::start(
                            self.address.clone(),
                            self.connector.clone(),
                            self.connect_options(),
                            self.options.heartbeat_frequency,
                            self.rtt.clone(),
                        ));
                    }
                } else {
                    add_rtt_sample(&self.rtt, duration);
                }
                self.use_hello = self.use_hello || parsed.hello_ok;

                tracing::trace!("Heartbeat to `{}` succeeded in {:?}", self.address, duration);
                self.events
                    .publish(SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                        address: self.address.clone(),
                        duration,
                        reply,
                        awaited,
                    }));
                Ok(ServerDescription::from_hello(
                    self.address.clone(),
                    &parsed,
                    average_rtt(&self.rtt),
                    false,
                ))
            }
            Err(e) => {
                if let Some(mut connection) = self.connection.take() {
                    connection.destroy(true).await;
                }
                self.events
                    .publish(SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                        address: self.address.clone(),
                        duration,
                        failure: e.to_string(),
                        awaited,
                    }));
                Err(e)
            }
        }
    }

    async fn run_hello(&mut self, awaited: bool) -> Result<crate::Document, SdamError> {
        if self.connection.is_none() {
            let connection =
                pool::connect(&*self.connector, &self.address, &self.connect_options()).await?;
            self.connection = Some(connection);
            self.use_hello = false;
        }

        let heartbeat = self.options.heartbeat_frequency;
        let command = match (awaited, self.topology_version.as_ref()) {
            (true, Some(topology_version)) => {
                hello_command(self.use_hello, Some((topology_version, heartbeat)))
            }
            _ => hello_command(self.use_hello, None),
        };
        let timeout = if awaited {
            self.options.connect_timeout + heartbeat
        } else {
            self.options.connect_timeout
        };

        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| SdamError::network("monitoring connection is not established"))?;
        match tokio::time::timeout(timeout, connection.command("admin", command)).await {
            Ok(reply) => check_command_reply(reply?),
            Err(_) => Err(SdamError::network_timeout(format!(
                "heartbeat to `{}` timed out after {} ms",
                self.address,
                timeout.as_millis()
            ))),
        }
    }

    fn stop_rtt_measurement(&mut self) {
        self.pinger = None;
        self.topology_version = None;
        match self.rtt.lock() {
            Ok(mut rtt) => rtt.reset(),
            Err(poisoned) => poisoned.into_inner().reset(),
        }
    }

    async fn reset_connection(&mut self) {
        self.shared.cycle_for_reset();
        self.pinger = None;
        if let Some(mut connection) = self.connection.take() {
            connection.destroy(true).await;
        }
    }

    async fn shut_down(&mut self) {
        self.pinger = None;
        if let Some(mut connection) = self.connection.take() {
            connection.destroy(false).await;
        }
        self.shared.finish();
        tracing::debug!("Monitor for `{}` stopped", self.address);
    }
}

enum Wake {
    Check,
    Reset,
    Shutdown,
}

/// Waits until the next check is due: `deadline`, or an explicit request, but never before
/// `floor`.
async fn wait_for_check(shared: &MonitorShared, deadline: Instant, floor: Instant) -> Wake {
    tokio::select! {
        _ = sleep_until(deadline) => return Wake::Check,
        _ = shared.check_requested.notified() => {},
        _ = shared.reset_requested.notified() => return Wake::Reset,
        _ = shared.shutdown.notified() => return Wake::Shutdown,
    }

    tokio::select! {
        _ = sleep_until(floor) => Wake::Check,
        _ = shared.reset_requested.notified() => Wake::Reset,
        _ = shared.shutdown.notified() => Wake::Shutdown,
    }
}

#[instrument(level = "debug", name = "Running Monitor Actor", skip(actor), fields(address = %actor.address))]
pub(crate) async fn run_monitor_actor(mut actor: MonitorActor) {
    let shared = actor.shared.clone();
    let heartbeat = actor.options.heartbeat_frequency;
    let min_heartbeat = actor.options.min_heartbeat_frequency;
    let mut outcome = CheckOutcome::Immediate;
    let mut last_started: Option<Instant> = None;

    loop {
        if let Some(last_started) = last_started {
            let floor = last_started + min_heartbeat;
            let deadline = match outcome {
                CheckOutcome::Immediate => floor,
                CheckOutcome::Scheduled => last_started + heartbeat,
            };
            shared.enter(MonitorState::Idle);
            match wait_for_check(&shared, deadline, floor).await {
                Wake::Check => {}
                Wake::Reset => actor.reset_connection().await,
                Wake::Shutdown => break,
            }
        }

        shared.enter(MonitorState::Monitoring);
        last_started = Some(Instant::now());

        let mut reset = false;
        let mut shutdown = false;
        tokio::select! {
            checked = actor.check_server() => outcome = checked,
            _ = shared.reset_requested.notified() => reset = true,
            _ = shared.shutdown.notified() => shutdown = true,
        }

        if shutdown {
            break;
        }
        if reset {
            actor.reset_connection().await;
            // Check again right away on a fresh connection.
            last_started = None;
        }
    }

    actor.shut_down().await;
}
