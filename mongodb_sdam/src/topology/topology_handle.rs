use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::instrument;

use crate::{
    events::EventBus, is_retryable_write_command, operation::supports_retryable_writes,
    session::SessionPool, ClientSession, CommandOptions, Cursor, Document, Namespace,
    ReadPreference, SdamEvent, SdamError, Server, ServerSelector, TopologyDescription,
    TopologyOptions,
};

use super::{
    initial_description, run_topology_actor, SelectServerOptions, TopologyActor, TopologyId,
    TopologyInitialConfiguration, TopologyMessage,
};

/// How long `close()` waits for a server to send `endSessions` to.
const END_SESSIONS_SELECTION_TIMEOUT: Duration = Duration::from_secs(1);
/// Most session ids a single `endSessions` may carry.
const END_SESSIONS_BATCH_SIZE: usize = 10_000;

/**
A handle to the topology actor.

Only one topology should exist per deployment. Cloning this handle is cheap and does not start a
new actor; clone it into every component that needs to run operations. When the last handle is
dropped the actor closes the topology and stops.

```no_run
# async fn run(connector: impl mongodb_sdam::Connector + 'static) -> Result<(), mongodb_sdam::SdamError> {
use mongodb_sdam::{CommandOptions, Namespace, TopologyBuilder};
use serde_json::json;

let topology = TopologyBuilder::new()
    .set_hosts(&["localhost:27017"])
    .set_connector(connector)
    .build()?;
topology.connect().await?;

let document = json!({"name": "ada"}).as_object().cloned().unwrap_or_default();
topology
    .insert(&Namespace::new("app", "people"), vec![document], CommandOptions::default(), None)
    .await?;
# Ok(())
# }
```
*/
#[derive(Clone, Debug)]
pub struct Topology {
    id: TopologyId,
    sender: mpsc::Sender<TopologyMessage>,
    description: watch::Receiver<Arc<TopologyDescription>>,
    events: EventBus,
    sessions: SessionPool,
    options: Arc<TopologyOptions>,
}

impl Topology {
    // Only the builder creates topologies. Must be called from within a tokio runtime.
    pub(crate) fn new(initial_config: TopologyInitialConfiguration) -> Self {
        let (sender, receiver) = mpsc::channel(8);
        let (description_tx, description) = watch::channel(Arc::new(initial_description(
            &initial_config.options,
            &initial_config.seeds,
        )));
        let events = EventBus::new();
        let id = initial_config.topology_id;
        let options = initial_config.options.clone();

        let actor = TopologyActor::new(receiver, initial_config, description_tx, events.clone());
        tokio::spawn(run_topology_actor(actor));

        Self {
            id,
            sender,
            description,
            events,
            sessions: SessionPool::new(),
            options,
        }
    }

    pub fn id(&self) -> TopologyId {
        self.id
    }

    pub fn options(&self) -> &TopologyOptions {
        &self.options
    }

    /// A snapshot of the current description. It never changes; later updates replace it.
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.description.borrow().clone()
    }

    /// Receives every [`SdamEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SdamEvent> {
        self.events.subscribe()
    }

    async fn send(&self, message: TopologyMessage) -> Result<(), SdamError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SdamError::TopologyClosed)
    }

    /// Starts monitoring every seed and returns once a server is available for a
    /// `primaryPreferred` read. When none shows up in time the topology is closed again and
    /// the selection error is returned.
    #[instrument(level = "debug", name = "Actor Handle - Connect", skip(self), fields(topology_id = %self.id))]
    pub async fn connect(&self) -> Result<(), SdamError> {
        tracing::trace!("Creating oneshot channel");
        let (tx, rx) = oneshot::channel();

        tracing::trace!("Sending message to actor");
        self.send(TopologyMessage::Connect { respond_to: tx }).await?;

        tracing::trace!("Waiting for oneshot to return");
        rx.await.map_err(|_| SdamError::TopologyClosed)?
    }

    /// Ends pooled sessions on the server, fails every pending selection and stops every
    /// server. Closing a closed topology does nothing.
    #[instrument(level = "debug", name = "Actor Handle - Close", skip(self), fields(topology_id = %self.id))]
    pub async fn close(&self) -> Result<(), SdamError> {
        let session_ids = self.sessions.drain_ids();
        if !session_ids.is_empty() {
            self.end_sessions(session_ids).await;
        }

        let (tx, rx) = oneshot::channel();
        self.send(TopologyMessage::Close { respond_to: tx }).await?;
        rx.await.map_err(|_| SdamError::TopologyClosed)?
    }

    /// Best effort; failures are only logged.
    async fn end_sessions(&self, session_ids: Vec<Value>) {
        if self.description().logical_session_timeout_minutes.is_none() {
            return;
        }
        let options = SelectServerOptions {
            server_selection_timeout: Some(END_SESSIONS_SELECTION_TIMEOUT),
            pinned_server: None,
        };
        let server = match self
            .select_server(ReadPreference::primary_preferred().into(), options)
            .await
        {
            Ok(server) => server,
            Err(e) => {
                tracing::debug!("No server to end {} sessions on: {}", session_ids.len(), e);
                return;
            }
        };

        let admin = Namespace::database("admin");
        for batch in session_ids.chunks(END_SESSIONS_BATCH_SIZE) {
            let mut command = Document::new();
            command.insert("endSessions".to_string(), Value::Array(batch.to_vec()));
            if let Err(e) = server
                .command(&admin, command, &CommandOptions::default())
                .await
            {
                tracing::debug!("endSessions on `{}` failed: {}", server.address(), e);
            }
        }
    }

    /// Waits for a server that satisfies `selector`, up to the server selection timeout.
    #[instrument(level = "debug", name = "Actor Handle - Select Server", skip(self))]
    pub async fn select_server(
        &self,
        selector: ServerSelector,
        options: SelectServerOptions,
    ) -> Result<Arc<Server>, SdamError> {
        let (tx, rx) = oneshot::channel();
        self.send(TopologyMessage::SelectServer {
            selector,
            options,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SdamError::TopologyClosed)?
    }

    /// Starts a logical session, reusing a pooled server session when one is still fresh.
    pub fn start_session(&self) -> ClientSession {
        let timeout = self
            .description()
            .logical_session_timeout_minutes
            .map(|minutes| Duration::from_secs(minutes.max(0) as u64 * 60));
        ClientSession::new(self.sessions.acquire(timeout), self.sessions.clone())
    }

    /// Runs a command. Writes go to a writable server; anything else follows
    /// `options.read_preference`, primary by default.
    pub async fn command(
        &self,
        ns: &Namespace,
        command: Document,
        options: CommandOptions,
        session: Option<&mut ClientSession>,
    ) -> Result<Document, SdamError> {
        self.execute(ns, command, &options, session).await
    }

    pub async fn insert(
        &self,
        ns: &Namespace,
        documents: Vec<Document>,
        options: CommandOptions,
        session: Option<&mut ClientSession>,
    ) -> Result<Document, SdamError> {
        let command = crate::insert_command(ns, documents, true)?;
        self.execute(ns, command, &options, session).await
    }

    pub async fn update(
        &self,
        ns: &Namespace,
        updates: Vec<Document>,
        options: CommandOptions,
        session: Option<&mut ClientSession>,
    ) -> Result<Document, SdamError> {
        let command = crate::update_command(ns, updates, options.collation.as_ref())?;
        self.execute(ns, command, &options, session).await
    }

    pub async fn remove(
        &self,
        ns: &Namespace,
        deletes: Vec<Document>,
        options: CommandOptions,
        session: Option<&mut ClientSession>,
    ) -> Result<Document, SdamError> {
        let command = crate::delete_command(ns, deletes, options.collation.as_ref())?;
        self.execute(ns, command, &options, session).await
    }

    /// Runs `find` and returns a cursor over its results, bound to the server that answered.
    pub async fn cursor(
        &self,
        ns: Namespace,
        filter: Document,
        batch_size: Option<u32>,
        options: CommandOptions,
    ) -> Result<Cursor, SdamError> {
        let selector = options
            .read_preference
            .clone()
            .unwrap_or_else(ReadPreference::primary)
            .into();
        let server = self
            .select_server(
                selector,
                SelectServerOptions {
                    server_selection_timeout: options.server_selection_timeout,
                    pinned_server: None,
                },
            )
            .await?;
        let reply = server.query(&ns, filter, batch_size, &options).await?;
        Cursor::new(ns, server, &reply, batch_size)
    }

    /// Selects a server and runs the command, retrying a retryable write once.
    #[instrument(level = "debug", name = "Actor Handle - Execute", skip(self, command, options, session), fields(ns = %ns))]
    async fn execute(
        &self,
        ns: &Namespace,
        mut command: Document,
        options: &CommandOptions,
        session: Option<&mut ClientSession>,
    ) -> Result<Document, SdamError> {
        let is_write = is_retryable_write_command(&command);
        let selector = match (&options.read_preference, is_write) {
            (Some(read_preference), false) => read_preference.clone().into(),
            _ => ServerSelector::Writable,
        };
        let select_options = SelectServerOptions {
            server_selection_timeout: options.server_selection_timeout,
            pinned_server: session
                .as_ref()
                .and_then(|s| s.pinned_server().cloned()),
        };

        let server = self
            .select_server(selector, select_options.clone())
            .await?;
        let description = self.description();

        let mut implicit_session = None;
        let mut session = match session {
            Some(session) => Some(session),
            None if is_write => Some(implicit_session.insert(self.start_session())),
            None => None,
        };

        let retryable = is_write
            && options.retry_writes.unwrap_or(self.options.retry_writes)
            && session.as_ref().map_or(false, |s| !s.in_transaction())
            && supports_retryable_writes(&server.description(), &description);

        if let Some(session) = session.as_deref_mut() {
            if description.logical_session_timeout_minutes.is_some() {
                command.insert("lsid".to_string(), session.lsid());
                session.mark_used();
            }
            if retryable {
                let txn_number = session.increment_txn_number();
                command.insert("txnNumber".to_string(), json!(txn_number));
            }
        }

        let retry_command = if retryable { Some(command.clone()) } else { None };
        let error = match server.command(ns, command, options).await {
            Ok(reply) => return Ok(reply),
            Err(e) => e,
        };
        if error.is_network_error() {
            if let Some(session) = session.as_deref_mut() {
                session.mark_dirty();
            }
        }

        let Some(command) = retry_command else {
            return Err(error);
        };
        if !error.is_retryable_write_error() {
            return Err(error);
        }

        tracing::info!(
            "Retrying write on `{}` after a retryable error: {}",
            ns,
            error
        );
        let server = match self
            .select_server(ServerSelector::Writable, select_options)
            .await
        {
            Ok(server) => server,
            Err(e) => {
                tracing::debug!("No server for the retry, returning the original error: {}", e);
                return Err(error);
            }
        };
        if !supports_retryable_writes(&server.description(), &self.description()) {
            return Err(error);
        }

        let result = server.command(ns, command, options).await;
        if let Err(e) = &result {
            if e.is_network_error() {
                if let Some(session) = session.as_deref_mut() {
                    session.mark_dirty();
                }
            }
        }
        result
    }
}
