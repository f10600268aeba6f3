//! An in-memory deployment for driving a topology end to end.
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, Once},
    time::Duration,
};

use async_trait::async_trait;
use mongodb_sdam::{
    command_name, ConnectOptions, Connection, Connector, Document, SdamError, ServerAddress,
    SrvRecord, SrvResolver, Topology, TopologyBuilder, TopologyDescription,
};
use serde_json::{json, Value};
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

static TRACING: Once = Once::new();

/// Logs as bunyan JSON when `TEST_LOG` is set.
pub fn init_tracing() {
    TRACING.call_once(|| {
        if std::env::var("TEST_LOG").is_err() {
            return;
        }
        let _ = LogTracer::init();
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let subscriber = Registry::default()
            .with(env_filter)
            .with(JsonStorageLayer)
            .with(BunyanFormattingLayer::new("mongodb_sdam_test".into(), std::io::stdout));
        let _ = set_global_default(subscriber);
    });
}

/// What a node does with the next application command.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(Value),
    NetworkError,
}

#[derive(Debug, Default)]
struct ClusterState {
    /// Heartbeat reply per node. A node that is missing refuses connections.
    nodes: HashMap<String, Value>,
    scripted: HashMap<String, VecDeque<Scripted>>,
    commands: Vec<(String, Document)>,
}

/// A whole deployment behind one [`Connector`].
#[derive(Debug, Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node(&self, address: &str, hello_reply: Value) {
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert(address.to_string(), hello_reply);
    }

    pub fn remove_node(&self, address: &str) {
        self.state.lock().unwrap().nodes.remove(address);
    }

    /// Queues the outcome of the next application command sent to `address`.
    pub fn script(&self, address: &str, outcome: Scripted) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(address.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Application commands `address` received, heartbeats excluded.
    pub fn commands(&self, address: &str) -> Vec<Document> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(a, c)| a == address && !is_heartbeat(c))
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn heartbeat_count(&self, address: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(a, c)| a == address && is_heartbeat(c))
            .count()
    }

    /// Commands named `name` that `address` received, heartbeats included.
    pub fn command_count(&self, address: &str, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(a, c)| a == address && command_name(c) == Some(name))
            .count()
    }

    fn handle(&self, address: &str, command: Document) -> Result<Document, SdamError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push((address.to_string(), command.clone()));

        if is_heartbeat(&command) {
            return match state.nodes.get(address) {
                Some(reply) => Ok(as_document(reply.clone())),
                None => Err(SdamError::network(format!("{} is down", address))),
            };
        }
        if !state.nodes.contains_key(address) {
            return Err(SdamError::network(format!("{} is down", address)));
        }

        match state.scripted.get_mut(address).and_then(VecDeque::pop_front) {
            Some(Scripted::Reply(reply)) => Ok(as_document(reply)),
            Some(Scripted::NetworkError) => Err(SdamError::network("connection reset by peer")),
            None => Ok(default_reply(&command)),
        }
    }
}

#[async_trait]
impl Connector for FakeCluster {
    async fn connect(
        &self,
        address: &ServerAddress,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, SdamError> {
        let address = address.to_string();
        if !self.state.lock().unwrap().nodes.contains_key(&address) {
            return Err(SdamError::network(format!("connection to {} refused", address)));
        }
        Ok(Box::new(FakeConnection {
            address,
            cluster: self.clone(),
        }))
    }
}

#[derive(Debug)]
struct FakeConnection {
    address: String,
    cluster: FakeCluster,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn command(&mut self, _db: &str, command: Document) -> Result<Document, SdamError> {
        let awaitable = command.contains_key("maxAwaitTimeMS");
        let reply = self.cluster.handle(&self.address, command);
        if awaitable {
            // Nothing ever changes on a fake node, so an awaited heartbeat never returns.
            std::future::pending::<()>().await;
        }
        reply
    }

    async fn destroy(&mut self, _force: bool) {}
}

fn is_heartbeat(command: &Document) -> bool {
    matches!(command_name(command), Some("hello") | Some("isMaster"))
}

fn as_document(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn default_reply(command: &Document) -> Document {
    let reply = match command_name(command) {
        Some("insert") | Some("update") | Some("delete") => json!({"ok": 1, "n": 1}),
        Some("find") => json!({"ok": 1, "cursor": {"id": 0, "firstBatch": []}}),
        _ => json!({"ok": 1}),
    };
    as_document(reply)
}

pub fn doc(value: Value) -> Document {
    as_document(value)
}

pub fn standalone() -> Value {
    json!({
        "ok": 1, "isWritablePrimary": true, "helloOk": true,
        "maxWireVersion": 17, "minWireVersion": 0, "logicalSessionTimeoutMinutes": 30
    })
}

/// A standalone that reports a topology version, which makes its monitor stream.
pub fn streaming_standalone() -> Value {
    json!({
        "ok": 1, "isWritablePrimary": true, "helloOk": true,
        "topologyVersion": {"processId": {"$oid": "000000000000000000000001"}, "counter": 0},
        "maxWireVersion": 17, "minWireVersion": 0, "logicalSessionTimeoutMinutes": 30
    })
}

pub fn primary(set_name: &str, hosts: &[&str]) -> Value {
    json!({
        "ok": 1, "isWritablePrimary": true, "helloOk": true, "setName": set_name,
        "hosts": hosts, "setVersion": 1, "electionId": {"$oid": "7fffffff0000000000000001"},
        "maxWireVersion": 17, "minWireVersion": 0, "logicalSessionTimeoutMinutes": 30
    })
}

pub fn secondary(set_name: &str, hosts: &[&str]) -> Value {
    json!({
        "ok": 1, "isWritablePrimary": false, "secondary": true, "helloOk": true,
        "setName": set_name, "hosts": hosts, "setVersion": 1,
        "maxWireVersion": 17, "minWireVersion": 0, "logicalSessionTimeoutMinutes": 30
    })
}

pub fn mongos() -> Value {
    json!({
        "ok": 1, "isWritablePrimary": true, "msg": "isdbgrid", "helloOk": true,
        "maxWireVersion": 17, "minWireVersion": 0, "logicalSessionTimeoutMinutes": 30
    })
}

/// SRV answers that a test can change while a topology polls them.
#[derive(Debug, Clone, Default)]
pub struct FakeSrvRecords {
    records: Arc<Mutex<Vec<SrvRecord>>>,
}

impl FakeSrvRecords {
    pub fn new(hosts: &[&str]) -> Self {
        let records = Self::default();
        records.set(hosts);
        records
    }

    /// Replaces the published records with `hosts`, each given as `target:port`.
    pub fn set(&self, hosts: &[&str]) {
        let records = hosts
            .iter()
            .map(|host| {
                let address = ServerAddress::parse(host).unwrap();
                SrvRecord {
                    target: address.host().to_string(),
                    port: address.port(),
                }
            })
            .collect();
        *self.records.lock().unwrap() = records;
    }
}

#[async_trait]
impl SrvResolver for FakeSrvRecords {
    async fn resolve_srv(&self, _name: &str) -> Result<Vec<SrvRecord>, SdamError> {
        Ok(self.records.lock().unwrap().clone())
    }
}

/// A builder with fast heartbeats, ready for `set_hosts`.
pub fn fast_builder(cluster: &FakeCluster) -> TopologyBuilder {
    init_tracing();
    TopologyBuilder::new()
        .set_connector(cluster.clone())
        .set_heartbeat_frequency(Duration::from_millis(50))
        .set_min_heartbeat_frequency(Duration::from_millis(10))
        .set_server_selection_timeout(Duration::from_secs(2))
        .set_connect_timeout(Duration::from_millis(500))
}

/// Polls the description until `predicate` holds, for at most two seconds.
pub async fn wait_for(
    topology: &Topology,
    predicate: impl Fn(&TopologyDescription) -> bool,
) -> Arc<TopologyDescription> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let description = topology.description();
        if predicate(&description) {
            return description;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached, last description: {:?}", description);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
